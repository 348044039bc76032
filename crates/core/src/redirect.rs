use axum::http::{header, HeaderMap};

/// Decides whether a client can be sent to the wait endpoint with a
/// temporary redirect instead of being held on the original request.
pub trait RedirectPolicy: Send + Sync {
    fn follows_redirects(&self, headers: &HeaderMap) -> bool;
}

/// Clients whose user agent starts with one of the prefixes are assumed not
/// to re-send a multipart body after a 307, and get a synchronous response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentDenylist {
    prefixes: Vec<String>,
}

impl UserAgentDenylist {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

impl Default for UserAgentDenylist {
    fn default() -> Self {
        // the mobile app's HTTP stack
        Self::new(["Dart/"])
    }
}

impl RedirectPolicy for UserAgentDenylist {
    fn follows_redirects(&self, headers: &HeaderMap) -> bool {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        !self
            .prefixes
            .iter()
            .any(|prefix| user_agent.starts_with(prefix.as_str()))
    }
}
