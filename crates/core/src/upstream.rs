use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use axum::http::uri::PathAndQuery;
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::response::Response;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use url::Url;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// A multipart upload rebuilt around a local file.
#[derive(Debug, Clone)]
pub struct UploadForm {
    /// Non-file fields, in the order they were received.
    pub fields: Vec<(String, String)>,
    pub file_key: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
}

/// HTTP client for the media server the proxy sits in front of.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base_url: Url,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path_and_query: Option<&PathAndQuery>) -> Url {
        let (path, query) = path_and_query
            .map(|pq| (pq.path(), pq.query()))
            .unwrap_or(("/", None));

        join_under(&self.base_url, path, query)
    }

    /// Sends `form` to the same method and path the client used, with the
    /// client's headers minus the ones describing the old body.
    pub async fn forward_upload(
        &self,
        method: Method,
        path_and_query: Option<&PathAndQuery>,
        headers: &HeaderMap,
        form: &UploadForm,
    ) -> Result<reqwest::Response> {
        let file = tokio::fs::File::open(&form.file_path)
            .await
            .with_context(|| format!("unable to open file: {}", form.file_path.display()))?;

        let mime = mime_guess::from_path(&form.file_name).first_or_octet_stream();
        let part = Part::stream_with_length(reqwest::Body::from(file), form.file_size)
            .file_name(form.file_name.clone())
            .mime_str(mime.as_ref())
            .context("invalid file content type")?;

        let multipart = form
            .fields
            .iter()
            .fold(Form::new(), |multipart, (name, value)| {
                multipart.text(name.clone(), value.clone())
            })
            .part(form.file_key.clone(), part);

        let mut forwarded = forwardable(headers);
        forwarded.remove(header::CONTENT_TYPE);
        forwarded.remove(header::CONTENT_LENGTH);

        self.client
            .request(method, self.url(path_and_query))
            .headers(forwarded)
            .multipart(multipart)
            .send()
            .await
            .context("unable to send upload request upstream")
    }

    /// Streams a request to the upstream unchanged.
    pub async fn proxy(&self, request: Request) -> Result<reqwest::Response> {
        let (parts, body) = request.into_parts();
        let url = self.url(parts.uri.path_and_query());

        self.client
            .request(parts.method, url)
            .headers(forwardable(&parts.headers))
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .context("unable to reach upstream")
    }
}

/// Appends `path` to whatever path `base` already carries, so a server
/// mounted under a prefix keeps it.
pub(crate) fn join_under(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    url.set_path(&format!("{base_path}/{path}"));
    url.set_query(query);
    url
}

/// Relays an upstream response back to the client, streaming the body.
pub fn into_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(header::HOST);
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}
