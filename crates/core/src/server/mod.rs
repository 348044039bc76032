//! HTTP front: intercepts matching multipart uploads, proxies everything
//! else, and serves the wait endpoint redirected clients poll.

mod intercept;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::jobs::{JobRegistry, WaitOutcome};
use crate::pipeline::Pipeline;
use crate::redirect::RedirectPolicy;
use crate::upstream::{self, UpstreamClient};

pub use intercept::UploadError;

pub const WAIT_PATH: &str = "/_immich-upload-optimizer/wait";
pub const PROCESSING_FAILED_MESSAGE: &str = "failed to process file, view logs for more info";

pub fn wait_url(job_id: &str) -> String {
    format!("{WAIT_PATH}?job={job_id}")
}

/// Which requests are treated as uploads to optimize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFilter {
    path_pattern: String,
    form_key: String,
}

impl UploadFilter {
    pub fn new(path_pattern: impl Into<String>, form_key: impl Into<String>) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            form_key: form_key.into(),
        }
    }

    pub fn form_key(&self) -> &str {
        &self.form_key
    }

    pub fn intercepts(&self, path: &str, headers: &HeaderMap) -> bool {
        let is_multipart = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/form-data"));

        is_multipart && path_matches(&self.path_pattern, path)
    }
}

/// Shell-style match applied per `/`-separated segment: `*` matches any run
/// within one segment and `?` a single character.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();

    pattern_segments.len() == path_segments.len()
        && pattern_segments
            .iter()
            .zip(&path_segments)
            .all(|(pattern, segment)| segment_matches(pattern.as_bytes(), segment.as_bytes()))
}

fn segment_matches(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(b'?') => {
                p += 1;
                t += 1;
            }
            Some(&ch) if ch == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|ch| *ch == b'*')
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pipeline: Pipeline,
    jobs: Arc<JobRegistry>,
    upstream: UpstreamClient,
    filter: UploadFilter,
    redirect_policy: Arc<dyn RedirectPolicy>,
    spool_dir: PathBuf,
}

impl AppState {
    pub fn new(
        pipeline: Pipeline,
        jobs: Arc<JobRegistry>,
        upstream: UpstreamClient,
        filter: UploadFilter,
        redirect_policy: Arc<dyn RedirectPolicy>,
    ) -> Self {
        let spool_dir = pipeline.work_dir().to_path_buf();
        Self {
            inner: Arc::new(AppStateInner {
                pipeline,
                jobs,
                upstream,
                filter,
                redirect_policy,
                spool_dir,
            }),
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.inner.jobs
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route(WAIT_PATH, any(wait_for_job))
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub job: Option<String>,
}

async fn wait_for_job(State(state): State<AppState>, Query(query): Query<WaitQuery>) -> Response {
    let Some(job_id) = query.job.filter(|id| !id.is_empty()) else {
        return AppError::BadRequest("job not found".to_string()).into_response();
    };

    let span = info_span!("job", job_id = %job_id);
    async {
        match state.inner.jobs.wait(&job_id).await {
            WaitOutcome::NotFound => AppError::BadRequest("job not found".to_string()).into_response(),
            WaitOutcome::Ready(response) => {
                info!(status = response.status().as_u16(), "sending job result to client");
                response
            }
            WaitOutcome::StillRunning => {
                info!("still running, redirecting to avoid client timeout");
                Redirect::temporary(&wait_url(&job_id)).into_response()
            }
            WaitOutcome::Closed => {
                warn!("job ended without a result");
                AppError::Internal("job channel closed unexpectedly".to_string()).into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    if state
        .inner
        .filter
        .intercepts(request.uri().path(), request.headers())
    {
        return intercept::handle_upload(state, request).await;
    }

    debug!(method = %request.method(), uri = %request.uri(), "proxy request");
    match state.inner.upstream.proxy(request).await {
        Ok(upstream) => upstream::into_response(upstream),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "proxy request failed");
            AppError::BadGateway(format!("{err:#}")).into_response()
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::extract::Multipart;
    use axum::http::{HeaderValue, Method};
    use axum::routing::post;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tower::ServiceExt;
    use url::Url;

    use crate::gate::ConcurrencyGate;
    use crate::jobs::ContinuationTimeouts;
    use crate::redirect::UserAgentDenylist;
    use crate::task::{TaskDefinition, TaskList};

    const BOUNDARY: &str = "X-TEST-BOUNDARY";
    const MOBILE_AGENT: &str = "Dart/3.5 (dart:io)";
    const BROWSER_AGENT: &str = "Mozilla/5.0";

    #[derive(Debug, Default, Clone)]
    struct Received {
        fields: Vec<(String, String)>,
        file_name: String,
        file_len: usize,
        api_key: Option<String>,
    }

    type Uploads = Arc<Mutex<Vec<Received>>>;

    async fn fake_assets(
        State(uploads): State<Uploads>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> impl IntoResponse {
        let mut received = Received {
            api_key: headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ..Received::default()
        };
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            if let Some(file_name) = field.file_name().map(str::to_string) {
                received.file_name = file_name;
                received.file_len = field.bytes().await.unwrap().len();
            } else {
                received.fields.push((name, field.text().await.unwrap()));
            }
        }
        let body = format!("{{\"id\":\"asset\",\"name\":\"{}\"}}", received.file_name);
        uploads.lock().unwrap().push(received);
        (StatusCode::CREATED, body)
    }

    async fn fake_other(request: Request) -> String {
        format!("upstream saw {} {}", request.method(), request.uri())
    }

    struct Harness {
        config_dir: TempDir,
        _work_dir: TempDir,
        router: Router,
        uploads: Uploads,
        state: AppState,
    }

    async fn harness(tasks: Vec<TaskDefinition>, timeouts: ContinuationTimeouts) -> Harness {
        let uploads: Uploads = Arc::default();
        let upstream_app = Router::new()
            .route("/api/assets", post(fake_assets))
            .fallback(fake_other)
            .layer(DefaultBodyLimit::disable())
            .with_state(Arc::clone(&uploads));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream_app).await.unwrap();
        });

        let config_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let tasks = TaskList::new(tasks, config_dir.path().to_path_buf()).unwrap();
        let pipeline = Pipeline::new(
            Arc::new(tasks),
            ConcurrencyGate::new(2),
            work_dir.path().to_path_buf(),
        );
        let state = AppState::new(
            pipeline,
            Arc::new(JobRegistry::new(timeouts)),
            UpstreamClient::new(Url::parse(&format!("http://{addr}")).unwrap()).unwrap(),
            UploadFilter::new("/api/assets", "assetData"),
            Arc::new(UserAgentDenylist::default()),
        );

        Harness {
            config_dir,
            _work_dir: work_dir,
            router: app_router(state.clone()),
            uploads,
            state,
        }
    }

    fn heic_to_jxl() -> TaskDefinition {
        TaskDefinition::new(
            "heic-to-jxl",
            &["heic"],
            "head -c 1048576 {{.src_folder}}/{{.name}}.{{.extension}} > {{.dst_folder}}/{{.name}}.jxl",
        )
        .unwrap()
    }

    fn upload_request(agent: &str, file_name: &str, data: &[u8]) -> Request {
        let mut body = Vec::new();
        for (name, value) in [("deviceAssetId", "photo-1"), ("deviceId", "phone")] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"assetData\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/api/assets")
            .header(header::USER_AGENT, agent)
            .header("x-api-key", "secret")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn wait_request(location: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(location)
            .header(header::USER_AGENT, BROWSER_AGENT)
            .body(Body::empty())
            .unwrap()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn mobile_upload_is_replaced_with_smaller_result() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;
        let original = vec![7u8; 5 * 1024 * 1024];

        let response = h
            .router
            .clone()
            .oneshot(upload_request(MOBILE_AGENT, "photo.heic", &original))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(body_text(response).await.contains("photo.jxl"));

        let uploads = h.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].file_name, "photo.jxl");
        assert_eq!(uploads[0].file_len, 1024 * 1024);
        assert_eq!(uploads[0].api_key.as_deref(), Some("secret"));
        assert_eq!(
            uploads[0].fields,
            vec![
                ("deviceAssetId".to_string(), "photo-1".to_string()),
                ("deviceId".to_string(), "phone".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn larger_result_keeps_the_original() {
        let grow = TaskDefinition::new(
            "grow",
            &["jpg"],
            "cat {{.src_folder}}/{{.name}}.jpg {{.src_folder}}/{{.name}}.jpg > {{.dst_folder}}/{{.name}}.avif",
        )
        .unwrap();
        let h = harness(vec![grow], ContinuationTimeouts::default()).await;

        let response = h
            .router
            .clone()
            .oneshot(upload_request(MOBILE_AGENT, "IMG.JPG", b"0123456789"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let uploads = h.uploads.lock().unwrap().clone();
        assert_eq!(uploads[0].file_name, "IMG.JPG");
        assert_eq!(uploads[0].file_len, 10);
    }

    #[tokio::test]
    async fn redirect_client_collects_result_from_wait_endpoint() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;

        let response = h
            .router
            .clone()
            .oneshot(upload_request(BROWSER_AGENT, "photo.heic", &vec![1u8; 4096]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let wait = location(&response);
        assert!(wait.starts_with(&format!("{WAIT_PATH}?job=")));

        let response = h.router.clone().oneshot(wait_request(&wait)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(body_text(response).await.contains("photo.jxl"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.state.jobs().is_empty());
        assert_eq!(h.state.jobs().retired_count(), 1);
    }

    #[tokio::test]
    async fn unmatched_extension_fails_for_mobile_client() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;

        let response = h
            .router
            .clone()
            .oneshot(upload_request(MOBILE_AGENT, "video.mp4", b"video"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains(PROCESSING_FAILED_MESSAGE));
        assert!(h.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_extension_retires_redirected_job() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;

        let response = h
            .router
            .clone()
            .oneshot(upload_request(BROWSER_AGENT, "video.mp4", b"video"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let wait = location(&response);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let response = h.router.clone().oneshot(wait_request(&wait)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_job_keeps_redirecting_until_ready() {
        let slow = TaskDefinition::new(
            "slow",
            &["heic"],
            "sleep 1; head -c 10 {{.src_folder}}/{{.name}}.heic > {{.dst_folder}}/{{.name}}.jxl",
        )
        .unwrap();
        let timeouts = ContinuationTimeouts {
            wait_safety: Duration::from_millis(200),
            ..ContinuationTimeouts::default()
        };
        let h = harness(vec![slow], timeouts).await;

        let response = h
            .router
            .clone()
            .oneshot(upload_request(BROWSER_AGENT, "photo.heic", &vec![2u8; 2048]))
            .await
            .unwrap();
        let wait = location(&response);

        let mut redirects = 0;
        let finished = loop {
            let response = h.router.clone().oneshot(wait_request(&wait)).await.unwrap();
            if response.status() == StatusCode::TEMPORARY_REDIRECT {
                assert_eq!(location(&response), wait);
                redirects += 1;
                assert!(redirects < 50, "job never finished");
                continue;
            }
            break response;
        };

        assert!(redirects >= 1);
        assert_eq!(finished.status(), StatusCode::CREATED);
        assert!(body_text(finished).await.contains("photo.jxl"));
    }

    #[tokio::test]
    async fn disconnected_mobile_client_does_not_stop_the_upload() {
        let slow = TaskDefinition::new(
            "slow",
            &["heic"],
            "sleep 1.5; touch finished.marker; head -c 10 {{.src_folder}}/{{.name}}.heic > {{.dst_folder}}/{{.name}}.jxl",
        )
        .unwrap();
        let h = harness(vec![slow], ContinuationTimeouts::default()).await;

        let request = upload_request(MOBILE_AGENT, "photo.heic", &vec![3u8; 4096]);
        let dropped = tokio::time::timeout(
            Duration::from_millis(300),
            h.router.clone().oneshot(request),
        )
        .await;
        assert!(dropped.is_err(), "request should still be running");

        assert_eq!(h.state.pipeline().gate().in_flight(), 1);

        let marker = h.config_dir.path().join("finished.marker");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while h.uploads.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "upload never forwarded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(marker.exists());
        assert_eq!(h.uploads.lock().unwrap()[0].file_name, "photo.jxl");
        assert_eq!(h.state.pipeline().gate().in_flight(), 0);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn intercepted_upload_is_logged_with_job_id() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let response = h
            .router
            .clone()
            .oneshot(upload_request(MOBILE_AGENT, "video.mp4", b"video"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("intercepting upload"))
            .unwrap_or_else(|| panic!("no intercept log in:\n{output}"));
        assert!(line.contains("job_id="), "got: {line}");
        assert!(line.contains("/api/assets"), "got: {line}");
    }

    #[tokio::test]
    async fn non_matching_requests_are_proxied() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;

        let request = Request::builder()
            .uri("/api/server/ping?x=1")
            .body(Body::empty())
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "upstream saw GET /api/server/ping?x=1"
        );
    }

    #[tokio::test]
    async fn missing_file_field_is_bad_request() {
        let h = harness(vec![heic_to_jxl()], ContinuationTimeouts::default()).await;
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"deviceId\"\r\n\r\nphone\r\n--{BOUNDARY}--\r\n"
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/assets")
            .header(header::USER_AGENT, MOBILE_AGENT)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&format!("multipart/form-data; boundary={BOUNDARY}"))
                    .unwrap(),
            )
            .body(Body::from(body))
            .unwrap();

        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("assetData"));
    }

    #[tokio::test]
    async fn wait_without_job_is_bad_request() {
        let h = harness(Vec::new(), ContinuationTimeouts::default()).await;
        let response = h
            .router
            .clone()
            .oneshot(wait_request(WAIT_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn path_patterns_match_per_segment() {
        assert!(path_matches("/api/assets", "/api/assets"));
        assert!(path_matches("/api/*/upload", "/api/assets/upload"));
        assert!(path_matches("/api/asset?", "/api/assets"));
        assert!(!path_matches("/api/*", "/api/assets/upload"));
        assert!(!path_matches("/api/assets", "/api/assets/"));
        assert!(path_matches("/api/*s", "/api/assets"));
    }

    #[test]
    fn only_multipart_requests_are_intercepted() {
        let filter = UploadFilter::new("/api/assets", "assetData");
        let mut headers = HeaderMap::new();
        assert!(!filter.intercepts("/api/assets", &headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=x"),
        );
        assert!(filter.intercepts("/api/assets", &headers));
        assert!(!filter.intercepts("/api/albums", &headers));
    }
}
