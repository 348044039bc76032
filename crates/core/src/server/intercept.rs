use std::path::Path;

use anyhow::Context;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Redirect, Response};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{wait_url, AppError, AppState, PROCESSING_FAILED_MESSAGE};
use crate::jobs::DeliveryOutcome;
use crate::pipeline::{format_size, should_replace, PipelineError, SourceFile};
use crate::task::{extension_of, is_valid_extension};
use crate::upstream::{self, UploadForm};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to process file: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("unable to forward upload: {0:#}")]
    Forward(anyhow::Error),
}

/// The parsed upload, with the file spooled to disk.
struct SpooledUpload {
    file: NamedTempFile,
    file_name: String,
    size: u64,
    fields: Vec<(String, String)>,
}

/// What the upstream request needs from the client's original request.
struct Origin {
    method: Method,
    path_and_query: Option<PathAndQuery>,
    headers: HeaderMap,
}

pub(super) async fn handle_upload(state: AppState, request: Request) -> Response {
    let follows_redirects = state
        .inner
        .redirect_policy
        .follows_redirects(request.headers());
    let origin = Origin {
        method: request.method().clone(),
        path_and_query: request.uri().path_and_query().cloned(),
        headers: request.headers().clone(),
    };

    let ticket = follows_redirects.then(|| state.inner.jobs.create());
    let job_id = match &ticket {
        Some(ticket) => ticket.id().to_string(),
        None => Uuid::new_v4().to_string(),
    };
    let span = info_span!("job", job_id = %job_id);
    info!(
        parent: &span,
        method = %origin.method,
        path = request.uri().path(),
        follows_redirects,
        "intercepting upload"
    );

    let upload = match receive(&state, request).instrument(span.clone()).await {
        Ok(upload) => upload,
        Err(err) => return err.into_response(),
    };

    // Runs detached from the connection; a disconnect only drops the response.
    match ticket {
        Some(ticket) => {
            tokio::spawn(
                async move {
                    match run_upload(&state, &origin, upload).await {
                        Ok(upstream) => {
                            match ticket.deliver(upstream::into_response(upstream)).await {
                                DeliveryOutcome::Delivered => info!("result delivered"),
                                DeliveryOutcome::AckTimedOut => {
                                    warn!("client did not finish reading the result in time")
                                }
                                DeliveryOutcome::Abandoned => {
                                    warn!("no client collected the result")
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "upload failed"),
                    }
                }
                .instrument(span),
            );

            Redirect::temporary(&wait_url(&job_id)).into_response()
        }
        None => {
            let producer = tokio::spawn(
                async move { run_upload(&state, &origin, upload).await }.instrument(span.clone()),
            );

            let outcome = producer.await;
            span.in_scope(|| match outcome {
                Ok(Ok(upstream)) => upstream::into_response(upstream),
                Ok(Err(err @ UploadError::Pipeline(_))) => {
                    warn!(error = %err, "upload failed");
                    AppError::Internal(PROCESSING_FAILED_MESSAGE.to_string()).into_response()
                }
                Ok(Err(err @ UploadError::Forward(_))) => {
                    warn!(error = %err, "upload failed");
                    AppError::BadGateway(err.to_string()).into_response()
                }
                Err(err) => {
                    warn!(error = %err, "upload task did not complete");
                    AppError::Internal(PROCESSING_FAILED_MESSAGE.to_string()).into_response()
                }
            })
        }
    }
}

async fn receive(state: &AppState, request: Request) -> Result<SpooledUpload, AppError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| AppError::BadRequest(format!("unable to parse multipart form: {err}")))?;

    let upload = spool(
        &mut multipart,
        state.inner.filter.form_key(),
        &state.inner.spool_dir,
    )
    .await?;

    let extension = extension_of(&upload.file_name);
    if !is_valid_extension(&extension) {
        return Err(AppError::BadRequest(format!(
            "invalid file extension for {:?}",
            upload.file_name
        )));
    }

    Ok(upload)
}

async fn spool(
    multipart: &mut Multipart,
    form_key: &str,
    spool_dir: &Path,
) -> Result<SpooledUpload, AppError> {
    let bad_form = |err: axum::extract::multipart::MultipartError| {
        AppError::BadRequest(format!("unable to parse multipart form: {err}"))
    };

    let mut fields = Vec::new();
    let mut spooled: Option<(NamedTempFile, String, u64)> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(base_name);

        match file_name {
            Some(file_name) if name == form_key && spooled.is_none() => {
                let temp = tempfile::Builder::new()
                    .prefix("upload-optimizer-upload-")
                    .tempfile_in(spool_dir)
                    .with_context(|| {
                        format!("unable to create temp file in {}", spool_dir.display())
                    })?;
                let mut out = tokio::fs::File::from_std(
                    temp.as_file()
                        .try_clone()
                        .context("unable to open temp file")?,
                );

                let mut size = 0u64;
                while let Some(chunk) = field.chunk().await.map_err(bad_form)? {
                    out.write_all(&chunk)
                        .await
                        .context("unable to write temp file")?;
                    size += chunk.len() as u64;
                }
                out.flush().await.context("unable to write temp file")?;

                spooled = Some((temp, file_name, size));
            }
            Some(_) => {}
            None => {
                let value = field.text().await.map_err(bad_form)?;
                fields.push((name, value));
            }
        }
    }

    let Some((file, file_name, size)) = spooled else {
        return Err(AppError::BadRequest(format!(
            "unable to read file in key {form_key} from uploaded form data"
        )));
    };

    Ok(SpooledUpload {
        file,
        file_name,
        size,
        fields,
    })
}

fn base_name(file_name: &str) -> String {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .to_string()
}

/// Optimizes the spooled file and sends the resulting form upstream. The
/// spooled file and any processed output are removed when this returns.
async fn run_upload(
    state: &AppState,
    origin: &Origin,
    upload: SpooledUpload,
) -> Result<reqwest::Response, UploadError> {
    info!(
        file = %upload.file_name,
        size = %format_size(upload.size),
        "file uploaded"
    );

    let source = SourceFile::new(upload.file_name.clone(), upload.file.path(), upload.size);
    let processed = state.inner.pipeline.process(&source).await?;

    let replaced = should_replace(upload.size, processed.size());
    let form = if replaced {
        UploadForm {
            fields: upload.fields.clone(),
            file_key: state.inner.filter.form_key().to_string(),
            file_name: processed.file_name_for(&upload.file_name),
            file_path: processed.path().to_path_buf(),
            file_size: processed.size(),
        }
    } else {
        UploadForm {
            fields: upload.fields.clone(),
            file_key: state.inner.filter.form_key().to_string(),
            file_name: upload.file_name.clone(),
            file_path: upload.file.path().to_path_buf(),
            file_size: upload.size,
        }
    };

    let response = state
        .inner
        .upstream
        .forward_upload(
            origin.method.clone(),
            origin.path_and_query.as_ref(),
            &origin.headers,
            &form,
        )
        .await
        .map_err(UploadError::Forward)?;

    info!(
        original = %upload.file_name,
        original_size = %format_size(upload.size),
        optimized = %processed.file_name_for(&upload.file_name),
        optimized_size = %format_size(processed.size()),
        task = processed.task(),
        status = response.status().as_u16(),
        "{}",
        if replaced { "file replaced" } else { "file NOT replaced" }
    );

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_paths_are_stripped_from_file_names() {
        assert_eq!(base_name("IMG_1.heic"), "IMG_1.heic");
        assert_eq!(base_name("DCIM/100/IMG_1.heic"), "IMG_1.heic");
        assert_eq!(base_name("C:\\Users\\me\\IMG_1.heic"), "IMG_1.heic");
    }

    #[test]
    fn pipeline_errors_keep_their_detail() {
        let err = UploadError::from(PipelineError::NoMatchingTask {
            extension: "mp4".to_string(),
        });
        assert!(err.to_string().contains("mp4"));
    }
}
