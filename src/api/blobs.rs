//! Photo upload and tokenized artifact download.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::storage::{extension_for_mime, BlobMetadata, StorageError};
use crate::task::task_folder;
use crate::util::is_valid_id;

use super::auth::constant_time_eq;
use super::routes::AppState;
use super::types::{DownloadQuery, UploadQuery, UploadResponse};

const UPLOAD_FIELD: &str = "file";

fn storage_error(err: StorageError) -> (StatusCode, String) {
    match err {
        StorageError::InvalidPath(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        _ => {
            tracing::error!(error = %err, "Blob storage failure");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Store an input photo at `tasks/{taskId}/input.{ext}`.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    if !is_valid_id(&q.task_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Invalid task id: {:?}", q.task_id),
        ));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        if bytes.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Uploaded file is empty".to_string()));
        }

        let path = format!(
            "{}input.{}",
            task_folder(&q.task_id),
            extension_for_mime(&content_type)
        );
        let size = bytes.len();
        state
            .blobs
            .put(&path, bytes.to_vec(), BlobMetadata::new(content_type.clone()))
            .await
            .map_err(storage_error)?;

        tracing::info!(task_id = %q.task_id, path = %path, bytes = size, "Stored upload");
        return Ok(Json(UploadResponse { path, content_type }));
    }

    Err((
        StatusCode::BAD_REQUEST,
        format!("Missing multipart field '{}'", UPLOAD_FIELD),
    ))
}

/// Serve a blob when the query token matches its download token.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, (StatusCode, String)> {
    if bucket != state.blobs.bucket() {
        return Err((StatusCode::NOT_FOUND, format!("Bucket {} not found", bucket)));
    }

    let blob = state
        .blobs
        .get(&object)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Object {} not found", object)))?;

    let authorized = match (blob.metadata.download_token.as_deref(), q.token.as_deref()) {
        (Some(expected), Some(given)) => constant_time_eq(given, expected),
        _ => false,
    };
    if !authorized {
        return Err((StatusCode::FORBIDDEN, "Invalid download token".to_string()));
    }

    let filename = object
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download");
    let disposition = if q.alt.as_deref() == Some("media") {
        "inline"
    } else {
        "attachment"
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        blob.metadata
            .content_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("{}; filename=\"{}\"", disposition, filename)
            .parse()
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Filename produces an invalid header value: {}", filename),
                )
            })?,
    );

    Ok((headers, Body::from(blob.bytes)).into_response())
}
