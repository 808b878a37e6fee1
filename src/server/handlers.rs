//! HTTP handlers: the thin POST-JSON surface over the archive library.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::AppState;
use crate::archive::{quick_extract, quick_list, Archive};
use crate::error::ArchiveError;
use crate::formats::FileEntry;
use crate::path::file_name;

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "innerPath")]
    inner_path: String,
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    file: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    is_encrypted: bool,
    requires_password: bool,
    total_files: u64,
    total_size: u64,
    format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    files: Vec<FileEntryResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileEntryResponse {
    path: String,
    size: u64,
    compressed_size: u64,
    mod_time: DateTime<Utc>,
    is_dir: bool,
}

impl From<FileEntry> for FileEntryResponse {
    fn from(entry: FileEntry) -> Self {
        Self {
            path: entry.path,
            size: entry.size,
            compressed_size: entry.compressed_size,
            mod_time: entry.modified,
            is_dir: entry.is_dir,
        }
    }
}

/// JSON error envelope used by handlers and middleware alike.
pub fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            code: code.to_string(),
            details: None,
        }),
    )
        .into_response()
}

/// Classify a library error into the wire taxonomy.
///
/// This is the only place where core errors meet HTTP codes; inside the
/// library they stay first-class variants.
fn map_archive_error(err: &ArchiveError, op: Operation) -> Response {
    use ArchiveError::*;

    match err {
        PasswordRequired => error_response(
            StatusCode::UNAUTHORIZED,
            "Password required",
            "PASSWORD_REQUIRED",
        ),
        PasswordIncorrect => error_response(
            StatusCode::UNAUTHORIZED,
            "Incorrect password",
            "WRONG_PASSWORD",
        ),
        FileNotFound => match op {
            Operation::List => error_response(
                StatusCode::NOT_FOUND,
                "Path not found in archive",
                "PATH_NOT_FOUND",
            ),
            _ => error_response(
                StatusCode::NOT_FOUND,
                "File not found in archive",
                "FILE_NOT_FOUND",
            ),
        },
        PathTraversal => error_response(StatusCode::BAD_REQUEST, "Invalid file path", "INVALID_PATH"),
        UnsupportedFormat | Format(_) => error_response(
            StatusCode::BAD_REQUEST,
            "Unsupported archive format",
            "UNSUPPORTED_FORMAT",
        ),
        InvalidUrl(_) | UrlAccess(_) | Http(_) | TooLarge { .. } => {
            error_response(StatusCode::BAD_REQUEST, "Failed to access URL", "URL_ERROR")
        }
        Canceled | Internal(_) | Io(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            "INTERNAL_ERROR",
        ),
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Info,
    List,
    Extract,
}

/// Validate content type and decode the JSON body.
fn parse_json<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json",
            "INVALID_CONTENT_TYPE",
        ));
    }

    serde_json::from_slice(body).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid JSON: {err}"),
            "INVALID_JSON",
        )
    })
}

/// Fallback for non-POST methods on the API routes.
pub async fn method_not_allowed() -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed, use POST",
        "METHOD_NOT_ALLOWED",
    )
}

/// `GET /health`.
pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
    .into_response()
}

/// `POST /api/info`.
pub async fn info(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: InfoRequest = match parse_json(&headers, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required", "MISSING_URL");
    }

    tracing::info!(
        url = %request.url,
        has_password = request.password.is_some(),
        "getting archive info"
    );

    let archive = match Archive::new(&request.url, &state.lib_config).await {
        Ok(archive) => archive,
        Err(err) => {
            tracing::error!(url = %request.url, error = %err, "failed to open archive");
            return map_archive_error(&err, Operation::Info);
        }
    };

    let format = archive.format();
    let outcome = archive.info(request.password.as_deref()).await;
    archive.close();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(url = %request.url, error = %err, "failed to get archive info");
            return map_archive_error(&err, Operation::Info);
        }
    };

    if let Some(err) = &outcome.error {
        tracing::warn!(url = %request.url, error = %err, "archive info needs a password");
        return map_archive_error(err, Operation::Info);
    }

    let info = outcome.info;
    tracing::info!(
        url = %request.url,
        total_files = info.total_files,
        total_size = info.total_size,
        "successfully retrieved archive info"
    );

    Json(InfoResponse {
        is_encrypted: info.is_encrypted,
        requires_password: info.requires_password,
        total_files: info.total_files,
        total_size: info.total_size,
        format: format.to_string(),
        comment: info.comment,
    })
    .into_response()
}

/// `POST /api/list`.
pub async fn list(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ListRequest = match parse_json(&headers, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required", "MISSING_URL");
    }

    tracing::info!(
        url = %request.url,
        inner_path = %request.inner_path,
        has_password = request.password.is_some(),
        "listing archive files"
    );

    match quick_list(
        &request.url,
        &request.inner_path,
        request.password.as_deref(),
        &state.lib_config,
    )
    .await
    {
        Ok(files) => {
            tracing::info!(
                url = %request.url,
                file_count = files.len(),
                "successfully listed archive files"
            );
            Json(ListResponse {
                files: files.into_iter().map(FileEntryResponse::from).collect(),
            })
            .into_response()
        }
        Err(err) => {
            tracing::error!(url = %request.url, error = %err, "failed to list archive files");
            map_archive_error(&err, Operation::List)
        }
    }
}

/// `POST /api/extract`: streams the entry as an attachment.
pub async fn extract(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ExtractRequest = match parse_json(&headers, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required", "MISSING_URL");
    }
    if request.file.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "file is required", "MISSING_FILE");
    }

    tracing::info!(
        url = %request.url,
        file_path = %request.file,
        has_password = request.password.is_some(),
        "extracting file from archive"
    );

    let (stream, size) = match quick_extract(
        &request.url,
        &request.file,
        request.password.as_deref(),
        &state.lib_config,
    )
    .await
    {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(
                url = %request.url,
                file_path = %request.file,
                error = %err,
                "failed to extract file"
            );
            return map_archive_error(&err, Operation::Extract);
        }
    };

    tracing::info!(
        url = %request.url,
        file_path = %request.file,
        size,
        "streaming extracted file"
    );

    let disposition = format!("attachment; filename=\"{}\"", file_name(&request.file));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(ReaderStream::new(stream)))
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                "INTERNAL_ERROR",
            )
        })
}
