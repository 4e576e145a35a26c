//! Capability routes: anyone holding an attachment's id and token may read it.
//! Every lookup failure answers identically so ids cannot be probed.

use std::io::SeekFrom;
use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::ingest::SNIFF_BYTES;
use crate::models::{Attachment, AttachmentKind};
use crate::resolver::Resolution;
use crate::state::AppState;
use crate::token::token_matches;

#[derive(Deserialize)]
pub struct CapabilityQuery {
    pub id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

pub fn capability_url(kind: AttachmentKind, action: &str, id: i64, token: &str) -> String {
    format!("/public/{}/{action}?id={id}&token={token}", kind.slug())
}

pub async fn view_attachment(
    State(state): State<AppState>,
    Path(kind): Path<AttachmentKind>,
    Query(query): Query<CapabilityQuery>,
) -> AppResult<Response> {
    let attachment = authorize(&state, kind, query).await?;
    match state.resolver.resolve(kind, &attachment.stored_path) {
        Resolution::Found(path) => serve_file(&state, &attachment, &path, Disposition::Inline).await,
        Resolution::NotFound => {
            warn!(
                %kind,
                attachment_id = attachment.id,
                path = %attachment.stored_path,
                "attachment file unavailable for viewing"
            );
            Ok(unavailable_page(&state, &attachment))
        }
    }
}

pub async fn download_attachment(
    State(state): State<AppState>,
    Path(kind): Path<AttachmentKind>,
    Query(query): Query<CapabilityQuery>,
) -> AppResult<Response> {
    let attachment = authorize(&state, kind, query).await?;
    match state.resolver.resolve(kind, &attachment.stored_path) {
        Resolution::Found(path) => {
            serve_file(&state, &attachment, &path, Disposition::Attachment).await
        }
        Resolution::NotFound => {
            warn!(
                %kind,
                attachment_id = attachment.id,
                path = %attachment.stored_path,
                "attachment file unavailable for download"
            );
            Err(AppError::content_unavailable())
        }
    }
}

async fn authorize(
    state: &AppState,
    kind: AttachmentKind,
    query: CapabilityQuery,
) -> AppResult<Attachment> {
    let (raw_id, token) = match (query.id, query.token) {
        (Some(id), Some(token)) if !id.trim().is_empty() && !token.is_empty() => (id, token),
        _ => {
            return Err(AppError::bad_request(
                "capability_missing",
                "both id and token are required",
            ))
        }
    };

    let Ok(id) = raw_id.trim().parse::<i64>() else {
        debug!(%kind, "capability rejected: malformed id");
        return Err(AppError::attachment_not_found());
    };

    state
        .repository
        .find_by_capability(kind, id, &token)
        .await?
        .filter(|attachment| token_matches(&attachment.access_token, &token))
        .ok_or_else(|| {
            debug!(%kind, attachment_id = id, "capability rejected");
            AppError::attachment_not_found()
        })
}

async fn serve_file(
    state: &AppState,
    attachment: &Attachment,
    path: &FsPath,
    disposition: Disposition,
) -> AppResult<Response> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(attachment_id = attachment.id, path = %path.display(), error = %err, "failed to open attachment file");
            return Err(AppError::content_unavailable());
        }
    };
    let length = file.metadata().await?.len();

    let mut head = vec![0u8; SNIFF_BYTES];
    let read = read_head(&mut file, &mut head).await?;
    head.truncate(read);
    file.seek(SeekFrom::Start(0)).await?;

    let content_type = sniff_content_type(&head, path);
    let stored_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = filename_with_retained_extension(&attachment.description, &stored_name);

    let mut builder = axum::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CACHE_CONTROL,
            format!("private, max-age={}", state.config.public_cache_seconds),
        )
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    if let Some(value) = content_disposition(disposition, &filename) {
        builder = builder.header(header::CONTENT_DISPOSITION, value);
    }

    let mut response = builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(AppError::internal)?;
    allow_framing(response.headers_mut(), &state.config.frame_ancestors);
    Ok(response)
}

async fn read_head(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Content type from the file's leading bytes, then from its name.
fn sniff_content_type(head: &[u8], path: &FsPath) -> String {
    match infer::get(head) {
        Some(kind) => kind.mime_type().to_string(),
        None => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

fn filename_with_retained_extension(title: &str, current_filename: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        return current_filename.to_string();
    }

    let extension = FsPath::new(current_filename)
        .extension()
        .and_then(|ext| ext.to_str());

    match extension {
        Some(ext)
            if !title
                .rsplit_once('.')
                .is_some_and(|(_, existing)| existing.eq_ignore_ascii_case(ext)) =>
        {
            format!("{title}.{ext}")
        }
        _ => title.to_string(),
    }
}

fn content_disposition(disposition: Disposition, filename: &str) -> Option<HeaderValue> {
    if filename.is_empty() {
        return Some(HeaderValue::from_static(disposition.as_str()));
    }

    let fallback: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii() && !ch.is_ascii_control() => ch,
            _ => '_',
        })
        .collect();

    let encoded = percent_encoding::utf8_percent_encode(filename, percent_encoding::NON_ALPHANUMERIC);
    HeaderValue::from_str(&format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        disposition.as_str(),
        fallback,
        encoded
    ))
    .ok()
}

/// Public responses may be embedded by the configured ancestors.
fn allow_framing(headers: &mut HeaderMap, frame_ancestors: &str) {
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    let policy = HeaderValue::from_str(&format!("frame-ancestors {frame_ancestors}"))
        .unwrap_or_else(|_| HeaderValue::from_static("frame-ancestors 'self'"));
    headers.insert(header::CONTENT_SECURITY_POLICY, policy);
}

fn unavailable_page(state: &AppState, attachment: &Attachment) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>Attachment unavailable</title></head>\n\
         <body>\n<h1>Attachment unavailable</h1>\n<p>The file for &ldquo;{}&rdquo; cannot be displayed right now. \
         It may have been moved or removed. Please contact the claims office.</p>\n</body>\n</html>\n",
        escape_html(&attachment.description)
    );

    let mut response = (
        StatusCode::GONE,
        [(header::CACHE_CONTROL, "no-store")],
        Html(body),
    )
        .into_response();
    allow_framing(response.headers_mut(), &state.config.frame_ancestors);
    response
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
