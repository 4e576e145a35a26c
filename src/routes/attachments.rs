use axum::extract::{multipart::MultipartError, Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::public::capability_url;
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::ingest::{IngestError, StagedFile, StoreRequest, StoredAttachment};
use crate::models::{Attachment, AttachmentKind};
use crate::permissions::{ensure_permission, Permission};
use crate::resolver::Resolution;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Option<i64>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub id: i64,
    pub token: String,
    pub stored_name: String,
    pub size: u64,
    pub content_type: String,
    pub view_url: String,
    pub download_url: String,
}

impl UploadResponse {
    fn from_stored(kind: AttachmentKind, stored: StoredAttachment) -> Self {
        let StoredAttachment {
            attachment,
            stored_name,
            size,
            content_type,
        } = stored;
        Self {
            id: attachment.id,
            view_url: capability_url(kind, "view", attachment.id, &attachment.access_token),
            download_url: capability_url(kind, "download", attachment.id, &attachment.access_token),
            token: attachment.access_token,
            stored_name,
            size,
            content_type,
        }
    }
}

#[derive(Serialize)]
pub struct AttachmentSummary {
    pub id: i64,
    pub description: String,
    pub token: String,
    pub created_at: Option<String>,
    pub content_type: Option<String>,
    pub content_size: Option<i64>,
    pub file_available: bool,
    pub view_url: String,
    pub download_url: String,
}

fn to_summary(kind: AttachmentKind, attachment: Attachment, file_available: bool) -> AttachmentSummary {
    AttachmentSummary {
        id: attachment.id,
        view_url: capability_url(kind, "view", attachment.id, &attachment.access_token),
        download_url: capability_url(kind, "download", attachment.id, &attachment.access_token),
        description: attachment.description,
        token: attachment.access_token,
        created_at: attachment.created_at.map(|ts| ts.to_rfc3339()),
        content_type: attachment.content_type,
        content_size: attachment.content_size,
        file_available,
    }
}

fn owner_id_missing() -> AppError {
    AppError::bad_request("owner_id_missing", "owner_id is required")
}

/// Translates a multipart read failure into the upload error it stands for.
fn multipart_failure(err: MultipartError, max_bytes: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return IngestError::TooLarge { max: max_bytes }.into();
    }
    let reason = err.body_text();
    warn!(error = %reason, "multipart upload interrupted");
    IngestError::Interrupted(reason).into()
}

pub async fn list_attachments(
    State(state): State<AppState>,
    Path(kind): Path<AttachmentKind>,
    user: AuthenticatedUser,
    Query(query): Query<OwnerQuery>,
) -> AppResult<Json<Vec<AttachmentSummary>>> {
    ensure_permission(&user, Permission::ViewAttachments)?;
    let owner_id = query.owner_id.ok_or_else(owner_id_missing)?;

    if !state.repository.owner_exists(kind, owner_id).await? {
        return Err(IngestError::OwnerNotFound(owner_id).into());
    }

    let attachments = state.repository.list_by_owner(kind, owner_id).await?;
    let summaries = attachments
        .into_iter()
        .map(|attachment| {
            let file_available = state
                .resolver
                .resolve(kind, &attachment.stored_path)
                .is_found();
            if !file_available {
                warn!(
                    %kind,
                    attachment_id = attachment.id,
                    path = %attachment.stored_path,
                    "attachment file is missing"
                );
            }
            to_summary(kind, attachment, file_available)
        })
        .collect();

    Ok(Json(summaries))
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    Path(kind): Path<AttachmentKind>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    ensure_permission(&user, Permission::UploadAttachments)?;

    let max_bytes = state.ingest.max_upload_bytes();
    let mut owner_id: Option<i64> = None;
    let mut description: Option<String> = None;
    let mut declared_size: Option<u64> = None;
    let mut staged: Option<StagedFile> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_failure(err, max_bytes))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("owner_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_failure(err, max_bytes))?;
                if !value.trim().is_empty() {
                    let parsed = value.trim().parse::<i64>().map_err(|_| {
                        AppError::bad_request("owner_id_invalid", "owner_id must be an integer")
                    })?;
                    owner_id = Some(parsed);
                }
            }
            Some("description") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_failure(err, max_bytes))?;
                description = Some(value);
            }
            Some("size") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_failure(err, max_bytes))?;
                if let Ok(declared) = value.trim().parse::<u64>() {
                    if declared > max_bytes {
                        return Err(IngestError::TooLarge { max: max_bytes }.into());
                    }
                    declared_size = Some(declared);
                }
            }
            Some("file") if staged.is_none() => {
                let original_name = field
                    .file_name()
                    .map(|n| n.trim().to_string())
                    .unwrap_or_default();
                let mut writer = state.ingest.begin()?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| multipart_failure(err, max_bytes))?
                {
                    writer.write_chunk(chunk).await?;
                }
                let file = writer.finish(original_name).await?;
                // Browsers send an unnamed empty part when nothing was picked.
                if !(file.original_name().is_empty() && file.size() == 0) {
                    staged = Some(file);
                }
            }
            _ => {}
        }
    }

    let owner_id = owner_id.ok_or_else(owner_id_missing)?;
    let stored = state
        .ingest
        .store(
            StoreRequest {
                kind,
                owner_id,
                description,
                declared_size,
            },
            staged,
        )
        .await?;

    info!(
        %kind,
        owner_id,
        attachment_id = stored.attachment.id,
        username = %user.username,
        "upload accepted"
    );

    Ok((StatusCode::CREATED, Json(UploadResponse::from_stored(kind, stored))))
}

pub async fn delete_attachment(
    State(state): State<AppState>,
    Path((kind, id)): Path<(AttachmentKind, i64)>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    ensure_permission(&user, Permission::DeleteAttachments)?;

    let attachment = state
        .repository
        .find(kind, id)
        .await?
        .ok_or_else(AppError::attachment_not_found)?;

    match state.resolver.resolve(kind, &attachment.stored_path) {
        Resolution::Found(path) => {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(
                    %kind,
                    attachment_id = id,
                    path = %path.display(),
                    error = %err,
                    "failed to remove attachment file; deleting record anyway"
                );
            }
        }
        Resolution::NotFound => {
            warn!(
                %kind,
                attachment_id = id,
                path = %attachment.stored_path,
                "attachment file already missing; deleting record only"
            );
        }
    }

    if !state.repository.delete(kind, id).await? {
        return Err(AppError::attachment_not_found());
    }

    info!(
        %kind,
        attachment_id = id,
        owner_id = attachment.owner_id,
        username = %user.username,
        "attachment deleted"
    );

    Ok(StatusCode::NO_CONTENT)
}
