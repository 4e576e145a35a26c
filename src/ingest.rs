use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::{AppConfig, UploadPolicy};
use crate::models::{Attachment, AttachmentKind, NewAttachment};
use crate::repository::{AttachmentRepository, RepositoryError};
use crate::sanitize::SanitizedName;
use crate::storage::LocalStorage;
use crate::token::issue_token;

/// Leading bytes kept for content sniffing.
pub const SNIFF_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no file was transmitted")]
    MissingFile,
    #[error("the uploaded file is empty")]
    EmptyFile,
    #[error("upload interrupted: {0}")]
    Interrupted(String),
    #[error("file exceeds the maximum upload size of {max} bytes")]
    TooLarge { max: u64 },
    #[error("file type is not allowed (detected: {}, extension: {})",
        .detected.as_deref().unwrap_or("unknown"),
        .extension.as_deref().unwrap_or("none"))]
    UnsupportedType {
        detected: Option<String>,
        extension: Option<String>,
    },
    #[error("insufficient storage: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("owner {0} does not exist")]
    OwnerNotFound(i64),
    #[error("stored file {} could not be verified", .0.display())]
    Unverified(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Receives an upload body chunk by chunk into the staging directory.
pub struct StagingWriter {
    file: tokio::fs::File,
    path: TempPath,
    size: u64,
    head: Vec<u8>,
    max_bytes: u64,
}

impl StagingWriter {
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), IngestError> {
        self.size += chunk.len() as u64;
        if self.size > self.max_bytes {
            return Err(IngestError::TooLarge {
                max: self.max_bytes,
            });
        }

        if self.head.len() < SNIFF_BYTES {
            let take = (SNIFF_BYTES - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }

        self.file.write_all(&chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self, original_name: String) -> Result<StagedFile, IngestError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(StagedFile {
            path: self.path,
            size: self.size,
            head: self.head,
            original_name,
        })
    }
}

/// A fully received upload, not yet validated or placed.
pub struct StagedFile {
    path: TempPath,
    size: u64,
    head: Vec<u8>,
    original_name: String,
}

impl StagedFile {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }
}

pub struct StoreRequest {
    pub kind: AttachmentKind,
    pub owner_id: i64,
    pub description: Option<String>,
    pub declared_size: Option<u64>,
}

#[derive(Debug)]
pub struct StoredAttachment {
    pub attachment: Attachment,
    pub stored_name: String,
    pub size: u64,
    pub content_type: String,
}

pub struct UploadIngest {
    storage: Arc<LocalStorage>,
    repository: Arc<dyn AttachmentRepository>,
    document_policy: UploadPolicy,
    evidence_policy: UploadPolicy,
    max_upload_bytes: u64,
}

impl UploadIngest {
    pub fn new(
        config: &AppConfig,
        storage: Arc<LocalStorage>,
        repository: Arc<dyn AttachmentRepository>,
    ) -> Self {
        Self {
            storage,
            repository,
            document_policy: config.document_policy.clone(),
            evidence_policy: config.evidence_policy.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    fn policy(&self, kind: AttachmentKind) -> &UploadPolicy {
        match kind {
            AttachmentKind::Document => &self.document_policy,
            AttachmentKind::Evidence => &self.evidence_policy,
        }
    }

    pub fn begin(&self) -> Result<StagingWriter, IngestError> {
        let (file, path) = self.storage.stage()?;
        Ok(StagingWriter {
            file: tokio::fs::File::from_std(file),
            path,
            size: 0,
            head: Vec::new(),
            max_bytes: self.max_upload_bytes,
        })
    }

    /// Validates a staged upload, places it under the kind's partition and
    /// records it. On any failure after placement the file is removed again.
    pub async fn store(
        &self,
        request: StoreRequest,
        staged: Option<StagedFile>,
    ) -> Result<StoredAttachment, IngestError> {
        let StoreRequest {
            kind,
            owner_id,
            description,
            declared_size,
        } = request;

        let staged = staged.ok_or(IngestError::MissingFile)?;
        if staged.size == 0 {
            return Err(IngestError::EmptyFile);
        }

        let name = SanitizedName::new(&staged.original_name);
        let content_type = check_file_type(self.policy(kind), &staged.head, name.extension())
            .inspect_err(|err| {
                warn!(%kind, owner_id, original_name = %staged.original_name, error = %err, "upload rejected");
            })?;

        if staged.size > self.max_upload_bytes {
            return Err(IngestError::TooLarge {
                max: self.max_upload_bytes,
            });
        }
        if let Some(declared) = declared_size.filter(|declared| *declared != staged.size) {
            warn!(%kind, owner_id, declared, received = staged.size, "declared size differs from received size");
        }

        self.ensure_space(kind, owner_id, staged.size)?;

        if !self.repository.owner_exists(kind, owner_id).await? {
            return Err(IngestError::OwnerNotFound(owner_id));
        }

        let (relative_dir, absolute_dir) = self.storage.partition(kind, Utc::now());
        let StagedFile {
            path: staged_path,
            size,
            original_name,
            ..
        } = staged;

        let storage = self.storage.clone();
        let target = tokio::task::spawn_blocking(move || {
            storage.claim(staged_path, size, &absolute_dir, &name)
        })
        .await
        .map_err(io::Error::other)?
        .inspect_err(|err| {
            error!(%kind, owner_id, dir = %relative_dir, error = %err, "failed to place uploaded file");
        })?;

        if !self.storage.is_written(&target, size) {
            error!(%kind, owner_id, path = %target.display(), "stored file missing after move");
            remove_quietly(&target).await;
            return Err(IngestError::Unverified(target));
        }

        let stored_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let new_attachment = NewAttachment {
            owner_id,
            description: description_or_filename(description, &original_name),
            stored_path: format!("{relative_dir}/{stored_name}"),
            access_token: issue_token(),
            content_size: size as i64,
            content_type: content_type.to_string(),
            created_at: Utc::now(),
        };

        match self.repository.insert(kind, new_attachment).await {
            Ok(attachment) => {
                info!(
                    %kind,
                    owner_id,
                    attachment_id = attachment.id,
                    path = %attachment.stored_path,
                    size,
                    "attachment stored"
                );
                Ok(StoredAttachment {
                    attachment,
                    stored_name,
                    size,
                    content_type: content_type.to_string(),
                })
            }
            Err(err) => {
                error!(
                    %kind,
                    owner_id,
                    path = %target.display(),
                    error = %err,
                    "failed to record attachment; removing stored file"
                );
                remove_quietly(&target).await;
                Err(err.into())
            }
        }
    }

    fn ensure_space(&self, kind: AttachmentKind, owner_id: i64, size: u64) -> Result<(), IngestError> {
        match self.storage.available_space() {
            Ok(available) if available < size => {
                warn!(%kind, owner_id, required = size, available, "upload rejected: insufficient disk space");
                Err(IngestError::InsufficientSpace {
                    required: size,
                    available,
                })
            }
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(
                    %kind,
                    owner_id,
                    root = %self.storage.upload_root().display(),
                    error = %err,
                    "free space could not be determined; continuing without the check"
                );
                Ok(())
            }
        }
    }
}

/// Both the sniffed type and the extension must be allowed.
pub fn check_file_type(
    policy: &UploadPolicy,
    head: &[u8],
    extension: Option<&str>,
) -> Result<&'static str, IngestError> {
    let detected = infer::get(head).map(|kind| kind.mime_type());
    let extension_allowed = extension.is_some_and(|ext| policy.allows_extension(ext));

    match detected {
        Some(mime) if extension_allowed && policy.allows_mime(mime) => Ok(mime),
        _ => Err(IngestError::UnsupportedType {
            detected: detected.map(str::to_string),
            extension: extension.map(str::to_string),
        }),
    }
}

fn description_or_filename(description: Option<String>, original_name: &str) -> String {
    description
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            original_name
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(original_name)
                .trim()
                .to_string()
        })
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "failed to remove stored file");
    }
}
