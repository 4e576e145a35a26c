use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::Utc;
use claimvault::auth::jwt::JwtService;
use claimvault::config::{AppConfig, UploadPolicy, DEFAULT_MAX_UPLOAD_BYTES};
use claimvault::db;
use claimvault::models::{Attachment, AttachmentKind, NewAttachment};
use claimvault::repository::{AttachmentRepository, RepositoryError};
use claimvault::routes;
use claimvault::state::AppState;
use claimvault::storage::{LocalStorage, SpaceProbe};
use claimvault::token::{issue_token, token_matches};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    owners: HashSet<(AttachmentKind, i64)>,
    rows: BTreeMap<(AttachmentKind, i64), Attachment>,
    next_id: i64,
    fail_inserts: bool,
}

/// In-memory stand-in for the attachment tables.
#[derive(Default)]
pub struct FakeRepository {
    tables: Mutex<Tables>,
}

#[async_trait]
impl AttachmentRepository for FakeRepository {
    async fn owner_exists(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<bool, RepositoryError> {
        let guard = self.tables.lock().await;
        Ok(guard.owners.contains(&(kind, owner_id)))
    }

    async fn insert(
        &self,
        kind: AttachmentKind,
        attachment: NewAttachment,
    ) -> Result<Attachment, RepositoryError> {
        let mut guard = self.tables.lock().await;
        if guard.fail_inserts {
            return Err(RepositoryError::Pool("database unavailable".to_string()));
        }
        guard.next_id += 1;
        let row = attachment.into_attachment(guard.next_id);
        guard.rows.insert((kind, row.id), row.clone());
        Ok(row)
    }

    async fn find(
        &self,
        kind: AttachmentKind,
        id: i64,
    ) -> Result<Option<Attachment>, RepositoryError> {
        let guard = self.tables.lock().await;
        Ok(guard.rows.get(&(kind, id)).cloned())
    }

    async fn find_by_capability(
        &self,
        kind: AttachmentKind,
        id: i64,
        token: &str,
    ) -> Result<Option<Attachment>, RepositoryError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .rows
            .get(&(kind, id))
            .filter(|row| token_matches(&row.access_token, token))
            .cloned())
    }

    async fn list_by_owner(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<Vec<Attachment>, RepositoryError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .rows
            .iter()
            .rev()
            .filter(|((row_kind, _), row)| *row_kind == kind && row.owner_id == owner_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn list_all(&self, kind: AttachmentKind) -> Result<Vec<Attachment>, RepositoryError> {
        let guard = self.tables.lock().await;
        Ok(guard
            .rows
            .iter()
            .filter(|((row_kind, _), _)| *row_kind == kind)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete(&self, kind: AttachmentKind, id: i64) -> Result<bool, RepositoryError> {
        let mut guard = self.tables.lock().await;
        Ok(guard.rows.remove(&(kind, id)).is_some())
    }
}

impl FakeRepository {
    pub async fn add_owner(&self, kind: AttachmentKind, owner_id: i64) {
        let mut guard = self.tables.lock().await;
        guard.owners.insert((kind, owner_id));
    }

    /// A row as written before size, type and timestamp were recorded.
    #[allow(dead_code)]
    pub async fn insert_legacy(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
        description: &str,
        stored_path: &str,
    ) -> Attachment {
        let mut guard = self.tables.lock().await;
        guard.owners.insert((kind, owner_id));
        guard.next_id += 1;
        let row = Attachment {
            id: guard.next_id,
            owner_id,
            description: description.to_string(),
            stored_path: stored_path.to_string(),
            access_token: issue_token(),
            content_size: None,
            content_type: None,
            created_at: None,
        };
        guard.rows.insert((kind, row.id), row.clone());
        row
    }

    #[allow(dead_code)]
    pub async fn fail_inserts(&self) {
        let mut guard = self.tables.lock().await;
        guard.fail_inserts = true;
    }

    #[allow(dead_code)]
    pub async fn count(&self, kind: AttachmentKind) -> usize {
        let guard = self.tables.lock().await;
        guard.rows.keys().filter(|(row_kind, _)| *row_kind == kind).count()
    }

    #[allow(dead_code)]
    pub async fn get(&self, kind: AttachmentKind, id: i64) -> Option<Attachment> {
        let guard = self.tables.lock().await;
        guard.rows.get(&(kind, id)).cloned()
    }
}

/// Free-space probe whose answer a test controls. `None` makes it fail.
pub struct FakeSpaceProbe {
    available: std::sync::Mutex<Option<u64>>,
}

impl FakeSpaceProbe {
    fn plenty() -> Self {
        Self {
            available: std::sync::Mutex::new(Some(u64::MAX)),
        }
    }

    #[allow(dead_code)]
    pub fn set(&self, available: Option<u64>) {
        *self.available.lock().unwrap() = available;
    }
}

impl SpaceProbe for FakeSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        let available = *self.available.lock().unwrap();
        available.ok_or_else(|| io::Error::other("statvfs not supported"))
    }
}

pub struct TestApp {
    pub state: AppState,
    pub repository: Arc<FakeRepository>,
    pub probe: Arc<FakeSpaceProbe>,
    /// Web root; the upload root is its `uploads/` directory.
    pub document_root: PathBuf,
    pub upload_root: PathBuf,
    router: Router,
    _dir: TempDir,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let document_root = dir.path().join("www");
        let upload_root = document_root.join("uploads");

        let mut config = AppConfig {
            database_url: "postgres://unused".to_string(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            cors_allowed_origin: None,
            upload_root: upload_root.clone(),
            document_root: document_root.clone(),
            staging_dir: upload_root.join(".staging"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            document_policy: UploadPolicy::new(
                &["application/pdf", "image/jpeg", "image/png"],
                &["pdf", "jpg", "jpeg", "png"],
            ),
            evidence_policy: UploadPolicy::new(&["application/pdf"], &["pdf"]),
            date_partitioning: true,
            legacy_path_prefixes: vec!["uploads/".to_string()],
            frame_ancestors: "'self'".to_string(),
            public_cache_seconds: 300,
        };
        customize(&mut config);

        let repository = Arc::new(FakeRepository::default());
        let probe = Arc::new(FakeSpaceProbe::plenty());
        let storage = Arc::new(LocalStorage::from_config(&config, probe.clone()));
        storage.ensure_layout()?;

        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(config, repository.clone(), storage, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            repository,
            probe,
            document_root,
            upload_root,
            router,
            _dir: dir,
        })
    }

    /// A session token for a staff member with `role`.
    pub fn token_for(&self, role: &str) -> String {
        self.state
            .jwt
            .generate_token(Uuid::new_v4(), &format!("{role}-user"), role)
            .expect("session token")
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Posts a multipart form with text `fields` and an optional `file` part.
    pub async fn upload_form(
        &self,
        kind: &str,
        fields: &[(&str, &str)],
        file: Option<(&str, &[u8])>,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend(value.as_bytes());
            body.extend(b"\r\n");
        }

        if let Some((filename, data)) = file {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                    filename
                )
                .as_bytes(),
            );
            body.extend(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend(data);
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/attachments/{kind}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn upload(
        &self,
        kind: &str,
        owner_id: i64,
        filename: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let owner = owner_id.to_string();
        self.upload_form(kind, &[("owner_id", owner.as_str())], Some((filename, data)), token)
            .await
    }

    /// Every regular file under the upload root except the staging area.
    #[allow(dead_code)]
    pub fn stored_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(&self.upload_root, &mut files);
        files.retain(|path| !path.starts_with(self.upload_root.join(".staging")));
        files.sort();
        files
    }

    #[allow(dead_code)]
    pub fn staged_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(&self.upload_root.join(".staging"), &mut files);
        files
    }

    /// Writes `bytes` at `relative` under the document root.
    #[allow(dead_code)]
    pub fn place_file(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.document_root.join(relative);
        std::fs::create_dir_all(path.parent().expect("parent directory")).expect("create dirs");
        std::fs::write(&path, bytes).expect("write file");
        path
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files);
        } else {
            files.push(path);
        }
    }
}

/// A small but well-formed PDF padded to `size` bytes.
#[allow(dead_code)]
pub fn pdf_bytes(size: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n".to_vec();
    let trailer = b"\n%%EOF\n";
    let padding = size.saturating_sub(bytes.len() + trailer.len());
    bytes.extend(std::iter::repeat(b'%').take(padding));
    bytes.extend_from_slice(trailer);
    bytes
}

#[allow(dead_code)]
pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0, 0, 0, 0x0D, b'I', b'H', b'D', b'R']);
    bytes.extend(std::iter::repeat(0u8).take(64));
    bytes
}

#[allow(dead_code)]
pub fn partition_dir(kind: AttachmentKind) -> String {
    format!("{}/{}", kind.storage_dir(), Utc::now().format("%Y/%m"))
}

#[allow(dead_code)]
pub fn header<B>(response: &hyper::Response<B>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body.collect().await?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_to_json(body: Body) -> Result<serde_json::Value> {
    let bytes = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
