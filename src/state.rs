use std::sync::Arc;

use crate::{
    auth::jwt::JwtService, config::AppConfig, ingest::UploadIngest,
    repository::AttachmentRepository, resolver::PathResolver, storage::LocalStorage,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repository: Arc<dyn AttachmentRepository>,
    pub resolver: Arc<PathResolver>,
    pub ingest: Arc<UploadIngest>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repository: Arc<dyn AttachmentRepository>,
        storage: Arc<LocalStorage>,
        jwt: JwtService,
    ) -> Self {
        let resolver = PathResolver::from_config(&config);
        let ingest = UploadIngest::new(&config, storage, repository.clone());
        Self {
            config: Arc::new(config),
            repository,
            resolver: Arc::new(resolver),
            ingest: Arc::new(ingest),
            jwt,
        }
    }
}
