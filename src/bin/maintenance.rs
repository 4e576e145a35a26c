use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use claimvault::{
    config::AppConfig,
    db,
    models::AttachmentKind,
    repository::{AttachmentRepository, PgAttachmentRepository},
    resolver::{relative_to, PathResolver, Resolution},
};

const USAGE: &str = "Usage: maintenance <missing-files|orphan-files> [documents|evidence]";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    let command = args.next();
    let kinds = match args.next() {
        Some(raw) => vec![raw.parse::<AttachmentKind>().map_err(|err| anyhow!(err))?],
        None => AttachmentKind::ALL.to_vec(),
    };

    match command.as_deref() {
        Some("missing-files") => report_missing_files(&kinds).await?,
        Some("orphan-files") => report_orphan_files(&kinds).await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect() -> Result<(AppConfig, PgAttachmentRepository)> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        upload_root = %config.upload_root.display(),
        document_root = %config.document_root.display(),
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    Ok((config, PgAttachmentRepository::new(pool)))
}

/// Lists records whose file cannot be located under any known layout.
async fn report_missing_files(kinds: &[AttachmentKind]) -> Result<()> {
    let (config, repository) = connect()?;
    let resolver = PathResolver::from_config(&config);

    let mut missing = 0usize;
    for &kind in kinds {
        let attachments = repository
            .list_all(kind)
            .await
            .with_context(|| format!("failed to load {kind} records"))?;
        for attachment in &attachments {
            if let Resolution::NotFound = resolver.resolve(kind, &attachment.stored_path) {
                missing += 1;
                println!(
                    "{kind}\tid={}\towner={}\t{}",
                    attachment.id, attachment.owner_id, attachment.stored_path
                );
            }
        }
        println!("{kind}: checked {} records", attachments.len());
    }

    println!("{missing} records without a file.");
    Ok(())
}

/// Lists files under the storage directories that no record points at.
async fn report_orphan_files(kinds: &[AttachmentKind]) -> Result<()> {
    let (config, repository) = connect()?;
    let resolver = PathResolver::from_config(&config);

    let mut orphans = 0usize;
    for &kind in kinds {
        let referenced: HashSet<PathBuf> = repository
            .list_all(kind)
            .await
            .with_context(|| format!("failed to load {kind} records"))?
            .iter()
            .filter_map(|attachment| match resolver.resolve(kind, &attachment.stored_path) {
                Resolution::Found(path) => Some(canonical(path)),
                Resolution::NotFound => None,
            })
            .collect();

        let mut directories = vec![config.upload_root.join(kind.storage_dir())];
        if let Some(legacy) = kind.legacy_storage_dir() {
            directories.push(config.upload_root.join(legacy));
        }

        for directory in directories {
            let mut files = Vec::new();
            collect_files(&directory, &mut files)
                .with_context(|| format!("failed to scan {}", directory.display()))?;
            for file in files.into_iter().filter(|file| !referenced.contains(&canonical(file.clone()))) {
                orphans += 1;
                let shown = relative_to(&config.upload_root, &file)
                    .unwrap_or_else(|| file.display().to_string());
                println!("{kind}\t{shown}");
            }
        }
    }

    println!("{orphans} files without a record.");
    Ok(())
}

/// Absolute form used to compare paths reached through different roots.
fn canonical(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

fn collect_files(directory: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !directory.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
