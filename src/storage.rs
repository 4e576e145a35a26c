use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempPath;
use tracing::debug;

use crate::config::AppConfig;
use crate::models::AttachmentKind;
use crate::sanitize::SanitizedName;

/// Upper bound on `name_N.ext` probing before a claim gives up.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Reports free space on the volume holding a path.
pub trait SpaceProbe: Send + Sync + 'static {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Date-partitioned attachment files on the local filesystem.
pub struct LocalStorage {
    upload_root: PathBuf,
    staging_dir: PathBuf,
    date_partitioning: bool,
    probe: Arc<dyn SpaceProbe>,
}

impl LocalStorage {
    pub fn new(
        upload_root: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        date_partitioning: bool,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            upload_root: upload_root.into(),
            staging_dir: staging_dir.into(),
            date_partitioning,
            probe,
        }
    }

    pub fn from_config(config: &AppConfig, probe: Arc<dyn SpaceProbe>) -> Self {
        Self::new(
            config.upload_root.clone(),
            config.staging_dir.clone(),
            config.date_partitioning,
            probe,
        )
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    pub fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(&self.upload_root)?;
        fs::create_dir_all(&self.staging_dir)?;
        Ok(())
    }

    /// A fresh temporary file in the staging directory, removed on drop.
    pub fn stage(&self) -> io::Result<(fs::File, TempPath)> {
        fs::create_dir_all(&self.staging_dir)?;
        let staged = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&self.staging_dir)?;
        Ok(staged.into_parts())
    }

    pub fn available_space(&self) -> io::Result<u64> {
        self.probe.available_bytes(&self.upload_root)
    }

    /// Relative directory (`documents/2024/05`) and its absolute location.
    pub fn partition(&self, kind: AttachmentKind, now: DateTime<Utc>) -> (String, PathBuf) {
        let relative = if self.date_partitioning {
            format!("{}/{}", kind.storage_dir(), now.format("%Y/%m"))
        } else {
            kind.storage_dir().to_string()
        };
        let absolute = self.upload_root.join(&relative);
        (relative, absolute)
    }

    /// Moves a staged upload into `dir` under the first free `name_N.ext`.
    ///
    /// The final placement never overwrites: a name taken between the probe
    /// and the move sends the loop on to the next suffix.
    pub fn claim(
        &self,
        staged: TempPath,
        size: u64,
        dir: &Path,
        name: &SanitizedName,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let mut pending = staged;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = dir.join(name.with_suffix(attempt));
            if candidate.exists() {
                continue;
            }

            match pending.persist_noclobber(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    pending = err.path;
                }
                Err(err) => {
                    debug!(
                        error = %err.error,
                        target = %candidate.display(),
                        "atomic move unavailable; copying staged upload"
                    );
                    pending = err.path;
                    match copy_exclusive(&pending, &candidate, size) {
                        Ok(()) => return Ok(candidate),
                        Err(copy_err) if copy_err.kind() == io::ErrorKind::AlreadyExists => {}
                        Err(copy_err) => return Err(copy_err),
                    }
                }
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no free file name for {} in {}",
                name.file_name(),
                dir.display()
            ),
        ))
    }

    pub fn is_written(&self, path: &Path, size: u64) -> bool {
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.len() == size)
            .unwrap_or(false)
    }
}

fn copy_exclusive(source: &Path, target: &Path, expected: u64) -> io::Result<()> {
    let mut input = fs::File::open(source)?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;

    let copied = io::copy(&mut input, &mut output).and_then(|copied| {
        output.sync_all()?;
        Ok(copied)
    });

    match copied {
        Ok(copied) if copied == expected => Ok(()),
        Ok(copied) => {
            let _ = fs::remove_file(target);
            Err(io::Error::other(format!(
                "copied {copied} of {expected} bytes to {}",
                target.display()
            )))
        }
        Err(err) => {
            let _ = fs::remove_file(target);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{self, Write};
    use std::path::Path;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::{copy_exclusive, LocalStorage, SpaceProbe};
    use crate::models::AttachmentKind;
    use crate::sanitize::SanitizedName;

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    fn storage(root: &Path, partitioned: bool) -> LocalStorage {
        LocalStorage::new(
            root.join("uploads"),
            root.join("uploads/.staging"),
            partitioned,
            Arc::new(FixedProbe(u64::MAX)),
        )
    }

    fn staged_with(storage: &LocalStorage, bytes: &[u8]) -> tempfile::TempPath {
        let (mut file, path) = storage.stage().expect("stage");
        file.write_all(bytes).expect("write staged");
        path
    }

    #[test]
    fn partitions_by_year_and_month() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        let (relative, absolute) = storage(dir.path(), true).partition(AttachmentKind::Document, now);
        assert_eq!(relative, "documents/2024/03");
        assert_eq!(absolute, dir.path().join("uploads/documents/2024/03"));

        let (relative, _) = storage(dir.path(), false).partition(AttachmentKind::Evidence, now);
        assert_eq!(relative, "evidence");
    }

    #[test]
    fn claim_appends_suffix_when_name_taken() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path(), false);
        let target_dir = dir.path().join("uploads/documents");
        let name = SanitizedName::new("scan.pdf");

        let first = storage
            .claim(staged_with(&storage, b"one"), 3, &target_dir, &name)
            .expect("first claim");
        let second = storage
            .claim(staged_with(&storage, b"two"), 3, &target_dir, &name)
            .expect("second claim");

        assert_eq!(first, target_dir.join("scan.pdf"));
        assert_eq!(second, target_dir.join("scan_1.pdf"));
        assert_eq!(fs::read(&first).unwrap(), b"one");
        assert_eq!(fs::read(&second).unwrap(), b"two");
        assert!(storage.is_written(&second, 3));
        assert!(!storage.is_written(&second, 4));
    }

    #[test]
    fn staged_file_is_gone_after_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path(), false);
        let staged = staged_with(&storage, b"data");
        let staged_location = staged.to_path_buf();

        storage
            .claim(staged, 4, &dir.path().join("uploads/evidence"), &SanitizedName::new("a.pdf"))
            .expect("claim");
        assert!(!staged_location.exists());
    }

    #[test]
    fn exclusive_copy_refuses_existing_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::write(&source, b"payload").unwrap();
        fs::write(&target, b"existing").unwrap();

        let err = copy_exclusive(&source, &target, 7).expect_err("target exists");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&target).unwrap(), b"existing");
    }

    #[test]
    fn exclusive_copy_rejects_short_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::write(&source, b"payload").unwrap();

        assert!(copy_exclusive(&source, &target, 100).is_err());
        assert!(!target.exists());
    }
}
