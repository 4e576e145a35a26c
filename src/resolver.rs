//! Locating the file behind a recorded `stored_path`.
//!
//! Rows written over the years use several path conventions. The resolver
//! probes an ordered candidate list and returns the first existing file. All
//! of the legacy handling lives here so it can be removed once stored paths
//! are backfilled to a single convention.

use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::models::AttachmentKind;

const LEGACY_API_SEGMENT: &str = "api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    NotFound,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    upload_root: PathBuf,
    document_root: PathBuf,
    legacy_prefixes: Vec<String>,
}

impl PathResolver {
    pub fn new(
        upload_root: impl Into<PathBuf>,
        document_root: impl Into<PathBuf>,
        legacy_prefixes: Vec<String>,
    ) -> Self {
        Self {
            upload_root: upload_root.into(),
            document_root: document_root.into(),
            legacy_prefixes: legacy_prefixes
                .into_iter()
                .map(|prefix| normalize(&prefix))
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.upload_root.clone(),
            config.document_root.clone(),
            config.legacy_path_prefixes.clone(),
        )
    }

    /// Candidate locations for `stored`, most likely first, without duplicates.
    pub fn candidates(&self, kind: AttachmentKind, stored: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        let relative = normalize(stored);

        if is_confined(&relative) {
            push_unique(&mut candidates, self.upload_root.join(&relative));
            push_unique(&mut candidates, self.document_root.join(&relative));

            if self
                .legacy_prefixes
                .iter()
                .any(|prefix| relative.starts_with(prefix.as_str()))
            {
                push_unique(
                    &mut candidates,
                    self.document_root.join(LEGACY_API_SEGMENT).join(&relative),
                );
            }

            if let Some(singular) = kind.legacy_storage_dir() {
                if let Some(renamed) = rename_segment(&relative, kind.storage_dir(), singular) {
                    push_unique(&mut candidates, self.upload_root.join(&renamed));
                    push_unique(&mut candidates, self.document_root.join(&renamed));
                }
            }
        }

        let verbatim = stored.trim();
        if looks_absolute(verbatim) {
            push_unique(&mut candidates, PathBuf::from(verbatim));
        }

        candidates
    }

    pub fn resolve(&self, kind: AttachmentKind, stored: &str) -> Resolution {
        self.candidates(kind, stored)
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(Resolution::Found)
            .unwrap_or(Resolution::NotFound)
    }
}

fn normalize(stored: &str) -> String {
    let unified = stored.trim().replace('\\', "/");
    let mut relative = unified.as_str();
    loop {
        let stripped = relative.trim_start_matches('/');
        let stripped = stripped.strip_prefix("./").unwrap_or(stripped);
        if stripped.len() == relative.len() {
            break;
        }
        relative = stripped;
    }
    relative.to_string()
}

/// Relative paths that stay under whichever root they are joined to.
fn is_confined(relative: &str) -> bool {
    !relative.is_empty()
        && !has_drive_prefix(relative)
        && relative
            .split('/')
            .all(|segment| segment != ".." && segment != ".")
}

fn looks_absolute(raw: &str) -> bool {
    raw.starts_with('/') || raw.starts_with('\\') || has_drive_prefix(raw)
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

fn rename_segment(relative: &str, from: &str, to: &str) -> Option<String> {
    let mut segments: Vec<&str> = relative.split('/').collect();
    let position = segments.iter().position(|segment| *segment == from)?;
    segments[position] = to;
    Some(segments.join("/"))
}

fn push_unique(candidates: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !candidates.iter().any(|existing| existing == &candidate) {
        candidates.push(candidate);
    }
}

/// Path of a file relative to `root`, using `/` separators, when it lives
/// under that root.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
