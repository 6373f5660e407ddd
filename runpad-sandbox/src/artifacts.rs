//! Harvesting output files after the run
//!
//! Only the workspace root is scanned, and only names on the allow-list are
//! read. Symlinks and anything that is not a regular file are skipped, so a
//! program cannot point the collector at files outside its workspace.

use crate::config::ArtifactConfig;
use crate::types::Artifact;
use crate::workspace::Workspace;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// What the collector found
#[derive(Debug, Clone, Default)]
pub struct CollectedArtifacts {
    /// Bytes of the primary image
    pub primary: Option<Vec<u8>>,

    /// All harvested artifacts, primary first
    pub artifacts: Vec<Artifact>,

    /// Files that matched but were not returned
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    config: ArtifactConfig,
}

impl ArtifactCollector {
    pub fn new(config: ArtifactConfig) -> Self {
        Self { config }
    }

    fn matches(&self, name: &str) -> bool {
        if self.config.primary.as_deref() == Some(name) || self.config.names.iter().any(|n| n == name) {
            return true;
        }
        match Path::new(name).extension().and_then(|ext| ext.to_str()) {
            Some(ext) => self
                .config
                .extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Collect allow-listed files from the workspace root
    ///
    /// `inputs` are the normalized names of the submitted files; they are
    /// never echoed back. Read failures become warnings.
    pub async fn collect(&self, workspace: &Workspace, inputs: &HashSet<String>) -> CollectedArtifacts {
        let mut collected = CollectedArtifacts::default();

        let mut entries = match tokio::fs::read_dir(workspace.path()).await {
            Ok(entries) => entries,
            Err(e) => {
                collected
                    .warnings
                    .push(format!("could not scan workspace for artifacts: {}", e));
                return collected;
            }
        };

        let mut candidates = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if inputs.contains(&name) || !self.matches(&name) {
                        continue;
                    }
                    candidates.push(name);
                }
                Ok(None) => break,
                Err(e) => {
                    collected
                        .warnings
                        .push(format!("could not scan workspace for artifacts: {}", e));
                    break;
                }
            }
        }

        // Primary first, the rest in name order for stable responses.
        let primary = self.config.primary.clone();
        candidates.sort_by(|a, b| {
            let a_primary = Some(a) == primary.as_ref();
            let b_primary = Some(b) == primary.as_ref();
            b_primary.cmp(&a_primary).then_with(|| a.cmp(b))
        });

        for name in candidates {
            if collected.artifacts.len() >= self.config.max_artifacts {
                collected.warnings.push(format!(
                    "artifact limit of {} reached, skipping {}",
                    self.config.max_artifacts, name
                ));
                continue;
            }
            match read_regular_file(&workspace.join(&name), self.config.max_artifact_bytes).await {
                Ok(Some(bytes)) => {
                    debug!(execution_id = %workspace.id(), artifact = %name, size = bytes.len(), "Artifact collected");
                    if Some(&name) == primary.as_ref() {
                        collected.primary = Some(bytes.clone());
                    }
                    collected.artifacts.push(Artifact {
                        media_type: media_type_of(&name).to_string(),
                        name,
                        bytes,
                    });
                }
                Ok(None) => {
                    debug!(execution_id = %workspace.id(), artifact = %name, "Not a regular file, skipping");
                }
                Err(ReadError::TooLarge(size)) => {
                    collected.warnings.push(format!(
                        "artifact {} is {} bytes, larger than the {} byte limit",
                        name, size, self.config.max_artifact_bytes
                    ));
                }
                Err(ReadError::Io(e)) => {
                    warn!(execution_id = %workspace.id(), artifact = %name, error = %e, "Failed to read artifact");
                    collected
                        .warnings
                        .push(format!("could not read artifact {}: {}", name, e));
                }
            }
        }

        collected
    }
}

enum ReadError {
    TooLarge(u64),
    Io(io::Error),
}

/// Read `path` if it is a regular file no larger than `max_bytes`
///
/// Returns `Ok(None)` for symlinks and special files.
async fn read_regular_file(path: &Path, max_bytes: u64) -> Result<Option<Vec<u8>>, ReadError> {
    let metadata = tokio::fs::symlink_metadata(path).await.map_err(ReadError::Io)?;
    if !metadata.file_type().is_file() {
        return Ok(None);
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    options.custom_flags(nix::libc::O_NOFOLLOW);
    let file = match options.open(path).await {
        Ok(file) => file,
        // The name was swapped for a symlink after the metadata check.
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(nix::libc::ELOOP) => return Ok(None),
        Err(e) => return Err(ReadError::Io(e)),
    };

    let metadata = file.metadata().await.map_err(ReadError::Io)?;
    if !metadata.is_file() {
        return Ok(None);
    }
    if metadata.len() > max_bytes {
        return Err(ReadError::TooLarge(metadata.len()));
    }

    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    file.take(max_bytes + 1)
        .read_to_end(&mut bytes)
        .await
        .map_err(ReadError::Io)?;
    if bytes.len() as u64 > max_bytes {
        return Err(ReadError::TooLarge(bytes.len() as u64));
    }
    Ok(Some(bytes))
}

/// Media type for an artifact file name
pub fn media_type_of(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("html") => "text/html",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
