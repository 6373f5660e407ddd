//! Per-request workspaces
//!
//! Each execution gets its own `run-<uuid>` directory under a shared root.
//! Partitioning by id means concurrent requests never coordinate; the only
//! rule is that every workspace created is removed exactly once.

use crate::config::InputLimits;
use crate::error::{Result, SandboxError};
use crate::execution::ExecutionId;
use crate::types::SourceFile;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const ORPHANED_METRIC: &str = "runpad_workspace_orphaned_total";

/// Validate a submitted filename and return its normalized relative path
///
/// Rejects empty names, absolute paths, `..` components, empty components,
/// backslashes and NUL bytes. `.` components are dropped.
pub fn validate_filename(name: &str) -> Result<PathBuf> {
    if name.trim().is_empty() {
        return Err(SandboxError::invalid("filename must not be empty"));
    }
    if name.contains('\0') {
        return Err(SandboxError::invalid(format!(
            "filename {:?} contains a NUL byte",
            name
        )));
    }
    if name.contains('\\') {
        return Err(SandboxError::invalid(format!(
            "filename {:?} contains a backslash",
            name
        )));
    }
    if name.starts_with('/') || Path::new(name).is_absolute() {
        return Err(SandboxError::invalid(format!(
            "filename {:?} is an absolute path",
            name
        )));
    }

    let mut normalized = PathBuf::new();
    for segment in name.split('/') {
        match segment {
            "" => {
                return Err(SandboxError::invalid(format!(
                    "filename {:?} has an empty path component",
                    name
                )))
            }
            "." => continue,
            ".." => {
                return Err(SandboxError::invalid(format!(
                    "filename {:?} escapes the workspace",
                    name
                )))
            }
            segment => normalized.push(segment),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(SandboxError::invalid(format!(
            "filename {:?} does not name a file",
            name
        )));
    }
    Ok(normalized)
}

/// An ephemeral directory owned by one execution
///
/// Dropping a workspace that was never destroyed removes it synchronously,
/// so cancelled requests do not leak directories.
#[derive(Debug)]
pub struct Workspace {
    id: ExecutionId,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of a workspace-relative file
    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.path.join(relative)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            execution_id = %self.id,
            path = %self.path.display(),
            "Workspace dropped without teardown, removing"
        );
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    execution_id = %self.id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
                metrics::counter!(ORPHANED_METRIC).increment(1);
            }
        }
    }
}

/// Creates, fills and destroys workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    limits: InputLimits,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, limits: InputLimits) -> Self {
        Self {
            root: root.into(),
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh, empty workspace for `id`
    pub async fn create(&self, id: ExecutionId) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            SandboxError::resource(
                format!("Failed to create workspace root {}", self.root.display()),
                e,
            )
        })?;

        let path = self.root.join(id.workspace_dir_name());
        tokio::fs::create_dir(&path).await.map_err(|e| {
            let context = if e.kind() == io::ErrorKind::AlreadyExists {
                format!("Workspace {} was not cleaned up", path.display())
            } else {
                format!("Failed to create workspace {}", path.display())
            };
            SandboxError::resource(context, e)
        })?;

        let workspace = Workspace {
            id,
            path,
            released: false,
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(
                workspace.path(),
                std::fs::Permissions::from_mode(0o700),
            )
            .await
            .map_err(|e| SandboxError::resource("Failed to restrict workspace permissions", e))?;
        }

        debug!(execution_id = %id, path = %workspace.path.display(), "Workspace created");
        Ok(workspace)
    }

    /// Check a file set against the input rules without touching the disk
    ///
    /// Returns the normalized path of every file, in submission order.
    pub fn validate_files(&self, files: &[SourceFile]) -> Result<Vec<PathBuf>> {
        if files.is_empty() {
            return Err(SandboxError::invalid("request contains no files"));
        }
        if files.len() > self.limits.max_files {
            return Err(SandboxError::invalid(format!(
                "request contains {} files, the limit is {}",
                files.len(),
                self.limits.max_files
            )));
        }
        let total: usize = files.iter().map(|f| f.content.len()).sum();
        if total > self.limits.max_total_bytes {
            return Err(SandboxError::invalid(format!(
                "request contains {} bytes of source, the limit is {}",
                total, self.limits.max_total_bytes
            )));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(files.len());
        for file in files {
            if file.filename.len() > self.limits.max_filename_len {
                return Err(SandboxError::invalid(format!(
                    "filename {:?} is longer than {} bytes",
                    file.filename, self.limits.max_filename_len
                )));
            }
            let path = validate_filename(&file.filename)?;
            if !seen.insert(path.clone()) {
                return Err(SandboxError::invalid(format!(
                    "duplicate filename {:?}",
                    file.filename
                )));
            }
            normalized.push(path);
        }

        // A file cannot also be the parent directory of another file.
        for path in &normalized {
            if let Some(parent) = path.ancestors().skip(1).find(|a| seen.contains(*a)) {
                return Err(SandboxError::invalid(format!(
                    "{} is both a file and a directory",
                    parent.display()
                )));
            }
        }

        Ok(normalized)
    }

    /// Materialize `files` into the workspace
    ///
    /// All filenames are validated before anything is written.
    pub async fn write_files(&self, workspace: &Workspace, files: &[SourceFile]) -> Result<()> {
        let paths = self.validate_files(files)?;

        for (file, relative) in files.iter().zip(&paths) {
            let target = workspace.join(relative);
            if let Some(parent) = target.parent() {
                if parent != workspace.path() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        SandboxError::resource(
                            format!("Failed to create directory for {}", relative.display()),
                            e,
                        )
                    })?;
                }
            }
            tokio::fs::write(&target, file.content.as_bytes())
                .await
                .map_err(|e| {
                    SandboxError::resource(format!("Failed to write {}", relative.display()), e)
                })?;
        }

        debug!(
            execution_id = %workspace.id,
            files = files.len(),
            "Files written"
        );
        Ok(())
    }

    /// Remove the workspace (idempotent, never fails)
    ///
    /// A removal failure leaves an orphaned directory behind; it is logged
    /// and counted, and the next stale sweep picks it up.
    pub async fn destroy(&self, workspace: &mut Workspace) {
        if workspace.released {
            return;
        }
        workspace.released = true;

        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => {
                debug!(execution_id = %workspace.id, "Workspace destroyed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    execution_id = %workspace.id,
                    path = %workspace.path.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
                metrics::counter!(ORPHANED_METRIC).increment(1);
            }
        }
    }

    /// Remove `run-*` directories older than `max_age` left by earlier processes
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot scan workspace root");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("run-") {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    metrics::counter!(ORPHANED_METRIC).increment(1);
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to sweep workspace"),
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "Swept stale workspaces");
        }
        removed
    }
}
