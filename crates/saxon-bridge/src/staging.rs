//! Worker executable provisioning.
//!
//! The worker is either an executable already on disk, or raw bytes (typically
//! `include_bytes!` of a per-platform build) that get staged to a uniquely named
//! temp file before launch. A staged file belongs to exactly one worker and is
//! removed during its teardown.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STAGED_PREFIX: &str = "saxon-worker-";

/// Where the worker executable comes from.
#[derive(Clone)]
pub enum WorkerSource {
    /// Externally supplied executable, used in place.
    Path(PathBuf),
    /// Executable bytes for the current platform, staged on every start.
    Embedded(Cow<'static, [u8]>),
}

impl WorkerSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn embedded(bytes: &'static [u8]) -> Self {
        Self::Embedded(Cow::Borrowed(bytes))
    }
}

impl fmt::Debug for WorkerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Embedded(bytes) => f
                .debug_struct("Embedded")
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("failed to create temp file for worker executable: {0}")]
    Create(#[source] io::Error),

    #[error("failed to write worker executable to {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to mark {path:?} executable: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("failed to delete staged worker executable {path:?} after {attempts} attempts: {source}")]
    RemoveStaged {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Bounded retry for deleting a staged executable.
///
/// A just-killed worker can keep its image locked for a moment (notably on
/// Windows). The default allows one attempt plus 200 retries 10ms apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 200,
            interval: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

/// File name suffix of staged workers on this platform.
pub fn platform_suffix() -> &'static str {
    if cfg!(windows) {
        ".exe"
    } else if cfg!(target_os = "linux") {
        ".lnx"
    } else if cfg!(target_os = "macos") {
        ".mac"
    } else {
        ".bin"
    }
}

/// A worker executable written to a temp file. Deleted at most once.
#[derive(Debug)]
pub struct StagedExecutable {
    path: PathBuf,
    removed: bool,
}

impl StagedExecutable {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the staged file, retrying per `policy`. No-op once removed.
    pub async fn remove(&mut self, policy: &RetryPolicy) -> Result<(), TeardownError> {
        if self.removed {
            return Ok(());
        }
        tracing::debug!(path = %self.path.display(), "Removing staged worker executable");
        remove_with_retry(&self.path, policy, |path| std::fs::remove_file(path)).await?;
        self.removed = true;
        tracing::debug!("Staged worker executable removed");
        Ok(())
    }
}

impl Drop for StagedExecutable {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged worker executable on drop");
            }
        }
    }
}

/// Write `bytes` to a fresh temp file and make it executable.
///
/// On failure the partially written file is removed before returning.
pub fn stage(bytes: &[u8]) -> Result<StagedExecutable, StagingError> {
    let mut file = tempfile::Builder::new()
        .prefix(STAGED_PREFIX)
        .suffix(platform_suffix())
        .tempfile()
        .map_err(StagingError::Create)?;
    let path = file.path().to_path_buf();

    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Staging worker executable");

    // NamedTempFile deletes itself on drop, so every early return below cleans up.
    file.write_all(bytes)
        .and_then(|()| file.flush())
        .map_err(|source| StagingError::Write {
            path: path.clone(),
            source,
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))
            .map_err(|source| StagingError::Permissions {
                path: path.clone(),
                source,
            })?;
    }

    // Close our write handle before anything tries to exec the file.
    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| StagingError::Write {
            path,
            source: e.error,
        })?;

    Ok(StagedExecutable {
        path,
        removed: false,
    })
}

/// Remove `path` with bounded retry. A missing file counts as removed.
pub async fn remove_with_retry<F>(
    path: &Path,
    policy: &RetryPolicy,
    mut remove: F,
) -> Result<(), TeardownError>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut retries = 0;
    loop {
        match remove(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if retries < policy.retries => {
                retries += 1;
                tracing::trace!(retries, error = %e, "Staged executable still locked, retrying");
                tokio::time::sleep(policy.interval).await;
            }
            Err(source) => {
                return Err(TeardownError::RemoveStaged {
                    path: path.to_path_buf(),
                    attempts: retries + 1,
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn stage_writes_bytes_with_platform_name() {
        let staged = stage(b"#!/bin/sh\nexit 0\n").unwrap();
        let name = staged.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(STAGED_PREFIX), "{name}");
        assert!(name.ends_with(platform_suffix()), "{name}");
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"#!/bin/sh\nexit 0\n");
    }

    #[cfg(unix)]
    #[test]
    fn stage_sets_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let staged = stage(b"").unwrap();
        let mode = std::fs::metadata(staged.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn staged_paths_are_unique() {
        let a = stage(b"a").unwrap();
        let b = stage(b"b").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn drop_removes_unremoved_file() {
        let staged = stage(b"x").unwrap();
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mut staged = stage(b"x").unwrap();
        let path = staged.path().to_path_buf();
        let policy = RetryPolicy::default();

        staged.remove(&policy).await.unwrap();
        assert!(!path.exists());

        // Someone else reuses the name; a second remove must not touch it.
        std::fs::write(&path, b"not ours").unwrap();
        staged.remove(&policy).await.unwrap();
        drop(staged);
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn remove_succeeds_after_transient_lock() {
        let started = Instant::now();
        let mut calls = 0u32;
        let result = remove_with_retry(Path::new("locked.exe"), &RetryPolicy::default(), |_| {
            calls += 1;
            if started.elapsed() < Duration::from_millis(1900) {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use"))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls, 191);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_gives_up_after_retry_budget() {
        let started = Instant::now();
        let mut calls = 0u32;
        let err = remove_with_retry(Path::new("locked.exe"), &RetryPolicy::default(), |_| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use"))
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 201);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        let TeardownError::RemoveStaged { attempts, .. } = err;
        assert_eq!(attempts, 201);
    }

    #[tokio::test]
    async fn missing_file_counts_as_removed() {
        let dir = tempfile::tempdir().unwrap();
        let result = remove_with_retry(
            &dir.path().join("gone"),
            &RetryPolicy::default(),
            |path| std::fs::remove_file(path),
        )
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn debug_does_not_dump_embedded_bytes() {
        let source = WorkerSource::embedded(b"\x7fELF....");
        assert_eq!(format!("{source:?}"), "Embedded { len: 8 }");
    }
}
