/// Exclusive deploy lock.
///
/// Two runners against the same working directory must not interleave their
/// kill/sync/launch steps. The lock is an advisory `flock` on a hidden
/// sibling of the working directory (`/srv/.app.deploy.lock` for `/srv/app`)
/// whose contents are the holder's PID, so it does not depend on the data
/// directory or the caller's current directory. It is released when the
/// guard is dropped or the process dies.
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another runner holds the lock. `holder` is its PID when readable.
    Held {
        path: PathBuf,
        holder: Option<u32>,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path, holder } => match holder {
                Some(pid) => write!(
                    f,
                    "another deploy is in progress (pid {pid}, lock {})",
                    path.display()
                ),
                None => write!(
                    f,
                    "another deploy is in progress (lock {})",
                    path.display()
                ),
            },
            LockError::Write { path, source } => {
                write!(f, "failed to write lock file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
            LockError::Write { source, .. } => Some(source),
        }
    }
}

/// Lock file guarding `working_dir`. The parent is created and canonicalized
/// so different spellings of the same directory share one lock.
pub fn lock_path_for(working_dir: &Path) -> std::io::Result<PathBuf> {
    let parent = working_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let parent = std::fs::canonicalize(parent)?;
    let name = working_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkout".to_string());
    Ok(parent.join(format!(".{name}.deploy.lock")))
}

impl DeployLock {
    /// Take the lock guarding `working_dir` without blocking.
    pub fn for_working_dir(working_dir: &Path) -> Result<Self, LockError> {
        let path = lock_path_for(working_dir).map_err(|e| LockError::Open {
            path: working_dir.to_path_buf(),
            source: e,
        })?;
        Self::acquire(&path)
    }

    /// Try to take the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        // Do not truncate before holding the lock: that would wipe the
        // current holder's PID.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held {
                path: path.to_path_buf(),
                holder: read_holder(path),
            });
        }

        let write_err = |e| LockError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        file.set_len(0).map_err(write_err)?;
        writeln!(file, "{}", std::process::id()).map_err(write_err)?;
        file.flush().map_err(write_err)?;

        tracing::debug!(path = %path.display(), "deploy lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "deploy lock released");
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
