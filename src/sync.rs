/// Source synchronization: clone a fresh checkout or fast-forward an existing one.
///
/// A failed sync never leaves a half-updated tree: `fetch` only touches the
/// object store and `merge --ff-only` refuses anything it cannot apply cleanly.
use crate::command::{CommandError, ToolCommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Pulled,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Pulled => "pulled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub action: SyncAction,
    /// HEAD before the pull. None for a fresh clone.
    pub previous: Option<String>,
    pub head: String,
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        self.previous.as_deref() != Some(self.head.as_str())
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// `working_dir` has content but is not a git checkout.
    NotACheckout { path: PathBuf },
    CreateParent {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The finished clone could not be moved into `working_dir`.
    Install {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Git(CommandError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotACheckout { path } => write!(
                f,
                "{} exists and is not a git checkout; refusing to clone over it",
                path.display()
            ),
            SyncError::CreateParent { path, source } => {
                write!(f, "failed to create {}: {source}", path.display())
            }
            SyncError::Install { from, to, source } => write!(
                f,
                "failed to move clone {} -> {}: {source}",
                from.display(),
                to.display()
            ),
            SyncError::Git(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::NotACheckout { .. } => None,
            SyncError::CreateParent { source, .. } | SyncError::Install { source, .. } => {
                Some(source)
            }
            SyncError::Git(e) => Some(e),
        }
    }
}

impl From<CommandError> for SyncError {
    fn from(e: CommandError) -> Self {
        SyncError::Git(e)
    }
}

/// Where and what to synchronize.
#[derive(Debug, Clone)]
pub struct SyncTarget<'a> {
    pub working_dir: &'a Path,
    pub repo_url: &'a str,
    pub remote: &'a str,
    pub branch: Option<&'a str>,
    pub timeout: Duration,
}

fn git(timeout: Duration) -> ToolCommand {
    // Fail on missing credentials instead of waiting for a prompt.
    ToolCommand::new("git", timeout).env("GIT_TERMINAL_PROMPT", "0")
}

/// A checkout is a `.git` directory whose HEAD resolves to a commit.
pub async fn is_checkout(dir: &Path, timeout: Duration) -> bool {
    if !dir.join(".git").exists() {
        return false;
    }
    git(timeout)
        .args(["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
        .current_dir(dir)
        .run()
        .await
        .is_ok()
}

pub async fn head_commit(dir: &Path, timeout: Duration) -> Result<String, SyncError> {
    let out = git(timeout)
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .run()
        .await?;
    Ok(out.stdout.trim().to_string())
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Sibling directory the clone is staged in before it replaces `dir`.
fn staging_path(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkout".to_string());
    dir.with_file_name(format!(".{name}.clone.{}", std::process::id()))
}

fn remove_staging(staging: &Path) {
    if staging.exists() {
        if let Err(e) = std::fs::remove_dir_all(staging) {
            tracing::warn!(error = %e, path = %staging.display(), "failed to remove partial clone");
        }
    }
}

/// Clone next to `working_dir` and move the result into place, so an
/// interrupted clone (timeout, network loss) never leaves a partial checkout.
async fn clone(target: &SyncTarget<'_>) -> Result<(), SyncError> {
    let dir = target.working_dir;
    if dir.exists() && !dir_is_empty(dir) {
        return Err(SyncError::NotACheckout {
            path: dir.to_path_buf(),
        });
    }
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::CreateParent {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let staging = staging_path(dir);
    remove_staging(&staging);

    let mut cmd = git(target.timeout).args(["clone", "--origin", target.remote]);
    if let Some(branch) = target.branch {
        cmd = cmd.args(["--branch", branch]);
    }
    cmd = cmd
        .arg(target.repo_url)
        .arg(staging.to_string_lossy().into_owned());

    tracing::info!(repo = %target.repo_url, path = %dir.display(), "cloning");
    if let Err(e) = cmd.run().await {
        remove_staging(&staging);
        return Err(e.into());
    }

    let install_err = |e| SyncError::Install {
        from: staging.clone(),
        to: dir.to_path_buf(),
        source: e,
    };
    // An empty working_dir is replaced; rename cannot overwrite a directory.
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir(dir) {
            remove_staging(&staging);
            return Err(install_err(e));
        }
    }
    if let Err(e) = std::fs::rename(&staging, dir) {
        remove_staging(&staging);
        return Err(install_err(e));
    }
    Ok(())
}

async fn pull(target: &SyncTarget<'_>) -> Result<(), SyncError> {
    let dir = target.working_dir;
    let mut fetch = git(target.timeout)
        .args(["fetch", target.remote])
        .current_dir(dir);
    if let Some(branch) = target.branch {
        fetch = fetch.arg(branch);
    }
    tracing::info!(remote = %target.remote, branch = ?target.branch, "fetching");
    fetch.run().await?;

    let merge_ref = if target.branch.is_some() {
        "FETCH_HEAD"
    } else {
        "@{u}"
    };
    git(target.timeout)
        .args(["merge", "--ff-only", merge_ref])
        .current_dir(dir)
        .run()
        .await?;
    Ok(())
}

/// Bring `working_dir` up to date with the remote.
pub async fn sync(target: &SyncTarget<'_>) -> Result<SyncOutcome, SyncError> {
    let dir = target.working_dir;
    let outcome = if is_checkout(dir, target.timeout).await {
        let previous = head_commit(dir, target.timeout).await?;
        pull(target).await?;
        SyncOutcome {
            action: SyncAction::Pulled,
            previous: Some(previous),
            head: head_commit(dir, target.timeout).await?,
        }
    } else {
        clone(target).await?;
        SyncOutcome {
            action: SyncAction::Cloned,
            previous: None,
            head: head_commit(dir, target.timeout).await?,
        }
    };

    tracing::info!(
        action = outcome.action.as_str(),
        head = %outcome.head,
        changed = outcome.changed(),
        "source synchronized"
    );
    Ok(outcome)
}
