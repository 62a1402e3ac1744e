/// Status file: writes `status.json` on every deploy phase transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Deploy states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Starting,
    Stopping,
    Syncing,
    InstallingDependencies,
    Launching,
    Succeeded,
    Failed,
}

/// The JSON payload written to `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    /// PID of the runner, not the service.
    pub pid: u32,
    pub state: DeployState,
    pub deploy_id: Option<i64>,
    pub working_dir: String,
    pub commit: Option<String>,
    pub service_pid: Option<u32>,
    pub log_file: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".status.json.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read the last written status, if any.
    pub fn read(&self) -> Option<StatusData> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    deploy_id: Option<i64>,
    working_dir: String,
    commit: Option<String>,
    service_pid: Option<u32>,
    log_file: String,
    error: Option<String>,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, working_dir: &Path, log_file: &Path) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            deploy_id: None,
            working_dir: working_dir.display().to_string(),
            commit: None,
            service_pid: None,
            log_file: log_file.display().to_string(),
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: DeployState) {
        let data = StatusData {
            pid: self.pid,
            state,
            deploy_id: self.deploy_id,
            working_dir: self.working_dir.clone(),
            commit: self.commit.clone(),
            service_pid: self.service_pid,
            log_file: self.log_file.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_deploy_id(&mut self, id: Option<i64>) {
        self.deploy_id = id;
    }

    pub fn set_commit(&mut self, commit: &str) {
        self.commit = Some(commit.to_string());
    }

    pub fn set_service_pid(&mut self, pid: u32) {
        self.service_pid = Some(pid);
    }

    pub fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
