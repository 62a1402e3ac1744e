/// The deploy sequence: lock, stop, sync, install, launch.
///
/// Each phase runs once, in order. The first failure aborts the remaining
/// phases and nothing is rolled back: a failed install after a successful
/// pull leaves the new tree in place and the service stopped.
use crate::config::DeployConfig;
use crate::data_dir::DataDir;
use crate::db;
use crate::deps::{self, DependencyError, InstallOutcome};
use crate::lock::{DeployLock, LockError};
use crate::launch::{self, LaunchError};
use crate::process::{self, PidFile, ProcessRecord, StopError, StopOutcome};
use crate::status::{DeployState, StatusTracker};
use crate::sync::{self, SyncError, SyncOutcome, SyncTarget};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Lock,
    Stop,
    Sync,
    Dependencies,
    Launch,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Lock => "lock",
            Phase::Stop => "stop",
            Phase::Sync => "sync",
            Phase::Dependencies => "dependencies",
            Phase::Launch => "launch",
        }
    }
}

#[derive(Debug)]
pub enum DeployError {
    /// The state directory could not be created.
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock(LockError),
    Stop(StopError),
    Sync(SyncError),
    Dependency(DependencyError),
    Launch(LaunchError),
}

impl DeployError {
    pub fn phase(&self) -> Phase {
        match self {
            DeployError::DataDir { .. } => Phase::Setup,
            DeployError::Lock(_) => Phase::Lock,
            DeployError::Stop(_) => Phase::Stop,
            DeployError::Sync(_) => Phase::Sync,
            DeployError::Dependency(_) => Phase::Dependencies,
            DeployError::Launch(_) => Phase::Launch,
        }
    }
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployError::DataDir { path, source } => write!(
                f,
                "failed to create state directory {}: {source}",
                path.display()
            ),
            DeployError::Lock(e) => write!(f, "{e}"),
            DeployError::Stop(e) => write!(f, "{e}"),
            DeployError::Sync(e) => write!(f, "{e}"),
            DeployError::Dependency(e) => write!(f, "{e}"),
            DeployError::Launch(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeployError::DataDir { source, .. } => Some(source),
            DeployError::Lock(e) => Some(e),
            DeployError::Stop(e) => Some(e),
            DeployError::Sync(e) => Some(e),
            DeployError::Dependency(e) => Some(e),
            DeployError::Launch(e) => Some(e),
        }
    }
}

/// Everything a successful deploy did.
#[derive(Debug)]
pub struct DeployReport {
    pub deploy_id: Option<i64>,
    pub stop: StopOutcome,
    pub sync: SyncOutcome,
    pub deps: InstallOutcome,
    pub service: ProcessRecord,
}

/// Deploy history, best effort: a broken database never fails a deploy.
struct History {
    conn: Option<Connection>,
    id: Option<i64>,
}

impl History {
    fn open(dd: &DataDir) -> Self {
        let conn = match db::open_or_create(&dd.db()) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "deploy history unavailable");
                None
            }
        };
        let id = conn.as_ref().and_then(|c| match db::start_deploy(c) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record deploy start");
                None
            }
        });
        Self { conn, id }
    }

    fn succeeded(&self, report: &DeployReport) {
        let (Some(conn), Some(id)) = (&self.conn, self.id) else {
            return;
        };
        let success = db::DeploySuccess {
            sync_action: report.sync.action.as_str(),
            previous_commit: report.sync.previous.as_deref(),
            commit: &report.sync.head,
            service_pid: report.service.pid,
        };
        if let Err(e) = db::finish_success(conn, id, &success) {
            tracing::warn!(error = %e, "failed to record deploy result");
        }
    }

    fn failed(&self, err: &DeployError, commit: Option<&str>) {
        let (Some(conn), Some(id)) = (&self.conn, self.id) else {
            return;
        };
        if let Err(e) =
            db::finish_failure(conn, id, err.phase().as_str(), commit, &err.to_string())
        {
            tracing::warn!(error = %e, "failed to record deploy result");
        }
    }
}

fn data_dir(config: &DeployConfig) -> Result<DataDir, DeployError> {
    let dd = DataDir::new(&config.storage.data_dir);
    dd.init().map_err(|e| DeployError::DataDir {
        path: dd.root().to_path_buf(),
        source: e,
    })?;
    Ok(dd)
}

/// Run the full deploy sequence under the deploy lock.
pub async fn deploy(config: &DeployConfig) -> Result<DeployReport, DeployError> {
    let dd = data_dir(config)?;
    let lock =
        DeployLock::for_working_dir(&config.app.working_dir).map_err(DeployError::Lock)?;
    tracing::debug!(lock = %lock.path().display(), "deploy lock acquired");

    let history = History::open(&dd);
    let mut tracker = StatusTracker::new(dd.status(), &config.app.working_dir, &config.log_path());
    tracker.set_deploy_id(history.id);
    tracker.update(DeployState::Starting);
    tracing::info!(deploy_id = ?history.id, working_dir = %config.app.working_dir.display(), "deploy starting");

    let mut reached_commit = None;
    match run_phases(config, &dd, &mut tracker, &mut reached_commit).await {
        Ok(mut report) => {
            report.deploy_id = history.id;
            tracker.update(DeployState::Succeeded);
            history.succeeded(&report);
            tracing::info!(pid = report.service.pid, head = %report.sync.head, "deploy finished");
            Ok(report)
        }
        Err(e) => {
            tracker.set_error(&e.to_string());
            tracker.update(DeployState::Failed);
            history.failed(&e, reached_commit.as_deref());
            tracing::error!(phase = e.phase().as_str(), error = %e, "deploy failed");
            Err(e)
        }
    }
}

async fn run_phases(
    config: &DeployConfig,
    dd: &DataDir,
    tracker: &mut StatusTracker,
    reached_commit: &mut Option<String>,
) -> Result<DeployReport, DeployError> {
    let pid_file = PidFile::new(dd.pid_file());

    tracker.update(DeployState::Stopping);
    let stop = process::stop_service(config, &pid_file)
        .await
        .map_err(DeployError::Stop)?;

    tracker.update(DeployState::Syncing);
    let target = SyncTarget {
        working_dir: &config.app.working_dir,
        repo_url: &config.app.repo_url,
        remote: &config.app.remote,
        branch: config.branch(),
        timeout: Duration::from_secs(config.timeouts.sync_secs),
    };
    let sync = sync::sync(&target).await.map_err(DeployError::Sync)?;
    tracker.set_commit(&sync.head);
    *reached_commit = Some(sync.head.clone());

    tracker.update(DeployState::InstallingDependencies);
    let deps = deps::install(config)
        .await
        .map_err(DeployError::Dependency)?;

    tracker.update(DeployState::Launching);
    let service = launch::launch(config, &pid_file)
        .await
        .map_err(DeployError::Launch)?;
    tracker.set_service_pid(service.pid);

    Ok(DeployReport {
        deploy_id: None,
        stop,
        sync,
        deps,
        service,
    })
}

/// Stop the managed service without deploying.
pub async fn stop(config: &DeployConfig) -> Result<StopOutcome, DeployError> {
    let dd = data_dir(config)?;
    let _lock =
        DeployLock::for_working_dir(&config.app.working_dir).map_err(DeployError::Lock)?;
    process::stop_service(config, &PidFile::new(dd.pid_file()))
        .await
        .map_err(DeployError::Stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusFile;
    use crate::sync::test_support::{commit_files, run_git, upstream_repo};
    use std::path::Path;

    /// A deploy whose package manager and service are shell stand-ins.
    fn test_config(root: &Path, upstream: &Path) -> DeployConfig {
        let mut cfg = DeployConfig::default();
        cfg.app.working_dir = root.join("app");
        cfg.app.repo_url = upstream.to_string_lossy().into_owned();
        cfg.storage.data_dir = root.join(".redeploy");
        cfg.deps.create = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p {venv}/bin".to_string(),
        ];
        cfg.deps.install = vec![
            "sh".to_string(),
            "-c".to_string(),
            "if grep -q nonexistent {manifest}; then echo 'No matching distribution found' >&2; exit 1; fi".to_string(),
        ];
        cfg.launch.command = "sh".to_string();
        cfg.launch.args = vec![
            "-c".to_string(),
            "echo bot started; exec sleep 30".to_string(),
        ];
        cfg.stop.grace_secs = 5;
        // Parallel tests must never find each other's services by pattern.
        cfg.stop.pattern_fallback = false;
        cfg
    }

    async fn wait_for_log(path: &Path, needle: &str) -> String {
        for _ in 0..50 {
            let contents = std::fs::read_to_string(path).unwrap_or_default();
            if contents.contains(needle) {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        std::fs::read_to_string(path).unwrap_or_default()
    }

    async fn cleanup(pid: u32) {
        process::terminate(pid, Duration::from_secs(5)).await.unwrap();
    }

    fn history(cfg: &DeployConfig) -> Vec<db::DeployRecord> {
        let conn = db::open_or_create(&DataDir::new(&cfg.storage.data_dir).db()).unwrap();
        db::list_deploys(&conn, 10).unwrap()
    }

    #[tokio::test]
    async fn fresh_host_clones_installs_and_launches() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);

        let report = deploy(&cfg).await.unwrap();

        assert_eq!(report.stop, StopOutcome::NothingRunning);
        assert_eq!(report.sync.action, sync::SyncAction::Cloned);
        assert!(report.deps.created_env);
        assert!(process::is_alive(report.service.pid));
        let log = wait_for_log(&cfg.log_path(), "bot started").await;
        assert!(log.contains("bot started"));

        let rows = history(&cfg);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, "succeeded");
        assert_eq!(rows[0].service_pid, Some(report.service.pid));
        assert_eq!(report.deploy_id, Some(rows[0].id));

        let status = StatusFile::new(DataDir::new(&cfg.storage.data_dir).status())
            .read()
            .unwrap();
        assert_eq!(status.state, DeployState::Succeeded);
        assert_eq!(status.commit.as_deref(), Some(report.sync.head.as_str()));

        cleanup(report.service.pid).await;
    }

    #[tokio::test]
    async fn redeploy_without_changes_still_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);

        let first = deploy(&cfg).await.unwrap();
        let second = deploy(&cfg).await.unwrap();

        assert_eq!(second.sync.action, sync::SyncAction::Pulled);
        assert!(!second.sync.changed());
        assert!(!second.deps.created_env);
        assert_eq!(
            second.stop,
            StopOutcome::Stopped {
                pids: vec![first.service.pid]
            }
        );
        assert_ne!(first.service.pid, second.service.pid);
        assert!(!process::is_alive(first.service.pid));
        assert!(process::is_alive(second.service.pid));

        cleanup(second.service.pid).await;
    }

    #[tokio::test]
    async fn stop_with_nothing_running_is_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);

        assert_eq!(stop(&cfg).await.unwrap(), StopOutcome::NothingRunning);
        assert_eq!(stop(&cfg).await.unwrap(), StopOutcome::NothingRunning);
    }

    #[tokio::test]
    async fn stop_command_stops_deployed_service() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);
        let report = deploy(&cfg).await.unwrap();

        let outcome = stop(&cfg).await.unwrap();

        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                pids: vec![report.service.pid]
            }
        );
        assert!(!process::is_alive(report.service.pid));
    }

    #[tokio::test]
    async fn unreachable_remote_fails_sync_and_keeps_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);
        let first = deploy(&cfg).await.unwrap();

        run_git(
            &cfg.app.working_dir,
            &["remote", "set-url", "origin", "/nonexistent/repo.git"],
        );
        let err = deploy(&cfg).await.unwrap_err();

        assert_eq!(err.phase(), Phase::Sync);
        assert!(matches!(err, DeployError::Sync(_)));
        let head = sync::head_commit(&cfg.app.working_dir, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(head, first.sync.head);
        assert!(cfg.app.working_dir.join("main.py").exists());

        let rows = history(&cfg);
        assert_eq!(rows[0].outcome, "failed");
        assert_eq!(rows[0].failed_phase.as_deref(), Some("sync"));
    }

    #[tokio::test]
    async fn unreachable_remote_on_fresh_host_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path(), Path::new("/nonexistent/repo.git"));
        cfg.app.repo_url = "/nonexistent/repo.git".to_string();

        let err = deploy(&cfg).await.unwrap_err();

        assert!(matches!(err, DeployError::Sync(_)));
        assert!(!sync::is_checkout(&cfg.app.working_dir, Duration::from_secs(10)).await);
        assert!(!cfg.app.working_dir.exists());
        assert!(PidFile::new(DataDir::new(&cfg.storage.data_dir).pid_file())
            .read()
            .is_none());
    }

    #[tokio::test]
    async fn failed_install_leaves_service_down() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);
        let first = deploy(&cfg).await.unwrap();

        commit_files(
            &upstream,
            &[("requirements.txt", "aiogram\nnonexistent-package-xyz\n")],
            "bad dependency",
        );
        let err = deploy(&cfg).await.unwrap_err();

        assert_eq!(err.phase(), Phase::Dependencies);
        assert!(err.to_string().contains("No matching distribution found"));
        // The old instance was stopped before the failure and nothing replaced it.
        assert!(!process::is_alive(first.service.pid));
        let dd = DataDir::new(&cfg.storage.data_dir);
        assert!(PidFile::new(dd.pid_file()).read().is_none());
        // No rollback: the tree is already at the new commit.
        let manifest = std::fs::read_to_string(cfg.manifest_path()).unwrap();
        assert!(manifest.contains("nonexistent-package-xyz"));

        let rows = history(&cfg);
        assert_eq!(rows[0].failed_phase.as_deref(), Some("dependencies"));
        assert!(rows[0].commit.is_some());
        let status = StatusFile::new(dd.status()).read().unwrap();
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn concurrent_deploy_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let cfg = test_config(tmp.path(), &upstream);
        let dd = DataDir::new(&cfg.storage.data_dir);
        let _held = DeployLock::for_working_dir(&cfg.app.working_dir).unwrap();

        let err = deploy(&cfg).await.unwrap_err();

        assert_eq!(err.phase(), Phase::Lock);
        assert!(matches!(err, DeployError::Lock(LockError::Held { .. })));
        assert!(!cfg.app.working_dir.exists());
        assert!(PidFile::new(dd.pid_file()).read().is_none());

        let err = stop(&cfg).await.unwrap_err();
        assert_eq!(err.phase(), Phase::Lock);
    }

    #[tokio::test]
    async fn same_working_dir_with_other_data_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let first = test_config(tmp.path(), &upstream);
        let mut second = test_config(tmp.path(), &upstream);
        second.app.working_dir = tmp.path().join(".").join("app");
        second.storage.data_dir = tmp.path().join("elsewhere/.redeploy");
        let _held = DeployLock::for_working_dir(&first.app.working_dir).unwrap();

        let err = deploy(&second).await.unwrap_err();

        assert!(matches!(err, DeployError::Lock(LockError::Held { .. })));
        assert!(!first.app.working_dir.exists());
    }

    #[tokio::test]
    async fn unusable_data_dir_is_setup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let mut cfg = test_config(tmp.path(), &upstream);
        std::fs::write(tmp.path().join("blocker"), "file").unwrap();
        cfg.storage.data_dir = tmp.path().join("blocker/.redeploy");

        let err = deploy(&cfg).await.unwrap_err();

        assert_eq!(err.phase(), Phase::Setup);
        assert!(matches!(err, DeployError::DataDir { .. }));
        assert!(err.to_string().contains("state directory"));
        assert!(!cfg.app.working_dir.exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_launch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = upstream_repo(tmp.path());
        let mut cfg = test_config(tmp.path(), &upstream);
        cfg.launch.command = "{venv}/bin/python".to_string();
        cfg.launch.args = vec!["main.py".to_string()];

        let err = deploy(&cfg).await.unwrap_err();

        assert_eq!(err.phase(), Phase::Launch);
        assert!(matches!(err, DeployError::Launch(LaunchError::Spawn { .. })));
    }
}
