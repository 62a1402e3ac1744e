/// Operator-facing output: deploy banners, `status`, and `history`.
use crate::config::DeployConfig;
use crate::data_dir::DataDir;
use crate::db::{self, DeployRecord};
use crate::process::{self, PidFile, ProcessRecord, StopOutcome};
use crate::runner::{DeployError, DeployReport};
use crate::status::StatusFile;
use crate::sync::SyncAction;

const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const YELLOW: &str = "\x1b[0;33m";
const NC: &str = "\x1b[0m";

fn short_commit(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}

fn describe_stop(outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::NothingRunning => "nothing was running".to_string(),
        StopOutcome::Stopped { pids } => {
            let list: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
            format!("stopped pid {}", list.join(", "))
        }
    }
}

fn describe_sync(report: &DeployReport) -> String {
    let head = short_commit(&report.sync.head);
    match (report.sync.action, report.sync.previous.as_deref()) {
        (SyncAction::Cloned, _) => format!("cloned at {head}"),
        (SyncAction::Pulled, Some(prev)) if report.sync.changed() => {
            format!("updated {} -> {head}", short_commit(prev))
        }
        (SyncAction::Pulled, _) => format!("already up to date at {head}"),
    }
}

pub fn print_deploy_success(report: &DeployReport) {
    println!("{GREEN}[1/4] Stop: {}{NC}", describe_stop(&report.stop));
    println!("{GREEN}[2/4] Sync: {}{NC}", describe_sync(report));
    if report.deps.created_env {
        println!("{GREEN}[3/4] Dependencies installed into a new environment{NC}");
    } else {
        println!("{GREEN}[3/4] Dependencies installed{NC}");
    }
    println!("{GREEN}[4/4] Started pid {}{NC}", report.service.pid);
    println!();
    println!("{GREEN}=== Deploy complete. ==={NC}");
    println!("Logs: {}", report.service.log_file.display());
}

/// What the failure left behind. Setup and lock failures touch nothing.
fn failure_hint(err: &DeployError) -> Option<&'static str> {
    match err {
        DeployError::DataDir { .. } | DeployError::Lock(_) => None,
        DeployError::Stop(_) => Some(
            "The previous instance may still be running. Check it before deploying again.",
        ),
        DeployError::Sync(_) | DeployError::Dependency(_) | DeployError::Launch(_) => {
            Some("The service is not running. Fix the cause and deploy again.")
        }
    }
}

pub fn print_deploy_failure(err: &DeployError) {
    eprintln!();
    eprintln!(
        "{RED}=== DEPLOY FAILED ({}) ==={NC}",
        err.phase().as_str().to_uppercase()
    );
    eprintln!("{RED}{err}{NC}");
    if let Some(hint) = failure_hint(err) {
        eprintln!("{YELLOW}{hint}{NC}");
    }
}

pub fn print_stop(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::NothingRunning => println!("{YELLOW}Nothing was running.{NC}"),
        StopOutcome::Stopped { .. } => println!("{GREEN}{}{NC}", describe_stop(outcome)),
    }
}

fn describe_service(record: Option<&ProcessRecord>) -> String {
    match record {
        Some(r) if process::record_is_current(r) => format!(
            "running (pid {}, started {})",
            r.pid,
            r.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        Some(r) => format!("not running (stale record for pid {})", r.pid),
        None => "not running".to_string(),
    }
}

fn history_line(rec: &DeployRecord) -> String {
    let commit = rec.commit.as_deref().map(short_commit).unwrap_or("-");
    let detail = match (rec.outcome.as_str(), rec.failed_phase.as_deref()) {
        ("failed", Some(phase)) => format!("failed in {phase}"),
        ("succeeded", _) => match rec.service_pid {
            Some(pid) => format!("pid {pid}"),
            None => String::new(),
        },
        (other, _) => other.to_string(),
    };
    format!(
        "{:<6} {:<22} {:<10} {:<8} {:<11} {}",
        rec.id,
        rec.started,
        rec.outcome,
        rec.sync_action.as_deref().unwrap_or("-"),
        commit,
        detail
    )
}

pub fn handle_status(config: &DeployConfig) -> Result<(), String> {
    let dd = DataDir::new(&config.storage.data_dir);
    let record = PidFile::new(dd.pid_file()).read();

    println!("Working dir: {}", config.app.working_dir.display());
    println!("Service:     {}", describe_service(record.as_ref()));
    if let Some(r) = &record {
        println!("Command:     {}", r.command.join(" "));
    }
    println!("Log file:    {}", config.log_path().display());

    if let Some(status) = StatusFile::new(dd.status()).read() {
        let state = serde_json::to_value(status.state)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        println!(
            "Last run:    {state} (updated {})",
            status.last_update.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(error) = &status.error {
            println!("Last error:  {}", error.lines().next().unwrap_or_default());
        }
    }

    if !dd.db().exists() {
        return Ok(());
    }
    let conn = db::open_or_create(&dd.db()).map_err(|e| format!("failed to open history: {e}"))?;
    let read_err = |e: rusqlite::Error| format!("failed to read history: {e}");
    if let Some(latest) = db::latest_deploy(&conn).map_err(read_err)? {
        println!(
            "Last deploy: #{} {} (finished {})",
            latest.id,
            latest.outcome,
            latest.finished.as_deref().unwrap_or("-")
        );
        if let Some(error) = &latest.error {
            println!("  error:     {}", error.lines().next().unwrap_or_default());
        }
    }
    if let Some(good) = db::last_successful(&conn).map_err(read_err)? {
        let commit = good.commit.as_deref().map(short_commit).unwrap_or("-");
        match good.previous_commit.as_deref() {
            Some(prev) if good.previous_commit != good.commit => println!(
                "Last good:   #{} at {commit} (from {}, {})",
                good.id,
                short_commit(prev),
                good.started
            ),
            _ => println!("Last good:   #{} at {commit} ({})", good.id, good.started),
        }
    }
    Ok(())
}

pub fn handle_history(config: &DeployConfig, last: i64) -> Result<(), String> {
    let dd = DataDir::new(&config.storage.data_dir);
    if !dd.db().exists() {
        println!("No deploys recorded.");
        return Ok(());
    }
    let conn = db::open_or_create(&dd.db()).map_err(|e| format!("failed to open history: {e}"))?;
    let rows = db::list_deploys(&conn, last).map_err(|e| format!("failed to read history: {e}"))?;
    if rows.is_empty() {
        println!("No deploys recorded.");
        return Ok(());
    }

    println!(
        "{:<6} {:<22} {:<10} {:<8} {:<11} DETAIL",
        "ID", "STARTED", "OUTCOME", "SYNC", "COMMIT"
    );
    println!("{}", "-".repeat(80));
    for row in &rows {
        println!("{}", history_line(row));
    }
    Ok(())
}
