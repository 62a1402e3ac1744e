/// Managed-process identity and the stop phase.
///
/// The launched service is recorded in a PID file the moment it is spawned,
/// so stopping it is an exact lookup. Pattern matching over the process
/// table is only a fallback for hosts that have no record yet (for example
/// the first run after switching from a hand-written deploy script).
use crate::config::DeployConfig;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getsid, Pid};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Contents of `service.pid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub command: Vec<String>,
    pub log_file: PathBuf,
}

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. Missing is None; a corrupt file is logged and treated as missing.
    pub fn read(&self) -> Option<ProcessRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to read pid file");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "ignoring malformed pid file");
                None
            }
        }
    }

    /// Atomically replace the record.
    pub fn write(&self, record: &ProcessRecord) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".service.pid.tmp.{}", std::process::id()));
        std::fs::write(&tmp_path, json.as_bytes())?;
        std::fs::rename(&tmp_path, &self.path)
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Result of the stop phase. Nothing running is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingRunning,
    Stopped { pids: Vec<u32> },
}

#[derive(Debug)]
pub enum StopError {
    Signal { pid: u32, source: Errno },
    StillRunning { pid: u32 },
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopError::Signal { pid, source } => {
                write!(f, "failed to signal process {pid}: {source}")
            }
            StopError::StillRunning { pid } => {
                write!(f, "process {pid} is still running after SIGKILL")
            }
        }
    }
}

impl std::error::Error for StopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StopError::Signal { source, .. } => Some(source),
            StopError::StillRunning { .. } => None,
        }
    }
}

/// PIDs 0 and 1 (and anything that does not fit) are never signalled.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 1).map(Pid::from_raw)
}

/// True if `pid` names a live process.
///
/// Our own exited children are reaped here, so a service launched by this
/// process does not linger as a zombie that `kill(pid, 0)` would report.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => return true,
        Ok(_) => return false,
        // ECHILD: not our child, ask the kernel directly.
        Err(_) => {}
    }
    matches!(kill(target, None), Ok(()) | Err(Errno::EPERM))
}

/// True if the record still refers to the process we launched.
///
/// Services are started as session leaders, so a reused PID that is not a
/// session leader is a stale record.
pub fn record_is_current(record: &ProcessRecord) -> bool {
    let Some(target) = to_pid(record.pid) else {
        return false;
    };
    if !is_alive(record.pid) {
        return false;
    }
    match getsid(Some(target)) {
        Ok(sid) => sid == target,
        Err(_) => false,
    }
}

/// Full command line of `pid`, NUL separators turned into spaces. Linux only.
fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let text: String = String::from_utf8_lossy(&raw)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some(text).filter(|t| !t.is_empty())
}

/// Processes whose command line matches `pattern`, excluding this process.
pub fn find_matching(pattern: &Regex) -> Vec<(u32, String)> {
    let entries = match std::fs::read_dir("/proc") {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, "process table not readable, skipping pattern search");
            return Vec::new();
        }
    };
    let me = std::process::id();
    let mut found: Vec<(u32, String)> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != me)
        .filter_map(|pid| cmdline(pid).map(|line| (pid, line)))
        .filter(|(_, line)| pattern.is_match(line))
        .collect();
    found.sort_by_key(|(pid, _)| *pid);
    found
}

/// Regex used for the pattern fallback: configured, or `<program name> <args>`.
pub fn stop_pattern(config: &DeployConfig) -> Option<Regex> {
    if !config.stop.pattern.is_empty() {
        return Regex::new(&config.stop.pattern).ok();
    }
    let program = Path::new(&config.launch.command)
        .file_name()?
        .to_string_lossy()
        .into_owned();
    let signature = std::iter::once(program)
        .chain(config.launch.args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    Regex::new(&regex::escape(&signature)).ok()
}

/// True if `pid` belongs to the session led by `leader`.
fn in_session(pid: u32, leader: u32) -> bool {
    match (to_pid(pid), to_pid(leader)) {
        (Some(p), Some(l)) => getsid(Some(p)).map(|s| s == l).unwrap_or(false),
        _ => false,
    }
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone.
/// A process that is already gone is not an error.
fn signal(pid: u32, sig: Signal) -> Result<(), StopError> {
    let Some(target) = to_pid(pid) else {
        return Ok(());
    };
    match killpg(target, sig).or_else(|_| kill(target, sig)) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(StopError::Signal { pid, source: e }),
    }
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate(pid: u32, grace: Duration) -> Result<(), StopError> {
    if !is_alive(pid) {
        return Ok(());
    }
    tracing::info!(pid, grace_secs = grace.as_secs(), "sending SIGTERM");
    signal(pid, Signal::SIGTERM)?;
    if wait_for_exit(pid, grace).await {
        tracing::info!(pid, "process exited");
        return Ok(());
    }

    tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    signal(pid, Signal::SIGKILL)?;
    if wait_for_exit(pid, KILL_WAIT).await {
        Ok(())
    } else {
        Err(StopError::StillRunning { pid })
    }
}

/// Stop the managed service, whichever way it can be found.
pub async fn stop_service(
    config: &DeployConfig,
    pid_file: &PidFile,
) -> Result<StopOutcome, StopError> {
    let grace = Duration::from_secs(config.stop.grace_secs);
    let mut stopped = Vec::new();

    match pid_file.read() {
        Some(record) if record_is_current(&record) => {
            tracing::info!(pid = record.pid, "stopping recorded service");
            terminate(record.pid, grace).await?;
            stopped.push(record.pid);
        }
        Some(record) => {
            tracing::info!(pid = record.pid, "recorded service is no longer running");
        }
        None => tracing::debug!(path = %pid_file.path().display(), "no pid record"),
    }

    // Also sweeps stray duplicates started by hand next to the recorded one.
    if config.stop.pattern_fallback {
        if let Some(pattern) = stop_pattern(config) {
            for (pid, line) in find_matching(&pattern) {
                if stopped.iter().any(|s| *s == pid || in_session(pid, *s)) {
                    continue;
                }
                tracing::info!(pid, cmdline = %line, "stopping process matched by pattern");
                terminate(pid, grace).await?;
                stopped.push(pid);
            }
        }
    }

    pid_file.remove();

    if stopped.is_empty() {
        tracing::info!("no running instance found");
        Ok(StopOutcome::NothingRunning)
    } else {
        Ok(StopOutcome::Stopped { pids: stopped })
    }
}
