/// Launch phase: start the service detached from the runner.
///
/// The service gets its own session (`setsid`), so it keeps running after
/// the runner exits and does not receive the terminal's hangup. Its PID is
/// persisted before this function returns; nothing supervises it afterwards.
use crate::command::Placeholders;
use crate::config::DeployConfig;
use crate::deps::placeholders;
use crate::logrotate;
use crate::process::{self, PidFile, ProcessRecord};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

#[derive(Debug)]
pub enum LaunchError {
    MissingFile {
        path: PathBuf,
    },
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Record {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The process died within the settle window.
    ExitedEarly {
        pid: u32,
        code: Option<i32>,
        log_file: PathBuf,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::MissingFile { path } => {
                write!(f, "required file {} is missing", path.display())
            }
            LaunchError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to start `{command}`: {source}")
            }
            LaunchError::Record { path, source } => {
                write!(f, "failed to write pid file {}: {source}", path.display())
            }
            LaunchError::ExitedEarly {
                pid,
                code,
                log_file,
            } => {
                match code {
                    Some(c) => write!(f, "process {pid} exited with status {c} right after start")?,
                    None => write!(f, "process {pid} exited right after start")?,
                }
                write!(f, "; see {}", log_file.display())
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::LogFile { source, .. }
            | LaunchError::Spawn { source, .. }
            | LaunchError::Record { source, .. } => Some(source),
            LaunchError::MissingFile { .. } | LaunchError::ExitedEarly { .. } => None,
        }
    }
}

/// Resolve the program: placeholders expanded, relative paths with a
/// separator anchored at the working directory, bare names left to PATH.
fn resolve_program(command: &str, vars: &Placeholders, workdir: &Path) -> String {
    let expanded = vars.expand(command);
    let path = Path::new(&expanded);
    if path.is_relative() && expanded.contains('/') {
        workdir.join(path).to_string_lossy().into_owned()
    } else {
        expanded
    }
}

/// `PATH` with the environment's `bin/` in front.
fn path_with_venv(venv: &Path) -> String {
    let bin = venv.join("bin");
    match std::env::var_os("PATH") {
        Some(existing) if !existing.is_empty() => {
            format!("{}:{}", bin.display(), existing.to_string_lossy())
        }
        _ => bin.display().to_string(),
    }
}

fn open_log(path: &Path) -> Result<std::fs::File, LaunchError> {
    let log_err = |e| LaunchError::LogFile {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_err)
}

pub async fn launch(
    config: &DeployConfig,
    pid_file: &PidFile,
) -> Result<ProcessRecord, LaunchError> {
    let workdir = &config.app.working_dir;

    for required in &config.launch.require_files {
        let path = workdir.join(required);
        if !path.exists() {
            return Err(LaunchError::MissingFile { path });
        }
    }

    let log_path = config.log_path();
    logrotate::rotate_if_needed(&log_path, config.log.rotate_bytes, config.log.keep);

    let vars = placeholders(config);
    let program = resolve_program(&config.launch.command, &vars, workdir);
    let args = vars.expand_all(&config.launch.args);
    let argv: Vec<String> = std::iter::once(program.clone())
        .chain(args.iter().cloned())
        .collect();
    let command_line = argv.join(" ");

    let mut log = open_log(&log_path)?;
    let started_at = Utc::now();
    writeln!(
        log,
        "--- redeploy: starting `{command_line}` at {} ---",
        started_at.to_rfc3339()
    )
    .map_err(|e| LaunchError::LogFile {
        path: log_path.clone(),
        source: e,
    })?;
    let log_stderr = log.try_clone().map_err(|e| LaunchError::LogFile {
        path: log_path.clone(),
        source: e,
    })?;

    let venv = config.venv_path();
    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_stderr))
        .env("VIRTUAL_ENV", &venv)
        .env("PATH", path_with_venv(&venv))
        .env("PYTHONUNBUFFERED", "1");
    for (key, value) in &config.launch.env {
        cmd.env(key, vars.expand(value));
    }
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
        command: command_line.clone(),
        source: e,
    })?;
    let pid = child.id();
    tracing::info!(pid, command = %command_line, log = %log_path.display(), "service started");

    let record = ProcessRecord {
        pid,
        started_at,
        command: argv,
        log_file: log_path.clone(),
    };
    if let Err(e) = pid_file.write(&record) {
        // An unrecorded service could only be found again by pattern.
        tracing::error!(pid, error = %e, "failed to record service pid, stopping it");
        let _ = process::terminate(pid, Duration::from_secs(config.stop.grace_secs)).await;
        return Err(LaunchError::Record {
            path: pid_file.path().to_path_buf(),
            source: e,
        });
    }

    if config.launch.settle_secs > 0 {
        tokio::time::sleep(Duration::from_secs(config.launch.settle_secs)).await;
        if let Ok(Some(status)) = child.try_wait() {
            pid_file.remove();
            return Err(LaunchError::ExitedEarly {
                pid,
                code: status.code(),
                log_file: log_path,
            });
        }
        tracing::info!(pid, settle_secs = config.launch.settle_secs, "service still running");
    }

    Ok(record)
}
