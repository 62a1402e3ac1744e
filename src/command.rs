/// External tool invocation shared by the sync and dependency phases:
/// placeholder expansion, bounded runtime, captured output.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How much of a failing tool's output is kept for the operator.
const OUTPUT_TAIL_LINES: usize = 20;

/// Values substituted for `{workdir}`, `{venv}` and `{manifest}`.
#[derive(Debug, Clone)]
pub struct Placeholders {
    pub workdir: PathBuf,
    pub venv: PathBuf,
    pub manifest: PathBuf,
}

impl Placeholders {
    pub fn expand(&self, arg: &str) -> String {
        arg.replace("{workdir}", &self.workdir.to_string_lossy())
            .replace("{venv}", &self.venv.to_string_lossy())
            .replace("{manifest}", &self.manifest.to_string_lossy())
    }

    pub fn expand_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.expand(a)).collect()
    }
}

/// A fully resolved invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    /// Build from an argv vector such as `deps.install`. Returns None when empty.
    pub fn from_argv(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone(), timeout).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// `program arg1 arg2`, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion. A non-zero exit is an error carrying the output tail.
    pub async fn run(&self) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        tracing::debug!(command = %self.display(), "running tool");
        let child = cmd.spawn().map_err(|e| CommandError::Spawn {
            command: self.display(),
            source: e,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| CommandError::Io {
                command: self.display(),
                source: e,
            })?,
            Err(_) => {
                return Err(CommandError::TimedOut {
                    command: self.display(),
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: self.display(),
                code: output.status.code(),
                output: tail(&stderr, &stdout),
            });
        }

        if !stderr.trim().is_empty() {
            tracing::debug!(command = %self.display(), stderr = %stderr.trim_end(), "tool stderr");
        }
        Ok(CommandOutput { stdout })
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
}

#[derive(Debug)]
pub enum CommandError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Io {
        command: String,
        source: std::io::Error,
    },
    TimedOut {
        command: String,
        timeout: Duration,
    },
    /// Exit code is None when the tool was killed by a signal.
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn { command, source } => {
                write!(f, "failed to start `{command}`: {source}")
            }
            CommandError::Io { command, source } => {
                write!(f, "I/O error while running `{command}`: {source}")
            }
            CommandError::TimedOut { command, timeout } => {
                write!(f, "`{command}` timed out after {}s", timeout.as_secs_f32())
            }
            CommandError::Failed {
                command,
                code,
                output,
            } => {
                match code {
                    Some(c) => write!(f, "`{command}` exited with status {c}")?,
                    None => write!(f, "`{command}` was killed by a signal")?,
                }
                if !output.is_empty() {
                    write!(f, "\n{output}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            CommandError::Io { source, .. } => Some(source),
            CommandError::TimedOut { .. } | CommandError::Failed { .. } => None,
        }
    }
}

/// Last lines of stderr, or of stdout when stderr is empty.
fn tail(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh", Duration::from_secs(10))
            .arg("-c")
            .arg(script)
    }

    #[test]
    fn placeholders_expand_every_occurrence() {
        let p = Placeholders {
            workdir: PathBuf::from("/srv/bot"),
            venv: PathBuf::from("/srv/bot/.venv"),
            manifest: PathBuf::from("/srv/bot/requirements.txt"),
        };
        let args = p.expand_all(&[
            "{venv}/bin/pip".to_string(),
            "-r".to_string(),
            "{manifest}".to_string(),
            "--target={workdir}/{venv}".to_string(),
        ]);
        assert_eq!(
            args,
            vec![
                "/srv/bot/.venv/bin/pip",
                "-r",
                "/srv/bot/requirements.txt",
                "--target=/srv/bot//srv/bot/.venv",
            ]
        );
    }

    #[test]
    fn from_argv_splits_program() {
        let cmd = ToolCommand::from_argv(
            &["pip".to_string(), "install".to_string()],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(cmd.program, "pip");
        assert_eq!(cmd.args, vec!["install"]);
        assert_eq!(cmd.display(), "pip install");
        assert!(ToolCommand::from_argv(&[], Duration::from_secs(1)).is_none());
    }

    #[test]
    fn tail_prefers_stderr_and_truncates() {
        let long: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let t = tail(&long, "ignored");
        assert!(t.starts_with("line 30"));
        assert!(t.ends_with("line 49"));
        assert_eq!(tail("  \n", "from stdout\n"), "from stdout");
    }

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = sh("echo hello").run().await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_respects_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = sh("pwd; echo $REDEPLOY_TEST")
            .current_dir(dir.path())
            .env("REDEPLOY_TEST", "yes")
            .run()
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.contains(canonical.to_str().unwrap()));
        assert!(out.stdout.contains("yes"));
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stderr() {
        let err = sh("echo boom >&2; exit 3").run().await.unwrap_err();
        match &err {
            CommandError::Failed { code, output, .. } => {
                assert_eq!(*code, Some(3));
                assert_eq!(output, "boom");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(err.to_string().contains("exited with status 3"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = ToolCommand::new("nonexistent-binary-xyz", Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut cmd = sh("sleep 5");
        cmd.timeout = Duration::from_millis(200);
        let start = std::time::Instant::now();
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
