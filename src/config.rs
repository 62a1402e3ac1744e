use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from redeploy.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct DeployConfig {
    pub app: AppConfig,
    pub deps: DepsConfig,
    pub launch: LaunchConfig,
    pub stop: StopConfig,
    pub timeouts: TimeoutConfig,
    pub log: LogConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub working_dir: PathBuf,
    pub repo_url: String,
    pub remote: String,
    /// Empty means "whatever the remote or upstream tracking branch says".
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepsConfig {
    pub venv_dir: PathBuf,
    pub manifest: PathBuf,
    pub create_venv: bool,
    pub create: Vec<String>,
    pub install: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub command: String,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub require_files: Vec<PathBuf>,
    pub settle_secs: u64,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub grace_secs: u64,
    pub pattern_fallback: bool,
    /// Regex over full command lines. Empty derives one from the launch command.
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub sync_secs: u64,
    pub deps_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 0 disables rotation.
    pub rotate_bytes: u64,
    pub keep: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

// --- Default implementations ---

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("app"),
            repo_url: String::new(),
            remote: "origin".to_string(),
            branch: String::new(),
        }
    }
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self {
            venv_dir: PathBuf::from(".venv"),
            manifest: PathBuf::from("requirements.txt"),
            create_venv: true,
            create: vec![
                "python3".to_string(),
                "-m".to_string(),
                "venv".to_string(),
                "{venv}".to_string(),
            ],
            install: vec![
                "{venv}/bin/pip".to_string(),
                "install".to_string(),
                "-r".to_string(),
                "{manifest}".to_string(),
            ],
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: "{venv}/bin/python".to_string(),
            args: vec!["main.py".to_string()],
            log_file: PathBuf::from("bot.log"),
            require_files: Vec::new(),
            settle_secs: 0,
            env: BTreeMap::new(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            pattern_fallback: true,
            pattern: String::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_secs: 300,
            deps_secs: 900,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: 0,
            keep: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".redeploy"),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub working_dir: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl DeployConfig {
    /// Load config from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply CLI overrides. Empty strings are ignored.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.working_dir {
            self.app.working_dir = dir.clone();
        }
        if let Some(url) = overrides.repo_url.as_deref().filter(|s| !s.is_empty()) {
            self.app.repo_url = url.to_string();
        }
        if let Some(branch) = &overrides.branch {
            self.app.branch = branch.clone();
        }
    }

    /// Make `working_dir` absolute against `base`, and a relative `data_dir`
    /// absolute against the working directory's parent, so every invocation
    /// on one checkout shares its state whatever directory it runs from.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.app.working_dir.is_relative() {
            self.app.working_dir = base.join(&self.app.working_dir);
        }
        if self.storage.data_dir.is_relative() {
            let root = self.app.working_dir.parent().unwrap_or(base);
            self.storage.data_dir = root.join(&self.storage.data_dir);
        }
    }

    /// Check invariants that the deploy phases rely on.
    ///
    /// `require_repo` is false for commands that never touch the remote
    /// (`stop`, `status`, `history`).
    pub fn validate(&self, require_repo: bool) -> Result<(), ConfigError> {
        if require_repo && self.app.repo_url.trim().is_empty() {
            return Err(ConfigError::Invalid("app.repo_url must be set".to_string()));
        }
        if self.app.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "app.working_dir must not be empty".to_string(),
            ));
        }
        if self.launch.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "launch.command must not be empty".to_string(),
            ));
        }
        if self.deps.install.is_empty() {
            return Err(ConfigError::Invalid(
                "deps.install must name a command".to_string(),
            ));
        }
        if self.deps.create_venv && self.deps.create.is_empty() {
            return Err(ConfigError::Invalid(
                "deps.create must name a command when deps.create_venv is true".to_string(),
            ));
        }
        if self.timeouts.sync_secs == 0 || self.timeouts.deps_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if !self.stop.pattern.is_empty() {
            regex::Regex::new(&self.stop.pattern)
                .map_err(|e| ConfigError::Invalid(format!("stop.pattern: {e}")))?;
        }
        Ok(())
    }

    /// Absolute path of the isolated environment.
    pub fn venv_path(&self) -> PathBuf {
        self.app.working_dir.join(&self.deps.venv_dir)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.app.working_dir.join(&self.deps.manifest)
    }

    pub fn log_path(&self) -> PathBuf {
        self.app.working_dir.join(&self.launch.log_file)
    }

    pub fn branch(&self) -> Option<&str> {
        Some(self.app.branch.trim()).filter(|b| !b.is_empty())
    }

    /// Human-readable dump for `--dry-run`.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("working_dir:   {}\n", self.app.working_dir.display()));
        out.push_str(&format!("repo_url:      {}\n", self.app.repo_url));
        out.push_str(&format!(
            "branch:        {} @ {}\n",
            self.branch().unwrap_or("(default)"),
            self.app.remote
        ));
        out.push_str(&format!("venv:          {}\n", self.venv_path().display()));
        out.push_str(&format!("manifest:      {}\n", self.manifest_path().display()));
        out.push_str(&format!(
            "launch:        {} {}\n",
            self.launch.command,
            self.launch.args.join(" ")
        ));
        out.push_str(&format!("log_file:      {}\n", self.log_path().display()));
        out.push_str(&format!(
            "timeouts:      sync {}s, deps {}s, stop grace {}s\n",
            self.timeouts.sync_secs, self.timeouts.deps_secs, self.stop.grace_secs
        ));
        out.push_str(&format!(
            "data_dir:      {}\n",
            self.storage.data_dir.display()
        ));
        out
    }
}
