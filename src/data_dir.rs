use std::path::{Path, PathBuf};

/// Manages the `.redeploy/` directory layout.
///
/// Runner state lives outside the checkout so a fresh clone never collides
/// with it. This struct provides accessors for each well-known path and
/// handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the deploy history database.
    pub fn db(&self) -> PathBuf {
        self.root.join("history.db")
    }

    /// Path to the in-flight status file.
    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Path to the managed service's PID record.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("service.pid")
    }

    /// Create the data directory. Returns Ok(true) if it did not exist.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}

/// Default content written by `redeploy init`.
pub const DEFAULT_CONFIG: &str = "\
# redeploy configuration
# Every key is optional except app.repo_url.

[app]
working_dir = \"app\"
repo_url = \"\"
remote = \"origin\"
# branch = \"main\"

[deps]
venv_dir = \".venv\"
manifest = \"requirements.txt\"
create_venv = true
create = [\"python3\", \"-m\", \"venv\", \"{venv}\"]
install = [\"{venv}/bin/pip\", \"install\", \"-r\", \"{manifest}\"]

[launch]
command = \"{venv}/bin/python\"
args = [\"main.py\"]
log_file = \"bot.log\"
# require_files = [\".env\"]
settle_secs = 0

[stop]
grace_secs = 10
pattern_fallback = true

[timeouts]
sync_secs = 300
deps_secs = 900

[log]
rotate_bytes = 0
keep = 5

[storage]
data_dir = \".redeploy\"
";

/// Write `DEFAULT_CONFIG` to `path` unless a file is already there.
/// Returns Ok(true) if the file was written.
pub fn write_default_config(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    Ok(true)
}
