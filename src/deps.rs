/// Dependency phase: make sure the isolated environment exists, then install
/// the manifest into it.
use crate::command::{CommandError, Placeholders, ToolCommand};
use crate::config::DeployConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum DependencyError {
    EnvironmentMissing { path: PathBuf },
    ManifestMissing { path: PathBuf },
    CreateEnvironment(CommandError),
    Install(CommandError),
}

impl std::fmt::Display for DependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyError::EnvironmentMissing { path } => write!(
                f,
                "environment {} does not exist and deps.create_venv is off",
                path.display()
            ),
            DependencyError::ManifestMissing { path } => {
                write!(f, "dependency manifest {} not found", path.display())
            }
            DependencyError::CreateEnvironment(e) => {
                write!(f, "failed to create environment: {e}")
            }
            DependencyError::Install(e) => write!(f, "dependency install failed: {e}"),
        }
    }
}

impl std::error::Error for DependencyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DependencyError::EnvironmentMissing { .. }
            | DependencyError::ManifestMissing { .. } => None,
            DependencyError::CreateEnvironment(e) | DependencyError::Install(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub created_env: bool,
}

pub fn placeholders(config: &DeployConfig) -> Placeholders {
    Placeholders {
        workdir: config.app.working_dir.clone(),
        venv: config.venv_path(),
        manifest: config.manifest_path(),
    }
}

fn tool(argv: &[String], config: &DeployConfig) -> Option<ToolCommand> {
    let expanded = placeholders(config).expand_all(argv);
    let timeout = Duration::from_secs(config.timeouts.deps_secs);
    ToolCommand::from_argv(&expanded, timeout).map(|c| c.current_dir(&config.app.working_dir))
}

pub async fn install(config: &DeployConfig) -> Result<InstallOutcome, DependencyError> {
    let venv = config.venv_path();
    let mut created_env = false;

    if !venv.exists() {
        if !config.deps.create_venv {
            return Err(DependencyError::EnvironmentMissing { path: venv });
        }
        let create = tool(&config.deps.create, config).ok_or_else(|| {
            DependencyError::EnvironmentMissing { path: venv.clone() }
        })?;
        tracing::info!(path = %venv.display(), command = %create.display(), "creating environment");
        create
            .run()
            .await
            .map_err(DependencyError::CreateEnvironment)?;
        if !venv.exists() {
            return Err(DependencyError::EnvironmentMissing { path: venv });
        }
        created_env = true;
    }

    let manifest = config.manifest_path();
    if !manifest.is_file() {
        return Err(DependencyError::ManifestMissing { path: manifest });
    }

    let Some(install) = tool(&config.deps.install, config) else {
        return Err(DependencyError::ManifestMissing { path: manifest });
    };
    tracing::info!(manifest = %manifest.display(), command = %install.display(), "installing dependencies");
    install.run().await.map_err(DependencyError::Install)?;

    Ok(InstallOutcome { created_env })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Config whose "package manager" is a shell stand-in: the environment
    /// is a directory, and install fails on any line naming `nonexistent`.
    fn fake_config(workdir: &std::path::Path) -> DeployConfig {
        let mut cfg = DeployConfig::default();
        cfg.app.working_dir = workdir.to_path_buf();
        cfg.deps.create = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p {venv}/bin".to_string(),
        ];
        cfg.deps.install = vec![
            "sh".to_string(),
            "-c".to_string(),
            "if grep -q nonexistent {manifest}; then echo 'No matching distribution found' >&2; exit 1; fi; touch {venv}/installed".to_string(),
        ];
        cfg
    }

    #[tokio::test]
    async fn creates_environment_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "aiogram\n").unwrap();
        let cfg = fake_config(dir.path());

        let outcome = install(&cfg).await.unwrap();

        assert!(outcome.created_env);
        assert!(cfg.venv_path().join("installed").exists());
    }

    #[tokio::test]
    async fn existing_environment_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "aiogram\n").unwrap();
        let cfg = fake_config(dir.path());
        std::fs::create_dir_all(cfg.venv_path()).unwrap();

        let outcome = install(&cfg).await.unwrap();
        assert!(!outcome.created_env);
    }

    #[tokio::test]
    async fn missing_environment_without_create_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "aiogram\n").unwrap();
        let mut cfg = fake_config(dir.path());
        cfg.deps.create_venv = false;

        let err = install(&cfg).await.unwrap_err();
        assert!(matches!(err, DependencyError::EnvironmentMissing { .. }));
    }

    #[tokio::test]
    async fn missing_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fake_config(dir.path());

        let err = install(&cfg).await.unwrap_err();
        assert!(matches!(err, DependencyError::ManifestMissing { .. }));
    }

    #[tokio::test]
    async fn unresolvable_package_surfaces_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "aiogram\nnonexistent-package-xyz\n",
        )
        .unwrap();
        let cfg = fake_config(dir.path());

        let err = install(&cfg).await.unwrap_err();
        assert!(matches!(err, DependencyError::Install(_)));
        assert!(err.to_string().contains("No matching distribution found"));
    }

    #[tokio::test]
    async fn install_timeout_is_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "aiogram\n").unwrap();
        let mut cfg = fake_config(dir.path());
        cfg.timeouts.deps_secs = 1;
        cfg.deps.install = vec!["sleep".to_string(), "10".to_string()];

        let err = install(&cfg).await.unwrap_err();
        assert!(matches!(
            err,
            DependencyError::Install(CommandError::TimedOut { .. })
        ));
    }
}
