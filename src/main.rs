mod command;
mod config;
mod data_dir;
mod db;
mod deps;
mod launch;
mod lock;
mod logrotate;
mod process;
mod report;
mod runner;
mod status;
mod sync;

use clap::{Parser, Subcommand};
use config::{DeployConfig, Overrides};
use std::path::{Path, PathBuf};

const EXIT_FAILED: i32 = 1;
const EXIT_CONFIG: i32 = 2;

/// One-shot deploy for a single long-running service: stop the old
/// process, sync the source tree, install dependencies, start it again.
#[derive(Parser, Debug)]
#[command(name = "redeploy", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "redeploy.toml", global = true)]
    config: PathBuf,

    /// Working directory of the checkout (overrides config)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Repository URL (overrides config)
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Branch to deploy (overrides config)
    #[arg(long, global = true)]
    branch: Option<String>,

    /// Validate config and print resolved settings, don't deploy
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (tool invocations, signal decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stop, sync, install and relaunch (the default)
    Deploy,
    /// Stop the service without deploying
    Stop,
    /// Show whether the service is running and how the last deploy went
    Status,
    /// List recent deploys
    History {
        /// Number of entries to show
        #[arg(long, default_value_t = 10)]
        last: i64,
    },
    /// Write a starter config file and create the state directory
    Init,
}

fn default_filter(cli: &Cli) -> &'static str {
    if cli.verbose {
        "redeploy=debug"
    } else if cli.quiet {
        "redeploy=warn"
    } else {
        "redeploy=info"
    }
}

fn load_config(cli: &Cli, require_repo: bool) -> Result<DeployConfig, config::ConfigError> {
    let mut config = DeployConfig::load(&cli.config)?;
    config.apply_overrides(&Overrides {
        working_dir: cli.workdir.clone(),
        repo_url: cli.repo.clone(),
        branch: cli.branch.clone(),
    });
    let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    config.resolve_paths(&base);
    config.validate(require_repo)?;
    Ok(config)
}

fn handle_init(path: &Path, config: &DeployConfig) -> Result<(), String> {
    match data_dir::write_default_config(path) {
        Ok(true) => println!("Wrote {}", path.display()),
        Ok(false) => println!("{} already exists, left unchanged", path.display()),
        Err(e) => return Err(format!("failed to write {}: {e}", path.display())),
    }
    let dd = data_dir::DataDir::new(&config.storage.data_dir);
    match dd.init() {
        Ok(true) => println!("Created {}", dd.root().display()),
        Ok(false) => {}
        Err(e) => return Err(format!("failed to create {}: {e}", dd.root().display())),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(&cli))),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let command = cli.command.as_ref().unwrap_or(&Commands::Deploy);
    let require_repo = matches!(command, Commands::Deploy);

    let config = match load_config(&cli, require_repo) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        print!("{}", config.summary());
        println!("Dry run: config is valid, nothing was changed.");
        return;
    }

    let code = match command {
        Commands::Deploy => match runner::deploy(&config).await {
            Ok(report) => {
                report::print_deploy_success(&report);
                0
            }
            Err(e) => {
                report::print_deploy_failure(&e);
                EXIT_FAILED
            }
        },
        Commands::Stop => match runner::stop(&config).await {
            Ok(outcome) => {
                report::print_stop(&outcome);
                0
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_FAILED
            }
        },
        Commands::Status => exit_code(report::handle_status(&config)),
        Commands::History { last } => exit_code(report::handle_history(&config, *last)),
        Commands::Init => exit_code(handle_init(&cli.config, &config)),
    };

    if code != 0 {
        std::process::exit(code);
    }
}

fn exit_code(result: Result<(), String>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_FAILED
        }
    }
}
