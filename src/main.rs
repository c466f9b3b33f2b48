use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use autoforge::config::{AutoforgeConfig, DEFAULT_STATE_DIR, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "autoforge")]
#[command(version, about = "Autonomous multi-phase build orchestrator")]
pub struct Cli {
    /// Directory holding autoforge.toml, build records and manifest caches
    #[arg(long, global = true, env = "AUTOFORGE_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a build and drive it; operator slash commands are read from stdin
    Run {
        /// Directory of contract markdown files (must contain phases.md)
        #[arg(long)]
        contracts: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Branch to commit to (existing repos and local paths)
        #[arg(long, default_value = "main")]
        branch: String,

        /// Remote to push to when creating a new repository
        #[arg(long, requires = "new")]
        remote: Option<String>,

        /// Project name (defaults to the target directory or repository name)
        #[arg(long)]
        project: Option<String>,

        /// Open a plan-review gate before the first phase
        #[arg(long)]
        plan_review: bool,

        /// Shell command used to run the project's tests during verification
        #[arg(long)]
        test_command: Option<String>,
    },
    /// Continue a paused or interrupted build
    Resume {
        /// Build id (prefix accepted)
        id: String,

        /// Restart from this phase
        #[arg(long)]
        phase: Option<u32>,

        /// Resolve the pending gate: approve, retry, skip, abort or "answer <text>"
        #[arg(long, conflicts_with = "phase")]
        decision: Option<String>,
    },
    /// List the phases declared in a contracts directory
    Phases {
        #[arg(long)]
        contracts: PathBuf,
    },
    /// Show builds, or one build in detail
    Status {
        /// Build id (prefix accepted)
        id: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run the restart sweep over interrupted builds
    Recover,
    /// View, validate or initialise configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    /// Build inside an existing local directory
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Clone this repository into a fresh workspace
    #[arg(long)]
    pub repo: Option<String>,

    /// Create a new repository with this name under the builds root
    #[arg(long)]
    pub new: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list problems
    Validate,
    /// Write a default autoforge.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AutoforgeConfig::load_or_default(&cli.state_dir)
        .with_context(|| format!("Failed to load configuration from {}", cli.state_dir.display()))?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if cli.verbose {
        config.logging.filter = "autoforge=debug,info".to_string();
    }
    let _log_guard = autoforge::logging::init(&config.logging)?;

    match &cli.command {
        Commands::Run {
            contracts,
            target,
            branch,
            remote,
            project,
            plan_review,
            test_command,
        } => {
            if *plan_review {
                config.orchestrator.plan_review = true;
            }
            if test_command.is_some() {
                config.verification.test_command = test_command.clone();
            }
            let build_target = cmd::run::resolve_target(target, branch, remote.as_deref())?;
            cmd::cmd_run(&cli, config, contracts, build_target, project.as_deref()).await?;
        }
        Commands::Resume { id, phase, decision } => {
            cmd::cmd_resume(&cli, config, id, *phase, decision.as_deref()).await?
        }
        Commands::Phases { contracts } => cmd::cmd_phases(contracts)?,
        Commands::Status { id, json } => cmd::cmd_status(&cli, config, id.as_deref(), *json).await?,
        Commands::Recover => cmd::cmd_recover(&cli, config).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
    }

    Ok(())
}
