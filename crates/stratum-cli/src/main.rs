//! Stratum - plan and run multi-step coding tasks
//!
//! `stratum plan create` decomposes a request into a persisted plan of
//! dependent tasks; `stratum plan execute` runs it with dependency-aware
//! scheduling, caching, and retries. Plans survive restarts and can be
//! resumed or cancelled by id.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use stratum_core::plan::{ExperienceLevel, PlanningContext, QualityBar, SizeClass};
use stratum_core::{paths, StratumConfig, StratumServices};

mod output;

/// Stratum - task planning for coding work
#[derive(Parser)]
#[command(name = "stratum", version)]
#[command(about = "Plan, schedule, and execute multi-step coding tasks", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.stratum/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print raw JSON envelopes
    #[arg(long, global = true)]
    json: bool,

    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, run, and inspect plans
    Plan {
        #[command(subcommand)]
        action: PlanCommand,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Decompose a request into a new plan
    Create {
        /// What needs to be done
        request: String,

        /// Project root the plan's tools operate in
        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, value_enum, default_value_t = SizeArg::Medium)]
        size: SizeArg,

        #[arg(long, value_enum, default_value_t = ExperienceArg::Intermediate)]
        experience: ExperienceArg,

        #[arg(long, value_enum, default_value_t = QualityArg::Standard)]
        quality: QualityArg,

        /// Command the verification task runs, e.g. "cargo test"
        #[arg(long)]
        verify: Option<String>,
    },

    /// Execute a plan
    Execute { plan_id: String },

    /// Show a plan and its tasks
    View { plan_id: String },

    /// Show status and progress
    Status { plan_id: String },

    /// List stored plans
    List {
        /// Only plans that have not completed or failed
        #[arg(long)]
        active: bool,
    },

    /// Continue an interrupted or cancelled plan
    Resume { plan_id: String },

    /// Cancel a plan
    Cancel { plan_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SizeArg {
    Small,
    Medium,
    Large,
}

impl From<SizeArg> for SizeClass {
    fn from(arg: SizeArg) -> Self {
        match arg {
            SizeArg::Small => Self::Small,
            SizeArg::Medium => Self::Medium,
            SizeArg::Large => Self::Large,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExperienceArg {
    Beginner,
    Intermediate,
    Expert,
}

impl From<ExperienceArg> for ExperienceLevel {
    fn from(arg: ExperienceArg) -> Self {
        match arg {
            ExperienceArg::Beginner => Self::Beginner,
            ExperienceArg::Intermediate => Self::Intermediate,
            ExperienceArg::Expert => Self::Expert,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityArg {
    Prototype,
    Standard,
    Production,
}

impl From<QualityArg> for QualityBar {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::Prototype => Self::Prototype,
            QualityArg::Standard => Self::Standard,
            QualityArg::Production => Self::Production,
        }
    }
}

/// Log to ~/.stratum/logs/stratum.log, and to stderr with `--verbose`
fn init_logging(verbose: bool) -> Result<()> {
    let log_dir = paths::logs_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
    let log_file = std::fs::File::create(log_dir.join("stratum.log"))
        .context("Failed to create log file")?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false);
    let stderr_layer = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Logging disabled: {:#}", e);
    }

    let config = match &cli.config {
        Some(path) => StratumConfig::load(path)?,
        None => StratumConfig::load_default()?,
    };
    let (events_tx, events_rx) = config.event_channel();
    let services = StratumServices::from_config(&config, Some(events_tx))
        .await
        .context("Failed to initialize stratum")?;
    let planning = services.planning();
    let progress = tokio::spawn(output::print_progress(events_rx, !cli.json));

    let Commands::Plan { action } = cli.command;
    let ok = match action {
        PlanCommand::Create {
            request,
            root,
            size,
            experience,
            quality,
            verify,
        } => {
            let ctx = PlanningContext {
                project_root: root,
                project_size: size.into(),
                experience: experience.into(),
                quality: quality.into(),
                verify_command: verify,
            };
            output::emit(cli.json, &planning.create(&request, ctx).await, |id| {
                println!("Created plan {}", id);
                println!("Run it with: stratum plan execute {}", id);
            })?
        }
        PlanCommand::Execute { plan_id } => {
            output::emit(cli.json, &planning.execute(&plan_id).await, |status| {
                println!("Plan {} finished: {}", plan_id, status);
            })?
        }
        PlanCommand::View { plan_id } => {
            output::emit(cli.json, &planning.view(&plan_id).await, output::print_plan)?
        }
        PlanCommand::Status { plan_id } => {
            output::emit(cli.json, &planning.status(&plan_id).await, output::print_status)?
        }
        PlanCommand::List { active } => {
            output::emit(cli.json, &planning.list(active).await, |plans| {
                output::print_list(plans)
            })?
        }
        PlanCommand::Resume { plan_id } => {
            output::emit(cli.json, &planning.resume(&plan_id).await, |status| {
                println!("Plan {} finished: {}", plan_id, status);
            })?
        }
        PlanCommand::Cancel { plan_id } => {
            output::emit(cli.json, &planning.cancel(&plan_id).await, |status| {
                println!("Plan {} is now {}", plan_id, status);
            })?
        }
    };

    services.shutdown().await;
    // closing the event channel lets the progress printer drain and exit
    drop(planning);
    drop(services);
    let _ = progress.await;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
