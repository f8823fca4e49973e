mod app;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use mapsched::worker::EXIT_USAGE;
use mapsched::ResultCode;

#[derive(Parser)]
#[command(name = "mapsched", version, about = "Map rendering queue daemon and tools")]
struct Cli {
    /// Config file, defaults to ~/.mapsched/config.json
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendering daemon
    Daemon {
        /// Run jobs on threads instead of separate processes (degraded mode)
        #[arg(long)]
        threaded: bool,

        /// Number of jobs rendered at once
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Do not run the storage collector alongside the daemon
        #[arg(long)]
        no_gc: bool,
    },

    /// Render one job now, without touching its status
    Render {
        #[arg(value_name = "JOB_ID")]
        job_id: i64,

        /// Hard limit in seconds, defaults to the daemon's job timeout
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Worker entry point used by the daemon's process isolation
    #[command(hide = true)]
    Work {
        #[arg(value_name = "JOB_ID")]
        job_id: i64,

        #[arg(long, value_name = "PREFIX")]
        scratch_prefix: PathBuf,
    },

    /// Run the storage garbage collector
    Gc {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Check the job database for inconsistencies and repair them
    Dbck {
        /// Only report, change nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Queue a new rendering job
    Submit(commands::SubmitArgs),

    /// Cancel a job that is still waiting
    Cancel {
        #[arg(value_name = "JOB_ID")]
        job_id: i64,
    },
}

impl Commands {
    /// Exit code when the command fails before producing its own. The
    /// daemon reads a `work` child's status as a [`ResultCode`], where 1
    /// means interrupted, so setup failures there count as failed renders.
    fn failure_code(&self) -> i32 {
        match self {
            Commands::Work { .. } => ResultCode::RenderingFailed.exit_code(),
            _ => 1,
        }
    }
}

fn init_logging(verbose: u8, json: bool) -> Result<(), commands::CliError> {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    let subscriber = tracing_subscriber::registry().with(layer.with_filter(filter));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                exit(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let failure = cli.command.failure_code();

    if let Err(e) = init_logging(cli.verbose, cli.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
        return exit(failure);
    }

    let ctx = match app::App::load(cli.config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return exit(failure);
        }
    };

    let result = match cli.command {
        Commands::Daemon {
            threaded,
            workers,
            no_gc,
        } => commands::daemon(&ctx, threaded, workers, !no_gc),
        Commands::Render { job_id, timeout } => commands::render(&ctx, job_id, timeout),
        Commands::Work {
            job_id,
            scratch_prefix,
        } => commands::work(&ctx, job_id, &scratch_prefix),
        Commands::Gc { once } => commands::gc(&ctx, once),
        Commands::Dbck { dry_run } => commands::dbck(&ctx, dry_run),
        Commands::Submit(args) => commands::submit(&ctx, args),
        Commands::Cancel { job_id } => commands::cancel(&ctx, job_id),
    };

    match result {
        Ok(code) => exit(code),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            exit(failure)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
