use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use clap::Args;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use mapsched::config::Isolation;
use mapsched::dbck::{self, DbckHandler, DryRunHandler, RepairHandler};
use mapsched::error::{ConfigError, MapschedError, StoreError};
use mapsched::executor::ExecutionPolicy;
use mapsched::jobs::{BoundingBox, NewJob, RenderArea, RenderParams};
use mapsched::render::{CancelFlag, GeocodeError};
use mapsched::worker::EXIT_NOT_FOUND;
use mapsched::{
    Daemon, Dispatcher, GarbageCollector, JobStore, ProcessLauncher, SupervisedExecutor,
    ThreadLauncher,
};

use crate::app::App;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] MapschedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Geocoder setup failed: {0}")]
    Geocoder(#[from] GeocodeError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Cannot locate own executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to install interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl From<tracing::subscriber::SetGlobalDefaultError> for CliError {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        CliError::Logging(err.to_string())
    }
}

impl From<log::SetLoggerError> for CliError {
    fn from(err: log::SetLoggerError) -> Self {
        CliError::Logging(err.to_string())
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

fn cancel_on_interrupt(token: CancellationToken) -> Result<(), CliError> {
    ctrlc::set_handler(move || {
        info!("Interrupt received, stopping");
        token.cancel();
    })?;
    Ok(())
}

pub fn daemon(
    app: &App,
    threaded: bool,
    workers: Option<usize>,
    with_gc: bool,
) -> Result<i32, CliError> {
    let settings = &app.config.daemon;
    let workers = workers.unwrap_or(settings.worker_count);
    if workers == 0 {
        error!("--workers must be at least 1");
        return Ok(mapsched::worker::EXIT_USAGE);
    }
    let isolation = if threaded {
        Isolation::Thread
    } else {
        settings.isolation
    };

    let store = app.open_store()?;
    let storage = store.storage().clone();
    let span = info_span!("daemon", pid = std::process::id());

    // Held here so the worker's blocking HTTP client is dropped outside the runtime.
    let mut thread_worker = None;
    let policy: Arc<dyn ExecutionPolicy> = match isolation {
        Isolation::Process => {
            let exe = std::env::current_exe().map_err(CliError::CurrentExe)?;
            Arc::new(SupervisedExecutor::new(
                ProcessLauncher::new(exe, app.child_args()),
                storage,
                settings.job_timeout(),
                span.clone(),
            ))
        }
        Isolation::Thread => {
            warn!("Thread isolation selected: timed out renderings cannot be killed");
            let worker = Arc::new(app.worker(storage.clone(), span.clone())?);
            thread_worker = Some(worker.clone());
            Arc::new(SupervisedExecutor::new(
                ThreadLauncher::new(worker),
                storage,
                settings.job_timeout(),
                span.clone(),
            ))
        }
    };

    let daemon = Daemon::new(
        store.clone(),
        Dispatcher::new(policy, workers),
        settings.poll_interval(),
        span,
    );
    let collector = with_gc.then(|| {
        Arc::new(GarbageCollector::from_config(
            store.clone(),
            &app.config,
            info_span!("gc"),
        ))
    });

    let shutdown = CancellationToken::new();
    cancel_on_interrupt(shutdown.clone())?;

    let rt = runtime()?;
    let result = rt.block_on(async {
        let gc_task = collector.map(|gc| tokio::spawn(gc.run(shutdown.clone())));
        let result = daemon.run(shutdown.clone()).await;
        shutdown.cancel();
        if let Some(task) = gc_task {
            if let Err(e) = task.await {
                error!(error = %e, "Garbage collector task failed");
            }
        }
        result
    });
    drop(rt);
    drop(thread_worker);

    let report = result?;
    info!(
        recovered = report.recovered,
        jobs_run = report.jobs_run,
        "Daemon exited"
    );
    Ok(0)
}

pub fn render(app: &App, job_id: i64, timeout: Option<u64>) -> Result<i32, CliError> {
    let store = app.open_store()?;
    let Some(mut job) = store.get(job_id)? else {
        error!(job_id, "Job not found");
        return Ok(EXIT_NOT_FOUND);
    };
    // Never persisted; only gives the output files their prefix.
    if job.started_at.is_none() {
        job.started_at = Some(Utc::now().trunc_subsecs(0));
    }
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| app.config.daemon.job_timeout());

    let span = info_span!("render", job_id);
    let storage = store.storage().clone();
    let interrupt = CancelFlag::new();
    let worker = Arc::new(app.worker(storage.clone(), span.clone())?);
    let executor = SupervisedExecutor::new(
        ThreadLauncher::new(worker).with_interrupt(interrupt.clone()),
        storage,
        timeout,
        span,
    );

    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.cancel())?;

    let rt = runtime()?;
    let result = rt.block_on(executor.run(&job));
    drop(rt);

    if result.is_success() {
        if let Some(prefix) = job.files_prefix() {
            println!("{}", prefix);
        }
    } else {
        error!(job_id, result = %result, "Rendering did not succeed");
    }
    Ok(result.exit_code())
}

pub fn work(app: &App, job_id: i64, scratch_prefix: &Path) -> Result<i32, CliError> {
    let store = app.open_store()?;
    let Some(job) = store.get(job_id)? else {
        error!(job_id, "Job not found");
        return Ok(EXIT_NOT_FOUND);
    };

    let span = info_span!("work", job_id, pid = std::process::id());
    let worker = app.worker(store.storage().clone(), span)?;

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    ctrlc::set_handler(move || flag.cancel())?;

    Ok(worker.run(&job, scratch_prefix, &cancel).exit_code())
}

pub fn gc(app: &App, once: bool) -> Result<i32, CliError> {
    let store = app.open_store()?;
    let collector = GarbageCollector::from_config(store, &app.config, info_span!("gc"));

    if once {
        let report = collector.collect()?;
        println!(
            "scanned {} file(s), evicted {} job(s) and {} orphan(s), {} byte(s) saved, now {}/{} bytes",
            report.scanned_files,
            report.jobs_evicted,
            report.orphans_removed,
            report.bytes_saved,
            report.size_after,
            report.threshold
        );
        return Ok(if report.exhausted { 1 } else { 0 });
    }

    let shutdown = CancellationToken::new();
    cancel_on_interrupt(shutdown.clone())?;
    runtime()?.block_on(Arc::new(collector).run(shutdown));
    Ok(0)
}

pub fn dbck(app: &App, dry_run: bool) -> Result<i32, CliError> {
    let store = app.open_store()?;
    let handler: &dyn DbckHandler = if dry_run {
        &DryRunHandler
    } else {
        &RepairHandler
    };

    let report = dbck::run(&store, handler)?;
    for findings in &report.findings {
        println!(" + job #{} ({}):", findings.id, findings.title);
        for message in &findings.messages {
            println!("   - {}", message);
        }
    }
    println!(
        "{} complete: {} job(s) checked, {} with findings.",
        if dry_run { "Check" } else { "Repair" },
        report.jobs_checked,
        report.findings.len()
    );
    Ok(0)
}

#[derive(Args)]
pub struct SubmitArgs {
    #[arg(long)]
    title: String,

    /// lat_upper_left,lon_upper_left,lat_bottom_right,lon_bottom_right
    #[arg(long, value_parser = parse_bbox, required_unless_present = "osm_id", conflicts_with = "osm_id")]
    bbox: Option<BoundingBox>,

    /// OSM relation id of an administrative boundary
    #[arg(long, requires = "city")]
    osm_id: Option<i64>,

    #[arg(long, requires = "osm_id")]
    city: Option<String>,

    #[arg(long, default_value = "default")]
    stylesheet: String,

    #[arg(long, default_value = "plain")]
    layout: String,

    /// Paper size in millimetres, WIDTHxHEIGHT
    #[arg(long, value_parser = parse_paper, default_value = "210x297")]
    paper: (u32, u32),

    #[arg(long, default_value = dbck::DEFAULT_LOCALE)]
    locale: String,
}

fn parse_bbox(value: &str) -> Result<BoundingBox, String> {
    let coords = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate: {}", e))?;
    let &[lat_upper_left, lon_upper_left, lat_bottom_right, lon_bottom_right] = &coords[..] else {
        return Err(format!("expected 4 coordinates, got {}", coords.len()));
    };
    Ok(BoundingBox {
        lat_upper_left,
        lon_upper_left,
        lat_bottom_right,
        lon_bottom_right,
    })
}

fn parse_paper(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let parse = |s: &str| s.trim().parse::<u32>().map_err(|e| e.to_string());
    Ok((parse(width)?, parse(height)?))
}

pub fn submit(app: &App, args: SubmitArgs) -> Result<i32, CliError> {
    let area = match (args.bbox, args.osm_id) {
        (Some(bbox), _) => RenderArea::BoundingBox(bbox),
        (None, Some(osm_id)) => RenderArea::Administrative {
            city: args.city.unwrap_or_default(),
            osm_id,
        },
        (None, None) => return Ok(mapsched::worker::EXIT_USAGE),
    };

    let store = app.open_store()?;
    let job = store.submit(NewJob {
        params: RenderParams {
            title: args.title,
            area,
            stylesheet: args.stylesheet,
            layout: args.layout,
            paper_width_mm: args.paper.0,
            paper_height_mm: args.paper.1,
            locale: args.locale,
        },
    })?;

    let position = store.queue_position(&job)?;
    println!(
        "Job #{} queued at position {}, expected start around {}",
        job.id,
        position,
        job.estimated_start_time(position, Utc::now()).format("%Y-%m-%d %H:%M UTC")
    );
    Ok(0)
}

pub fn cancel(app: &App, job_id: i64) -> Result<i32, CliError> {
    let store = app.open_store()?;
    let Some(mut job) = store.get(job_id)? else {
        error!(job_id, "Job not found");
        return Ok(EXIT_NOT_FOUND);
    };
    if store.mark_cancelled(&mut job)? {
        println!("Job #{} cancelled", job.id);
        Ok(0)
    } else {
        error!(job_id, status = %job.status, "Only waiting jobs can be cancelled");
        Ok(1)
    }
}
