use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};

use crate::cli::{compute_concurrency, CliArgs, Command, Concurrency, ConfigError};
use crate::dashboard::DashboardState;
use crate::data_structures::{
    DebugPolicy, Format, IoBundle, RetryPolicy, RuntimeBundle, USER_AGENT,
};
use crate::fetcher::Fetcher;
use crate::ledger::{Ledger, PgLedger};
use crate::limiter::AdaptiveLimiter;
use crate::pipeline::PipelineOptions;
use crate::stats::RunStats;
use crate::store::BlobStore;
use crate::tuner::{SystemSampler, TunerConfig, DEFAULT_TUNER_INTERVAL};

mod cli;
mod dashboard;
mod data_structures;
mod enumerator;
mod fetcher;
mod ledger;
mod limiter;
mod pipeline;
mod stats;
mod store;
mod tuner;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(&args);

    if let Err(e) = run(args).await {
        if let Some(config) = e.downcast_ref::<ConfigError>() {
            eprintln!(
                "\n===============================\n\
                 CONFIGURATION ERROR\n\
                 {config}\n\
                 ===============================\n"
            );
            std::process::exit(2);
        }
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(args: &CliArgs) {
    let level = if args.debug_http_all {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Some(path) = &args.log_file {
        simple_logging::log_to_file(path, level)
            .unwrap_or_else(|e| panic!("Log file could not be opened: {e}"));
    } else {
        simple_logging::log_to_stderr(level);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    if !args.formats.contains(&Format::Xml) {
        warn!(
            "{} needs the xml format to enumerate targets; nothing to do",
            args.command.name()
        );
        return Ok(());
    }

    let store = BlobStore::new(&args.store);
    store.ensure_dirs().context("creating store layout")?;

    let run_id = make_run_id();
    info!("run_id: {run_id}");

    let dashboard_state = args.open_web.then(|| Arc::new(DashboardState::new()));
    let mut dashboard_server = None;
    if let Some(state) = &dashboard_state {
        state.set_run_info(&run_id, args.command.name());
        state.set_status("PREPARING");
        state.set_timestamp();
        let server = dashboard::start_dashboard(state.clone(), &args.web_host, args.web_port)
            .await
            .map_err(anyhow::Error::new)?;
        info!("dashboard: {}", server.url);
        if let Err(e) = open::that(&server.url) {
            warn!("could not open a browser: {e}");
        }
        dashboard_server = Some(server);
    }

    // Keeps the panel's timestamp moving while targets are enumerated.
    let heartbeat = dashboard_state.clone().map(|state| {
        tokio::spawn(async move {
            loop {
                state.set_timestamp();
                tokio::time::sleep(Duration::from_millis(800)).await;
            }
        })
    });

    let pg_ledger = if args.no_db {
        None
    } else {
        let dsn = args.db_dsn.clone().ok_or_else(|| {
            anyhow::Error::new(ConfigError(
                "--db-dsn or BOE_DB_DSN is required (or pass --no-db)".to_string(),
            ))
        })?;
        let ledger = PgLedger::connect(&dsn).await?;
        ledger.ensure_schema().await?;
        Some(Arc::new(ledger))
    };
    let ledger: Option<Arc<dyn Ledger>> = pg_ledger.clone().map(|pg| pg as Arc<dyn Ledger>);

    let (max_limit, start) = compute_concurrency(&args);
    let limiter = Arc::new(AdaptiveLimiter::new(max_limit, start));
    limiter.initialize().await;
    let stats = Arc::new(RunStats::new(max_limit));
    stats.note_concurrency(start);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .user_agent(USER_AGENT)
        .build()
        .context("building HTTP client")?;
    let retry = RetryPolicy {
        retries: args.retries,
        base_delay: args.base_delay,
        cap_delay: args.cap_delay,
        jitter: args.jitter,
    };
    let debug = DebugPolicy {
        debug_http: args.debug_http || args.debug_http_all,
        debug_http_all: args.debug_http_all,
        no_cache: args.no_cache,
    };
    if debug.debug_http {
        info!(
            "HTTP debug active ({} mode)",
            if debug.debug_http_all { "ALL" } else { "NO-200" }
        );
    }

    let io = IoBundle { client, store };
    let fetcher = Fetcher::new(io.client.clone(), io.store.clone(), retry, debug);
    let runtime = RuntimeBundle {
        run_id,
        limiter: limiter.clone(),
        stats: stats.clone(),
        dashboard: dashboard_state.clone(),
        ledger,
    };

    let tuner_task = (args.concurrency == Concurrency::Auto).then(|| {
        let cfg = TunerConfig {
            start,
            max_limit,
            cpu_high: args.cpu_high,
            cpu_low: args.cpu_low,
            interval: DEFAULT_TUNER_INTERVAL,
        };
        tokio::spawn(tuner::autotune(
            limiter.clone(),
            stats.clone(),
            cfg,
            SystemSampler::new(),
        ))
    });

    let result = run_command(&args, &io, &runtime, &fetcher).await;

    if let Some(task) = tuner_task {
        task.abort();
    }
    if let Some(task) = heartbeat {
        task.abort();
    }
    if let Some(server) = dashboard_server {
        server.stop().await;
    }
    if let Some(pg) = pg_ledger {
        pg.close().await;
    }

    log_final_status(&runtime).await;
    result
}

async fn run_command(
    args: &CliArgs,
    io: &IoBundle,
    runtime: &RuntimeBundle,
    fetcher: &Fetcher,
) -> Result<()> {
    let progress_interval = Duration::from_secs(args.ui_refresh.max(1));
    match &args.command {
        Command::Consolidada {
            part,
            accept,
            from,
            to,
            allowlist_file,
            manifest_name,
        } => {
            let entries =
                enumerator::fetch_catalog_entries(fetcher, from.as_deref(), to.as_deref()).await?;
            let allowlist = match allowlist_file {
                Some(path) => Some(enumerator::load_allowlist(path).await?),
                None => None,
            };
            let targets =
                enumerator::build_consolidated_targets(&entries, *part, allowlist.as_ref(), accept);
            info!(
                "consolidada: {} catalog entries, {} downloadable targets",
                entries.len(),
                targets.len()
            );
            pipeline::run_queue_download(
                io,
                runtime,
                fetcher,
                targets,
                PipelineOptions {
                    cmd: "consolidada".to_string(),
                    manifest_name: manifest_name.clone(),
                    progress_interval,
                },
            )
            .await
        }
        Command::Sumario {
            date,
            manifest_name,
        } => {
            let xml = enumerator::fetch_sumario_xml(fetcher, date).await?;
            let urls = enumerator::extract_sumario_item_urls(&xml);
            let targets = enumerator::build_sumario_targets(&urls, "application/xml");
            info!("sumario {date}: {} item urls", targets.len());
            pipeline::run_queue_download(
                io,
                runtime,
                fetcher,
                targets,
                PipelineOptions {
                    cmd: "sumario".to_string(),
                    manifest_name: manifest_name.clone(),
                    progress_interval,
                },
            )
            .await
        }
    }
}

fn make_run_id() -> String {
    use rand::Rng;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix: u32 = rand::thread_rng().gen_range(1000..=9999);
    format!("{stamp}-{suffix}")
}

async fn log_final_status(runtime: &RuntimeBundle) {
    let totals = runtime.stats.totals().await;
    info!(
        "run {} finished: done={} ok={} skipped_304={} errors={} http_429={} http_5xx={} \
         bytes={} concurrency_cfg={} max_concurrency_reached={}",
        runtime.run_id,
        totals.done,
        totals.ok,
        totals.skipped_304,
        totals.errors,
        totals.http_429,
        totals.http_5xx,
        totals.bytes,
        runtime.stats.max_concurrency_configured(),
        runtime.stats.max_concurrency_reached(),
    );
}
