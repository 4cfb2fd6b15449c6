//! cidgate – gateway health and upload verification CLI.
//!
//! Startup order:
//! 1. Parse CLI flags and environment configuration.
//! 2. Initialise structured tracing (JSON or human-readable, on stderr).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Assemble the gateway service and run the subcommand.
//!
//! Command output is JSON on stdout.

mod config;
mod db;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cidgate_core::types::{EndpointDescriptor, FileRecord, Region, VerifyStatus};
use cidgate_core::{FileStore, GatewayService, HttpGatewayClient, RetryStep, VerifyScheduler};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// How often `--follow` and `resync` look at outstanding verification work.
const FOLLOW_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "cidgate")]
#[command(about = "Probe, rank and verify IPFS/Crust gateways")]
#[command(version)]
struct Cli {
    /// Database URL (overrides CIDGATE_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every endpoint and cache the run
    Sweep,
    /// List endpoints best first, from the cached run when it is current
    Rank {
        /// Re-probe even when a cached run is current
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Race endpoints for a CID and print the first one that serves it
    Best {
        /// Content to look for (default: the probe CID)
        cid: Option<String>,
    },
    /// Ask healthy endpoints to fetch a CID into their caches
    Warm { cid: String },
    /// List chronically unhealthy endpoints, and remove them with --apply
    Cleanup {
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Register a gateway
    Add {
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value_t = Region::Auto)]
        region: Region,
        #[arg(long)]
        priority: Option<u32>,
    },
    /// Remove a gateway from the catalogue
    Remove { url: String },
    /// Show the network preference, or set it (CN, INTL or AUTO)
    Region { value: Option<Region> },
    /// Record an uploaded file and verify it, retrying in the background
    Verify {
        id: String,
        cid: String,
        /// Hex SHA-256 of the content, for strong verification
        #[arg(long)]
        hash: Option<String>,
        /// Stay running until the file is verified or retries run out
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Re-arm persisted verification retries and run them to completion
    Resync,
    /// Stop retrying verification of a file and drop its retry state
    Forget { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(url) = cli.database_url.clone() {
        cfg.database_url = url;
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&cfg);

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(
        SqliteStore::connect(&cfg.database_url)
            .await
            .with_context(|| format!("opening {}", cfg.database_url))?,
    );
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Service ─────────────────────────────────────────────────────────────
    let engine = cfg.engine_config();
    let client = Arc::new(HttpGatewayClient::new(engine.probe.clone())?);
    let service = Arc::new(GatewayService::open(engine, store.clone(), client).await);

    run(cli.command, &service, &store).await?;
    service.shutdown();
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: CIDGATE_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(
    command: Commands,
    service: &Arc<GatewayService>,
    store: &Arc<SqliteStore>,
) -> anyhow::Result<()> {
    match command {
        Commands::Sweep => print_json(&service.sweep().await),
        Commands::Rank { force } => print_json(&service.ranked_endpoints(force).await),
        Commands::Best { cid } => {
            let cid = cid.unwrap_or_else(|| service.config().orchestrator.probe_cid.clone());
            match service.best_endpoint(&cid).await {
                Some(best) => print_json(&best),
                None => anyhow::bail!("no endpoint serves {cid} right now"),
            }
        }
        Commands::Warm { cid } => print_json(&service.warm(&cid).await),
        Commands::Cleanup { apply } => {
            let candidates = if apply {
                service.cleanup().await?
            } else {
                service.cleanup_candidates().await
            };
            let report: Vec<_> = candidates
                .iter()
                .map(|c| {
                    json!({ "url": c.endpoint.url, "reasons": c.reasons, "summary": c.summary() })
                })
                .collect();
            print_json(&json!({ "applied": apply, "endpoints": report }))
        }
        Commands::Add {
            url,
            name,
            region,
            priority,
        } => {
            let descriptor = EndpointDescriptor {
                name,
                url,
                region,
                priority,
                icon: None,
            };
            print_json(&service.add_endpoint(descriptor).await?)
        }
        Commands::Remove { url } => print_json(&service.remove_endpoint(&url).await?),
        Commands::Region { value } => {
            if let Some(region) = value {
                service.set_region(region).await?;
            }
            print_json(&json!({ "region": service.region().await }))
        }
        Commands::Verify {
            id,
            cid,
            hash,
            follow,
        } => {
            let mut record = FileRecord::new(id.clone(), cid);
            record.name = id.clone();
            record.hash = hash;
            store.upsert(record).await?;

            let scheduler = start_scheduler(service, store);
            let step = scheduler.verify_now(&id).await?;
            info!(id = %id, step = ?step, "verification pass finished");
            if follow && matches!(step, RetryStep::Rescheduled(_)) {
                drain(&scheduler, store.as_ref()).await?;
            }
            scheduler.shutdown();
            print_json(&FileStore::get(store.as_ref(), &id).await?)
        }
        Commands::Resync => {
            let scheduler = start_scheduler(service, store);
            let report = scheduler.resync_timers().await?;
            drain(&scheduler, store.as_ref()).await?;
            scheduler.shutdown();
            print_json(&report)
        }
        Commands::Forget { id } => {
            let scheduler = start_scheduler(service, store);
            scheduler.forget(&id).await?;
            scheduler.shutdown();
            info!(id = %id, "verification retries dropped");
            print_json(&json!({ "id": id, "forgotten": true }))
        }
    }
}

fn start_scheduler(service: &Arc<GatewayService>, store: &Arc<SqliteStore>) -> VerifyScheduler {
    VerifyScheduler::start(
        service.config().retry.clone(),
        store.clone(),
        store.clone(),
        service.clone(),
    )
}

/// Wait until no timer is armed and no file is mid-verification, or until
/// Ctrl-C. Interrupted retries stay persisted for the next `resync`.
async fn drain(scheduler: &VerifyScheduler, files: &dyn FileStore) -> anyhow::Result<()> {
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            res = &mut interrupted => {
                if let Err(e) = res {
                    warn!(error = %e, "failed to install CTRL+C signal handler");
                }
                info!("interrupted; pending retries stay scheduled for the next resync");
                return Ok(());
            }
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }

        let armed = scheduler.armed_timers().await?;
        let verifying = files
            .list()
            .await?
            .iter()
            .any(|f| f.verify_status == VerifyStatus::Verifying);
        if armed.is_empty() && !verifying {
            return Ok(());
        }
    }
}
