//! provd entry point.
//!
//! Flagless: starts the workflow runner, resumes any unfinished runs, kicks
//! off one new provisioning run with a fresh UUID, waits for it, and shuts
//! down within a 10-second grace. Configuration is environment-only:
//! `PROVD_IMAGE` and `PROVD_BUCKET` override the defaults, `RUST_LOG` the
//! log filter.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use provd::layout::Layout;
use provd::objstore::HttpBucket;
use provd::steps::{AppContext, WORKFLOW_KIND, provision_chain};
use provd::store::{DOMAIN_SCHEMA, Database};
use provd::volumes::DmThinPool;
use provd::workflow::{ProvisionRequest, RunStore, WorkflowRunner};

const DEFAULT_BUCKET: &str = "flyio-platform-hiring-challenge";
const DEFAULT_IMAGE: &str = "golang";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = run().await {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let layout = Layout::default();

    // Root cancellation: SIGINT/SIGTERM propagate to every in-flight run.
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let db = Database::open(&layout.db_path(), DOMAIN_SCHEMA)
        .context("failed to open metadata store")?;
    tracing::info!("metadata store initialized");

    let runs = RunStore::open(&layout.runs_db_path()).context("failed to open run store")?;
    tracing::info!("run store initialized");

    let bucket = std::env::var("PROVD_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
    let image = std::env::var("PROVD_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());

    let remote = Arc::new(HttpBucket::new(&bucket).context("failed to build bucket client")?);
    let volumes = Arc::new(DmThinPool::new(layout.clone()));
    let app = Arc::new(AppContext::new(db, remote, volumes, layout));
    tracing::info!(bucket = %bucket, image = %image, "application context initialized");

    let runner = WorkflowRunner::new(runs, app, cancel.clone());
    runner.register(WORKFLOW_KIND, provision_chain());

    let resumed = runner.resume().context("failed to resume unfinished runs")?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed unfinished runs");
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let request = ProvisionRequest {
        image_name: image,
        bucket_name: bucket,
    };
    runner
        .start(WORKFLOW_KIND, &run_id, &request)
        .context("failed to start run")?;
    tracing::info!(run_id = %run_id, "run started");

    let result = runner.wait_by_id(&run_id).await;

    runner.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("shutting down");

    result.context("run failed")?;
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}
