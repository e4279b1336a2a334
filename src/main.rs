use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rand::Rng;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use tracing_subscriber::EnvFilter;

use playpen::{
    config::CoordinatorConfig,
    coordinator::Coordinator,
    http::{self, AppState},
    metrics::MetricsRegistry,
    storage::BundleStore,
};

/// Bound on how long draining may take once shutdown has been triggered.
const EXIT_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoordinatorConfig::from_env();
    init_tracing(&config);

    let metrics = Arc::new(MetricsRegistry::new());
    let coordinator = Arc::new(
        Coordinator::new(config.clone(), metrics.clone())
            .context("failed to build coordinator")?,
    );
    let store = match &config.database_path {
        Some(path) => Some(Arc::new(
            BundleStore::open(path).context("failed to open bundle store")?,
        )),
        None => None,
    };

    let (lameduck_tx, lameduck_rx) = watch::channel(false);
    let state = AppState {
        coordinator: coordinator.clone(),
        store,
        metrics,
        lameduck: lameduck_rx,
    };

    let app = http::routes(state);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    tracing::info!(
        addr = %config.bind_addr,
        workers = config.parallelism,
        sandbox = config.use_sandbox,
        "playground coordinator listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_exit(
            config.listen_timeout,
            lameduck_tx,
            coordinator,
        ))
        .await
        .context("coordinator server error")?;

    Ok(())
}

fn init_tracing(config: &CoordinatorConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Resolves when the coordinator should drain: on SIGTERM, or after a
/// random delay within the listen-timeout window. Hosts are recycled
/// periodically; exiting early at a jittered moment keeps a fleet from
/// draining in lockstep.
async fn wait_for_exit(
    limit: Duration,
    lameduck: watch::Sender<bool>,
    coordinator: Arc<Coordinator>,
) {
    tokio::select! {
        _ = sigterm() => tracing::info!("got SIGTERM, draining"),
        _ = listen_deadline(limit) => tracing::info!("listen deadline expired, draining"),
    }

    // Fail health checks so the load balancer stops sending requests.
    let _ = lameduck.send(true);

    tokio::spawn(async {
        tokio::time::sleep(EXIT_DELAY).await;
        tracing::error!("dispatcher did not stop in time, forcing exit");
        std::process::exit(1);
    });

    coordinator.stop().await;

    // Give queued chunked responses a moment to finish streaming.
    tokio::time::sleep(Duration::from_secs(2)).await;
}

async fn sigterm() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

async fn listen_deadline(limit: Duration) {
    if limit.is_zero() {
        std::future::pending::<()>().await;
    }
    let limit_ms = limit.as_millis() as u64;
    let delay_ms = limit_ms / 2 + rand::thread_rng().gen_range(0..=limit_ms / 2);
    tracing::info!(delay_ms, "scheduled automatic drain");
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}
