use crate::config::GatewayConfig;
use crate::queue::message::QueueKind;
use crate::server;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → probe → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: build state — connects the queue backend, fails fast when no
    // Redis candidate is reachable (runtime outages reconnect transparently).
    let config = GatewayConfig::load(&args.config_path)?;
    let state = server::GatewayState::new(config).await?;

    // Phase 2: initial health sweep so the first requests hit a warm cache.
    let snapshot = state.health.check_all().await;
    let healthy = snapshot.values().filter(|e| e.healthy).count();
    tracing::info!(
        "health: initial sweep completed, healthy={}/{}",
        healthy,
        snapshot.len()
    );

    // Phase 3: background loops — all owned here.
    let shutdown = Arc::new(Notify::new());
    start_worker_loop(&state, &shutdown);
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: gateway task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Continuous drain loop: one bounded main-queue cycle per interval.
/// Dead-letter drains stay operator-triggered so quarantine is deliberate.
fn start_worker_loop(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    let interval = std::time::Duration::from_secs(state.config.worker.poll_interval_secs);

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                tracing::info!("worker: drain loop stopped");
                return;
            }

            let report = state.worker.drain(QueueKind::Main).await;
            if report.popped > 0 {
                tracing::debug!(
                    "worker: scheduled cycle, popped={}, processed={}",
                    report.popped,
                    report.processed
                );
            }

            // Depth gauges are refreshed once per cycle, not per operation.
            for queue in [QueueKind::Main, QueueKind::DeadLetter] {
                if let Ok(depth) = state.store.len(queue).await {
                    metrics::gauge!(
                        "gateway_queue_depth",
                        "queue" => queue.as_str(),
                    )
                    .set(depth as f64);
                }
            }
        }
    });
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
