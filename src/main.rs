use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use inbox_relay::api;
use inbox_relay::config::Config;
use inbox_relay::context::AppContext;
use inbox_relay::monitor::{Monitor, MonitorGroup, SourceMonitor};
use inbox_relay::processor::{HttpTransform, MessageTransform, PassthroughTransform, QueueProcessor};
use inbox_relay::push::PushRegistry;
use inbox_relay::queue::RetentionSweep;
use inbox_relay::sources::create_source;
use inbox_relay::store::{CredentialStore, LibSqlBackend, QueueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Inbox Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}", config.http_port);
    eprintln!("   Events: http://0.0.0.0:{}/api/events?user_id=…", config.http_port);
    eprintln!("   Workers: {}", config.queue.workers);
    match config.queue.retention {
        Some(retention) => eprintln!("   Retention: {} days", retention.as_secs() / 86_400),
        None => eprintln!("   Retention: forever"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Transform ────────────────────────────────────────────────────────
    let transform: Arc<dyn MessageTransform> = match &config.queue.transform_url {
        Some(url) => {
            info!(url = %url, "Using HTTP transform");
            Arc::new(HttpTransform::new(url, config.queue.transform_timeout)?)
        }
        None => {
            info!("RELAY_TRANSFORM_URL not set, using passthrough transform");
            Arc::new(PassthroughTransform)
        }
    };

    let push = Arc::new(PushRegistry::new());
    let enqueue_defaults = config.queue.enqueue_options();

    // ── Monitors ─────────────────────────────────────────────────────────
    let credentials: Arc<dyn CredentialStore> = db.clone();
    let queue_store: Arc<dyn QueueStore> = db.clone();
    let monitor_config = config.monitors.monitor_config(enqueue_defaults);
    let monitors: Vec<Arc<dyn Monitor>> = config
        .monitors
        .sources
        .iter()
        .map(|spec| {
            let source = create_source(
                spec.source,
                config.monitors.adapter_config(spec),
                Arc::clone(&credentials),
            );
            let name = format!("{}:{}", spec.user_id, spec.source.as_str().to_lowercase());
            Arc::new(SourceMonitor::new(
                name,
                source,
                Arc::clone(&queue_store),
                monitor_config.clone(),
            )) as Arc<dyn Monitor>
        })
        .collect();
    if monitors.is_empty() {
        warn!("RELAY_SOURCES not set, no sources will be polled");
    }
    let monitors = Arc::new(MonitorGroup::new("sources", monitors));
    monitors.start().await;

    // ── Queue processors ─────────────────────────────────────────────────
    let mut background = Vec::with_capacity(config.queue.workers);
    for index in 0..config.queue.workers {
        let processor = Arc::new(QueueProcessor::new(
            db.clone(),
            db.clone(),
            Arc::clone(&transform),
            Arc::clone(&push),
            config.queue.processor_config(index),
        ));
        background.push(processor.spawn());
    }

    // ── Retention ────────────────────────────────────────────────────────
    if let Some(retention) = config.queue.retention {
        let sweep = Arc::new(RetentionSweep::new(
            db.clone(),
            retention,
            config.queue.retention_sweep_interval,
        ));
        background.push(sweep.spawn());
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let ctx = AppContext::from_backend(
        db.clone(),
        Arc::clone(&push),
        Arc::clone(&monitors),
        enqueue_defaults,
        config.queue.transform_timeout,
    );
    let app = api::routes(ctx);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    info!(port = config.http_port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    info!("Shutting down");
    monitors.stop().await;
    for (_, shutdown) in &background {
        shutdown.store(true, Ordering::Relaxed);
    }
    for (handle, _) in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task failed");
        }
    }

    Ok(())
}

/// Console logging plus an optional daily-rolling file under `RELAY_LOG_DIR`.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
