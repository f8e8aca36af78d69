//! peeklock-consumer: worker entrypoint
//!
//! Overview
//! --------
//! Connects to a Redis Streams consumer group, receives deliveries under a
//! peek-lock, runs the simulated workload, and settles each message
//! (complete / abandon / dead-letter) or leaves it to the transport when
//! auto-complete is on.
//!
//! Responsibilities
//! ----------------
//! - Initialize logging, configuration, and the Redis pool.
//! - Wire transport, error sink, and settlement engine into the worker loop.
//! - Translate ctrl-c into the shutdown signal; drain in-flight work.
//!
//! Error Model
//! -----------
//! - Initialization failures are fatal.
//! - Per-message failures are logged and do not terminate the loop.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peeklock_consumer::app::{self, WorkerOptions};
use peeklock_consumer::config::{load_config, Config};
use peeklock_consumer::emit::{ErrorSink, LogSink, StreamAlertSink};
use peeklock_consumer::redis::{init_redis_pool, pool, RedisStreamTransport};
use peeklock_consumer::settle::SettlementEngine;

pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().compact())
        .with(ErrorLayer::default())
        .init();
}

fn log_summary(cfg: &Config) {
    info!("===================== SUMMARY ====================");
    info!(auto_complete = cfg.auto_complete, "Auto-complete is set to: {}", cfg.auto_complete);
    info!(
        max_auto_lock_renew_secs = cfg.max_auto_lock_renew.as_secs(),
        "Auto renewal is set to: {}",
        cfg.max_auto_lock_renew.as_secs()
    );
    info!(
        stream = %cfg.stream,
        group = %cfg.group,
        consumer = %cfg.consumer,
        lock_secs = cfg.lock_duration.as_secs(),
        max_delivery_count = ?cfg.max_delivery_count,
        concurrency = cfg.concurrency,
        "queue binding"
    );
    info!("====================== END =======================");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("consumer starting");

    let config = Arc::new(load_config().context("failed to load config")?);
    log_summary(&config);

    init_redis_pool(&config.redis_url)
        .await
        .context("failed to initialize redis pool")?;

    let transport = RedisStreamTransport::new(
        pool().clone(),
        &config.stream,
        &config.group,
        &config.consumer,
        config.settlement_mode(),
    )
    .with_lock_duration(config.lock_duration)
    .with_dead_letter_stream(&config.dead_letter_stream);
    transport
        .ensure_stream_group()
        .await
        .context("failed to create consumer group")?;

    let sink: Arc<dyn ErrorSink> = match &config.alert_stream {
        Some(stream) => Arc::new(StreamAlertSink::new(pool().clone(), stream)),
        None => Arc::new(LogSink),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::new(SettlementEngine::new(
        config.delivery_policy(),
        config.lock_budget(),
        sink,
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
            return;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    app::run(transport, engine, WorkerOptions::from(&*config), shutdown_rx).await?;

    info!("consumer stopped");
    Ok(())
}
