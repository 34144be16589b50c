use anyhow::{bail, Context, Result};
use std::future::Future;

use tokio::{
    net::TcpListener,
    signal,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sensor_relay::{
    api,
    config::Config,
    db::{self, queue::{QueueError, ReadingQueue}},
    ingest::{mqtt::MqttFeed, IngestionListener},
    iothub::IotHubClient,
    relay::RelayScheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; variables may come from the service unit instead
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let pool = db::create_pool(&config.database_path).await?;
    db::run_migrations(&pool).await?;
    info!(path = %config.database_path, "Database ready");
    let queue = ReadingQueue::new(pool);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (failure_tx, mut failure_rx) = mpsc::channel::<()>(2);

    let listener_task: JoinHandle<Result<(), QueueError>> = {
        let listener = IngestionListener::new(queue.clone(), config.device_id.clone()).await?;
        let feed = MqttFeed::new(&config.mqtt);
        info!(
            host = %config.mqtt.host,
            port = config.mqtt.port,
            topic = %config.mqtt.topic,
            "Subscribing to sensor feed"
        );
        spawn_task(listener.run(feed, shutdown_rx.clone()), failure_tx.clone())
    };

    let relay_task: Option<JoinHandle<Result<(), QueueError>>> = match &config.connection_string {
        Some(conn_str) if config.relay_enabled => {
            let client = IotHubClient::new(conn_str, config.delivery_timeout, config.sas_ttl)
                .context("invalid IOTHUB_DEVICE_CONNECTION_STRING")?;
            let scheduler = RelayScheduler::new(queue.clone(), client, config.tick_period);
            Some(spawn_task(scheduler.run(shutdown_rx.clone()), failure_tx.clone()))
        }
        _ => {
            warn!("Relay disabled; readings are stored locally only");
            None
        }
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let tcp = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    // The HTTP server also stops once a background task fails or all of them
    // have ended.
    drop(failure_tx);
    axum::serve(tcp, api::router(queue))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = failure_rx.recv() => warn!("Background task ended; shutting down"),
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let mut failed = false;
    failed |= report("ingestion listener", listener_task.await);
    if let Some(task) = relay_task {
        failed |= report("relay scheduler", task.await);
    }

    if failed {
        bail!("stopped after a storage failure");
    }
    info!("Shut down cleanly");
    Ok(())
}

fn spawn_task<F>(task: F, failure_tx: mpsc::Sender<()>) -> JoinHandle<Result<(), QueueError>>
where
    F: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = task.await;
        if result.is_err() {
            let _ = failure_tx.send(()).await;
        }
        result
    })
}

/// Logs how a background task ended. Returns `true` when it failed.
fn report(name: &str, joined: Result<Result<(), QueueError>, tokio::task::JoinError>) -> bool {
    match joined {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task stopped on storage failure");
            true
        }
        Err(e) => {
            error!(task = name, error = %e, "Task panicked");
            true
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
