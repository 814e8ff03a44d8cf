//! Broker supervisor: wires the components together, runs them, and drives
//! a cooperative shutdown.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::event::{EventHub, EventSink, WireEvent};
use crate::serial::RtuPort;
use crate::shine::ShineSession;
use crate::sniff::SniffRelay;
use crate::tcp::TcpServer;
use crate::transactor::Transactor;
use crate::wirelog::WireLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for observers to drain their queues after the shutdown
/// announcement.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Run the broker until `cancel` fires.
///
/// Startup is fail-fast: the inverter port must open and every configured
/// TCP endpoint must bind, otherwise this returns an error and the process
/// should exit non-zero. After startup all failures are handled internally
/// (reopen loops, per-connection teardown, observer eviction).
pub async fn run(config: BrokerConfig, cancel: CancellationToken) -> Result<()> {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if let Some(path) = &config.log_path {
        let (log, writer) = WireLog::new(path.clone(), cancel.clone());
        sinks.push(Box::new(log));
        handles.push(tokio::spawn(writer.run()));
        tracing::info!("Wire log: {}", path.display());
    }

    if let Some((host, port)) = &config.sniff_bind {
        let listener = TcpListener::bind((host.as_str(), *port))
            .await
            .map_err(BrokerError::Io)?;
        tracing::info!("Sniff feed on {}:{}", host, port);
        let relay = SniffRelay::new();
        sinks.push(Box::new(relay.clone()));
        handles.push(tokio::spawn(relay.run(listener, cancel.clone())));
    }

    let events = EventHub::new(sinks);

    let link = RtuPort::open(&config.inverter)?;
    tracing::info!(
        "Inverter port {} at {} baud, min period {:?}, read timeout {:?}",
        config.inverter.device,
        config.inverter.baud,
        config.min_period,
        config.read_timeout
    );
    let transactor = Arc::new(Transactor::new(
        link,
        config.min_period,
        config.read_timeout,
        events.clone(),
        cancel.clone(),
    ));
    {
        let transactor = transactor.clone();
        handles.push(tokio::spawn(async move { transactor.reopen_loop().await }));
    }

    if config.tcp_binds.is_empty() {
        return Err(BrokerError::Config(
            "at least one TCP endpoint must be configured".to_string(),
        ));
    }
    for (host, port) in &config.tcp_binds {
        let listener = TcpListener::bind((host.as_str(), *port))
            .await
            .map_err(BrokerError::Io)?;
        let server = TcpServer::new(transactor.clone(), cancel.clone());
        handles.push(tokio::spawn(server.run(listener)));
    }

    match &config.shine {
        Some(settings) if settings.device != config.inverter.device => {
            let session = ShineSession::new(
                settings.clone(),
                transactor.clone(),
                events.clone(),
                cancel.clone(),
            );
            handles.push(tokio::spawn(session.run()));
        }
        Some(settings) => {
            tracing::info!(
                "Shine passthrough disabled ({} is the inverter port)",
                settings.device
            );
        }
        None => tracing::info!("Shine passthrough disabled"),
    }

    tracing::info!("Broker up");
    cancel.cancelled().await;

    tracing::info!("Shutting down");
    events.emit(&WireEvent::info("broker_shutdown"));
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    for handle in handles {
        handle.await.ok();
    }
    Ok(())
}
