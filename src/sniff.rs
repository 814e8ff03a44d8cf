//! Passive observer relay.
//!
//! Observers connect over TCP and receive every wire event as one JSON line.
//! Each observer gets a bounded queue; a full queue marks the observer as
//! overrun and evicts it so a slow reader can never stall the transactor.

use crate::event::EventSink;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pending lines an observer may fall behind before it is dropped.
const OBSERVER_QUEUE: usize = 256;

struct Observer {
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

/// Fan-out hub for sniff observers. Cloning shares the observer set.
#[derive(Clone, Default)]
pub struct SniffRelay {
    observers: Arc<Mutex<Vec<Observer>>>,
}

impl SniffRelay {
    #[must_use]
    pub fn new() -> Self {
        SniffRelay::default()
    }

    /// Accept observers until shutdown.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = cancel.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Sniff accept failed: {}", e);
                    continue;
                }
            };
            tracing::info!("Sniff observer connected: {}", peer);
            let (tx, rx) = mpsc::channel(OBSERVER_QUEUE);
            self.observers.lock().unwrap().push(Observer { peer, tx });
            tokio::spawn(pump_observer(stream, peer, rx, cancel.clone()));
        }
    }

    /// Number of currently attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

impl EventSink for SniffRelay {
    fn handle(&self, line: &str) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|obs| match obs.tx.try_send(line.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Sniff observer {} overrun ({} pending), dropping it",
                    obs.peer,
                    OBSERVER_QUEUE
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Per-observer writer: pops queued lines and pushes them down the socket.
/// Ends when the queue closes (eviction), the peer goes away, or shutdown.
async fn pump_observer(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            line = rx.recv() => line,
            () = cancel.cancelled() => {
                // Flush queued lines (the shutdown notice among them)
                // before the socket goes away.
                while let Ok(mut line) = rx.try_recv() {
                    line.push('\n');
                    if stream.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        let Some(mut line) = line else { break };
        line.push('\n');
        if stream.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    tracing::info!("Sniff observer disconnected: {}", peer);
}
