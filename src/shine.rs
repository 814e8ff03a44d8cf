//! ShineWiFi-X passthrough session.
//!
//! The vendor dongle speaks raw Modbus RTU on its own serial port. Each
//! CRC-valid frame it sends is queued on the shared transactor and the
//! inverter's reply is written back verbatim. Frames that fail CRC are
//! dropped without a reply; the dongle retries on its own schedule. Losing
//! the port never takes the broker down; the session backs off and reopens
//! while TCP service continues.

use crate::config::SerialSettings;
use crate::error::Fault;
use crate::event::{EventHub, Origin, WireEvent};
use crate::frame;
use crate::serial::RtuPort;
use crate::transactor::{Request, Transactor};
use crate::transport::DownstreamLink;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on one idle read so shutdown and port checks stay responsive.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const OPEN_RETRY: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

pub struct ShineSession<L> {
    settings: SerialSettings,
    transactor: Arc<Transactor<L>>,
    events: EventHub,
    cancel: CancellationToken,
}

impl<L: DownstreamLink> ShineSession<L> {
    pub fn new(
        settings: SerialSettings,
        transactor: Arc<Transactor<L>>,
        events: EventHub,
        cancel: CancellationToken,
    ) -> Self {
        ShineSession {
            settings,
            transactor,
            events,
            cancel,
        }
    }

    pub async fn run(self) {
        loop {
            let Some(mut port) = self.open_with_retry().await else {
                return;
            };
            self.events
                .emit(&WireEvent::info("shine_online").on_port(&self.settings.device));
            tracing::info!(
                "Shine port {} online at {} baud",
                self.settings.device,
                self.settings.baud
            );

            if !self.serve(&mut port).await {
                return;
            }
            self.events
                .emit(&WireEvent::info("shine_offline").on_port(&self.settings.device));
            tracing::warn!("Shine port {} offline, reopening", self.settings.device);
            if !self.pause(ERROR_BACKOFF).await {
                return;
            }
        }
    }

    /// Keep trying to open the dongle port; `None` means shutdown.
    async fn open_with_retry(&self) -> Option<RtuPort> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match RtuPort::open(&self.settings) {
                Ok(port) => return Some(port),
                Err(e) => {
                    self.events.emit(
                        &WireEvent::info("shine_open_failed")
                            .on_port(&self.settings.device)
                            .with_error(&e),
                    );
                    tracing::warn!("Cannot open Shine port {}: {}", self.settings.device, e);
                    if !self.pause(OPEN_RETRY).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Serve one port lifetime. Returns false on shutdown, true when the
    /// port was lost and should be reopened.
    async fn serve(&self, port: &mut RtuPort) -> bool {
        loop {
            let read = tokio::select! {
                read = port.read_frame(IDLE_READ_TIMEOUT) => read,
                () = self.cancel.cancelled() => return false,
            };
            let bytes = match read {
                Ok(bytes) => bytes,
                Err(_) => return true,
            };
            if bytes.is_empty() {
                continue;
            }
            if !frame::crc_ok(&bytes) {
                let fault = if bytes.len() < frame::MIN_FRAME_LEN {
                    Fault::ShortFrame
                } else {
                    Fault::CrcMismatch
                };
                self.events
                    .emit(&WireEvent::drop_inbound(&Origin::Shine, fault, &bytes));
                continue;
            }

            match self.transactor.transact(Request::raw(Origin::Shine, bytes)).await {
                Ok(resp) => {
                    if port.write_frame(&resp).await.is_err() {
                        return true;
                    }
                }
                // No synthetic reply on failure; the dongle retries per its
                // own protocol and the transactor already emitted the ERR.
                Err(Fault::Shutdown) => return false,
                Err(_) => {}
            }
        }
    }

    /// Sleep unless shutdown arrives first; false means shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}
