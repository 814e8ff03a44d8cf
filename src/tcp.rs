//! Modbus/TCP listener sessions.
//!
//! One listener per bound endpoint; every accepted connection runs its own
//! task reading MBAP frames, funnelling them through the shared transactor,
//! and answering with the downstream PDU or a gateway exception.

use crate::error::Fault;
use crate::event::Origin;
use crate::frame::{exception_pdu, mbap_frame, MbapHeader, MBAP_HEADER_LEN};
use crate::transactor::{Request, Transactor};
use crate::transport::DownstreamLink;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Modbus exception code reported upstream for a failed exchange.
#[must_use]
pub const fn exception_code(fault: Fault) -> u8 {
    match fault {
        // Gateway target device failed to respond.
        Fault::Timeout => 0x0B,
        // Slave device failure: the inverter answered garbage or the write
        // died mid-frame.
        Fault::CrcMismatch | Fault::ShortFrame | Fault::WriteFailed => 0x04,
        // Gateway path unavailable.
        Fault::PortClosed | Fault::Shutdown => 0x0A,
    }
}

/// Accept loop for one Modbus/TCP endpoint.
pub struct TcpServer<L> {
    transactor: Arc<Transactor<L>>,
    cancel: CancellationToken,
}

impl<L: DownstreamLink + 'static> TcpServer<L> {
    pub fn new(transactor: Arc<Transactor<L>>, cancel: CancellationToken) -> Self {
        TcpServer { transactor, cancel }
    }

    pub async fn run(self, listener: TcpListener) {
        let endpoint = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("TCP listener has no local address: {}", e);
                return;
            }
        };
        tracing::info!("Modbus-TCP listening on {}", endpoint);
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = self.cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Modbus-TCP client connected: {}", peer);
                    tokio::spawn(handle_connection(
                        self.transactor.clone(),
                        stream,
                        endpoint,
                        peer,
                        self.cancel.clone(),
                    ));
                }
                Err(e) => tracing::warn!("Accept on {} failed: {}", endpoint, e),
            }
        }
    }
}

/// Per-connection session: strictly sequential, so replies go back in
/// request order as Modbus clients expect. Any client error just closes
/// this connection.
async fn handle_connection<L: DownstreamLink>(
    transactor: Arc<Transactor<L>>,
    mut stream: TcpStream,
    endpoint: SocketAddr,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let origin = Origin::Tcp { endpoint, peer };
    let mut hdr = [0u8; MBAP_HEADER_LEN];
    loop {
        let read = tokio::select! {
            read = stream.read_exact(&mut hdr) => read,
            () = cancel.cancelled() => break,
        };
        if read.is_err() {
            break;
        }
        let header = match MbapHeader::parse(&hdr) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Closing {}: {}", peer, e);
                break;
            }
        };
        let mut pdu = vec![0u8; header.pdu_len()];
        let read = tokio::select! {
            read = stream.read_exact(&mut pdu) => read,
            () = cancel.cancelled() => break,
        };
        if read.is_err() {
            break;
        }

        let function = pdu[0];
        let reply = match transactor.transact(Request::from_pdu(origin, header.unit_id, &pdu)).await
        {
            Ok(frame) => {
                // Preserve the downstream unit id and PDU, drop the CRC.
                let resp_pdu = &frame[1..frame.len() - 2];
                mbap_frame(header.transaction_id, frame[0], resp_pdu)
            }
            Err(fault) => mbap_frame(
                header.transaction_id,
                header.unit_id,
                &exception_pdu(function, exception_code(fault)),
            ),
        };
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }
    tracing::debug!("Modbus-TCP client disconnected: {}", peer);
}
