//! Serial/RS-485 port adapter.
//!
//! Wraps `tokio-serial` with the RTU framing rules the broker relies on:
//! inactivity-gap frame boundaries with a CRC scan over the receive buffer,
//! a closed-port state that fails operations fast, and reopen support.

use crate::config::{Parity, SerialSettings};
use crate::error::{BrokerError, Fault, Result};
use crate::frame;
use crate::transport::DownstreamLink;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort as _, SerialPortBuilderExt, SerialStream};

/// User-space scheduling gaps on Linux routinely exceed 3.5 character times
/// at common baud rates, so the inter-frame gap never goes below this floor.
const GAP_FLOOR: Duration = Duration::from_millis(20);

/// An RS-485 serial port with RTU framing.
pub struct RtuPort {
    settings: SerialSettings,
    stream: Option<SerialStream>,
    gap: Duration,
    carry: Vec<u8>,
}

impl RtuPort {
    /// Open the configured device and flush both directions.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let gap = settings
            .format
            .char_time(settings.baud)
            .mul_f64(3.5)
            .max(GAP_FLOOR);
        let mut port = RtuPort {
            settings: settings.clone(),
            stream: None,
            gap,
            carry: Vec::new(),
        };
        port.stream = Some(port.open_stream()?);
        Ok(port)
    }

    fn open_stream(&self) -> Result<SerialStream> {
        let parity = match self.settings.format.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let data_bits = match self.settings.format.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.settings.format.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let stream = tokio_serial::new(&self.settings.device, self.settings.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| BrokerError::Io(std::io::Error::other(e.to_string())))?;
        stream.clear(tokio_serial::ClearBuffer::All).ok();
        Ok(stream)
    }

    fn mark_closed(&mut self) {
        self.stream = None;
        self.carry.clear();
    }
}

impl DownstreamLink for RtuPort {
    fn device(&self) -> &str {
        &self.settings.device
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn drain(&mut self) {
        self.carry.clear();
        if let Some(stream) = self.stream.as_ref() {
            stream.clear(tokio_serial::ClearBuffer::Input).ok();
        }
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), Fault> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Fault::PortClosed);
        };
        if stream.write_all(bytes).await.is_err() || stream.flush().await.is_err() {
            self.mark_closed();
            return Err(Fault::WriteFailed);
        }
        Ok(())
    }

    async fn read_frame(&mut self, timeout: Duration) -> std::result::Result<Vec<u8>, Fault> {
        if self.stream.is_none() {
            return Err(Fault::PortClosed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = std::mem::take(&mut self.carry);
        if let Some(found) = frame::extract_frame(&mut buf) {
            self.carry = buf;
            return Ok(found);
        }
        let mut chunk = [0u8; 256];
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            // Before the first byte only the overall deadline applies; after
            // it, an inactivity gap marks a candidate frame boundary.
            let wait = if buf.is_empty() {
                deadline - now
            } else {
                self.gap.min(deadline - now)
            };
            let Some(stream) = self.stream.as_mut() else {
                return Err(Fault::PortClosed);
            };
            match tokio::time::timeout(wait, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.mark_closed();
                    return Err(Fault::PortClosed);
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(found) = frame::extract_frame(&mut buf) {
                        self.carry = buf;
                        return Ok(found);
                    }
                }
                Ok(Err(_)) => {
                    self.mark_closed();
                    return Err(Fault::PortClosed);
                }
                Err(_) => {
                    // Gap elapsed without completing a frame; keep waiting
                    // for more bytes until the deadline.
                }
            }
        }
        Ok(buf)
    }

    async fn reopen(&mut self) -> Result<()> {
        self.carry.clear();
        self.stream = Some(self.open_stream()?);
        Ok(())
    }
}
