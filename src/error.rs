use std::fmt;

/// Fatal setup/runtime errors surfaced by the library.
#[derive(Debug)]
pub enum BrokerError {
    Config(String),
    Io(std::io::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> BrokerError {
        BrokerError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Outcome taxonomy for a failed downstream exchange.
///
/// Faults never escape as task panics; every accepted request resolves to
/// either response bytes or one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No bytes received within the read timeout.
    Timeout,
    /// Fewer than 4 bytes received before the timeout.
    ShortFrame,
    /// Bytes received but the CRC trailer does not verify.
    CrcMismatch,
    /// OS write error on the downstream port.
    WriteFailed,
    /// The downstream port is closed and waiting to be reopened.
    PortClosed,
    /// The broker is shutting down before the request reached the wire.
    Shutdown,
}

impl Fault {
    /// Stable identifier used in the `reason` field of ERR events.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Fault::Timeout => "timeout",
            Fault::ShortFrame => "short_frame",
            Fault::CrcMismatch => "crc_mismatch",
            Fault::WriteFailed => "write_failed",
            Fault::PortClosed => "port_closed",
            Fault::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.reason())
    }
}
