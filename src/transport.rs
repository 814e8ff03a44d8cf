use crate::error::{Fault, Result};
use std::future::Future;
use std::time::Duration;

/// Physical-layer seam for a broker serial leg.
///
/// Implementations own the port and its framing state. The broker core only
/// needs the operations below, which keeps the transactor testable against
/// an in-memory link.
pub trait DownstreamLink: Send {
    /// Device path or another stable identifier, used in lifecycle events.
    fn device(&self) -> &str;

    /// Whether the underlying port is currently usable. A closed link fails
    /// every read/write fast with [`Fault::PortClosed`].
    fn is_open(&self) -> bool;

    /// Discard bytes already buffered from the wire, both in the OS and in
    /// the framer carry-over. A late reply to an earlier transaction must
    /// never be taken for the next one's response.
    fn drain(&mut self) -> impl Future<Output = ()> + Send;

    /// Write one frame and flush it out. An OS error closes the link.
    fn write_frame(
        &mut self,
        bytes: &[u8],
    ) -> impl Future<Output = std::result::Result<(), Fault>> + Send;

    /// Read until a CRC-terminated frame, an inactivity gap after the last
    /// byte, or the timeout. Returns the verified frame when one was found,
    /// otherwise whatever bytes accumulated (possibly none) once the timeout
    /// expires; the caller classifies those.
    fn read_frame(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<Vec<u8>, Fault>> + Send;

    /// Try to restore a closed port.
    fn reopen(&mut self) -> impl Future<Output = Result<()>> + Send;
}
