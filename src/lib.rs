pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod serial;
pub mod shine;
pub mod sniff;
pub mod tcp;
pub mod transactor;
pub mod transport;
pub mod wirelog;

pub use config::{BrokerConfig, Parity, SerialFormat, SerialSettings};
pub use error::{BrokerError, Fault, Result};
pub use event::{EventHub, EventSink, Origin, WireEvent};
pub use transactor::{Request, TransactResult, Transactor};
pub use transport::DownstreamLink;
