//! Wire protocol: header layout, incremental reader, outbound frames.

mod incoming;
mod outgoing;
mod wire_format;

pub use incoming::{IncomingMessage, Progress};
pub use outgoing::OutboundFrame;
pub use wire_format::{WireHeader, HEADER_SIZE, MAX_RPC_LEN};
