//! DoIP-style transport framing for the zonal gateway.
//!
//! Every frame on the wire is an 8-byte header followed by a payload:
//!
//! ```text
//! +---------+------------------+--------------+----------------+---------+
//! | version | inverse version  | payload type | payload length | payload |
//! | 1 byte  | 1 byte           | 2 bytes (BE) | 4 bytes (BE)   | n bytes |
//! +---------+------------------+--------------+----------------+---------+
//! ```
//!
//! Three payload types exist: routing activation request/response (the
//! authentication handshake) and diagnostic messages carrying UDS bytes.
//! [`message`] holds the codec, [`link`] the sans-IO per-connection state
//! machine that accumulates stream fragments and enforces the activation
//! gate.

pub mod link;
pub mod message;

pub use link::{Link, LinkError, LinkEvent, LinkRole, LinkState};
pub use message::{
    DiagnosticMessage, Header, Message, MessageKind, RoutingActivationRequest,
    RoutingActivationResponse, WireError,
};
