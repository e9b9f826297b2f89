//! Network transport for signaling and media.
//!
//! The device uses a split transport model:
//!
//! - **Signaling** ([`sip`]): one TCP or UDP socket towards the platform,
//!   with a receive thread and a send thread.
//!
//! - **Media** ([`stream`]): one socket (or file) per call, fed by a bounded
//!   packet queue and drained by a writer thread. RTP over TCP uses the
//!   2-byte length prefix of RFC 4571.

pub mod sip;
pub mod stream;

pub use sip::{BatchPolicy, SignalingProtocol, SipEndpoint, SipTransport};
pub use stream::{StreamKind, StreamTransport};
