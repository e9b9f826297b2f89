//! SIP signaling model and SDP negotiation.
//!
//! GB28181 uses plain SIP (RFC 3261) for device control. The simulator only
//! needs the subset that lets a platform register it, query its catalog and
//! pull one live stream per call:
//!
//! | Method | Direction | Purpose |
//! |--------|-----------|---------|
//! | REGISTER | device → platform | Announce the device |
//! | MESSAGE | both | Keepalive, catalog query/response (MANSCDP XML) |
//! | INVITE | platform → device | Request a live stream (SDP offer) |
//! | ACK | platform → device | Confirm the 200 OK, start streaming |
//! | BYE | platform → device | Stop streaming |

pub mod message;
pub mod sdp;

pub use message::{SipMessage, SipRequest, SipResponse};
pub use sdp::SessionDescription;

/// Content type of SDP bodies.
pub const CONTENT_TYPE_SDP: &str = "application/sdp";
/// Content type of GB28181 XML control bodies.
pub const CONTENT_TYPE_MANSCDP: &str = "Application/MANSCDP+xml";
