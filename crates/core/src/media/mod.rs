//! PS muxing and RTP packetization.
//!
//! GB28181 carries media as an MPEG-2 Program Stream inside RTP (payload
//! type 96, 90 kHz clock):
//!
//! ```text
//! H.264 access unit ─► PS (pack hdr [+ sys hdr + PSM] + PES) ─► RTP fragments
//! ```
//!
//! - [`ps`]: pack header, system header, program stream map, PES.
//! - [`rtp`]: 12-byte fixed header and per-call sequence state.
//! - [`packetizer`]: [`PsPacketizer`] fragments PS frames into framed RTP
//!   packets (UDP, interleaved TCP, or raw for file sinks).
//! - [`source`]: [`MediaSource`] replays a PS file frame by frame.
//!
//! The presentation counter advances by [`PTS_STEP`] per frame and the file
//! loop sleeps [`FRAME_INTERVAL`] between frames, approximating real time.

use std::time::Duration;

pub mod packetizer;
pub mod ps;
pub mod rtp;
pub mod source;

pub use packetizer::{EncodeMode, Framing, PsPacketizer};
pub use source::MediaSource;

/// Presentation counter increment per encoded unit.
pub const PTS_STEP: u64 = 40;

/// Pause between frames when replaying a file.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(40);

/// Turns one encoded unit into wire-ready packets.
///
/// Implementations own their RTP state; one instance serves one call.
pub trait Packetizer: Send {
    /// Encode `frame` into framed packets, in send order.
    fn packetize(&mut self, frame: &[u8], pts: u64) -> Vec<Vec<u8>>;

    /// Sequence number of the most recent packet.
    fn last_sequence(&self) -> u16;
}
