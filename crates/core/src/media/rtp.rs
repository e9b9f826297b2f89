/// Length of the RTP fixed header with no CSRCs.
pub const RTP_HEADER_LENGTH: usize = 12;

/// RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One instance belongs to one call. The sequence number is advanced before
/// each packet, so the first packet of a call carries 1. The timestamp is
/// supplied by the caller per frame (the PS presentation counter).
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier, fixed for the call.
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
        }
    }

    /// Sequence number of the last packet written (0 before the first).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Advance the sequence number and serialize a 12-byte header.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_LENGTH] {
        self.sequence = self.sequence.wrapping_add(1);

        let mut header = [0u8; RTP_HEADER_LENGTH];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Fields of a serialized RTP header, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpFields {
    pub marker: bool,
    pub pt: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpFields {
    /// Read the fixed header from the front of `packet`.
    pub fn read(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LENGTH || packet[0] >> 6 != 2 {
            return None;
        }
        Some(Self {
            marker: packet[1] & 0x80 != 0,
            pt: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}
