use super::Packetizer;
use super::ps;
use super::rtp::{RTP_HEADER_LENGTH, RtpHeader};

/// Largest chunk placed in one PES packet (the PES length field is 16-bit
/// and also covers the 13 optional header bytes).
pub const PES_LOAD_LENGTH: usize = 0xFFFF - 13;

/// Largest RTP packet (header + payload) put on the wire.
pub const RTP_LOAD_LENGTH: usize = 1460;

/// Payload type used for PS over RTP.
pub const PS_PAYLOAD_TYPE: u8 = 96;

/// How each RTP packet is framed for its sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Plain RTP datagrams.
    Udp,
    /// RTP over TCP: each packet prefixed with a 2-byte big-endian length
    /// of header + payload (RFC 4571).
    Interleaved,
    /// No RTP header at all; the payload bytes are written as-is. Used by
    /// the local file sink so the output is a playable PS file.
    Raw,
}

/// What the packetizer receives as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Input is already PS-muxed (a frame read from a PS file).
    RawPs,
    /// Input is an H.264 Annex B access unit that still needs PS muxing.
    Elementary,
}

/// PS-over-RTP packetizer for one call.
///
/// Owns the per-call RTP state (sequence number, SSRC); a fresh instance is
/// built for every call so no counters leak between calls.
///
/// ## Fragmentation
///
/// A frame is cut into PES-sized chunks of at most [`PES_LOAD_LENGTH`]
/// bytes, and every chunk into RTP payloads of at most
/// `RTP_LOAD_LENGTH - 12` bytes. Only the very last fragment of the frame
/// carries the marker bit, so concatenating all payloads of a frame in
/// sequence order gives back the encoded bytes.
#[derive(Debug)]
pub struct PsPacketizer {
    header: RtpHeader,
    framing: Framing,
    mode: EncodeMode,
}

impl PsPacketizer {
    pub fn new(ssrc: u32, framing: Framing, mode: EncodeMode) -> Self {
        Self {
            header: RtpHeader::new(PS_PAYLOAD_TYPE, ssrc),
            framing,
            mode,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Packetize a frame that is already PS-muxed.
    pub fn packetize_ps(&mut self, frame: &[u8], pts: u64) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut chunks = frame.chunks(PES_LOAD_LENGTH).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.fragment(chunk, pts, last, &mut packets);
        }
        packets
    }

    /// Mux an elementary-stream access unit into PS, then packetize it.
    ///
    /// Every unit gets a pack header; key frames additionally carry the
    /// system header and program stream map. The PS prefix goes in front
    /// of the first PES packet only.
    pub fn packetize_es(&mut self, frame: &[u8], key: bool, pts: u64) -> Vec<Vec<u8>> {
        let mut prefix = ps::pack_header(pts);
        if key {
            prefix.extend_from_slice(&ps::system_header(2048, 512));
            prefix.extend_from_slice(&ps::program_stream_map());
        }

        let mut packets = Vec::new();
        let mut prefix = Some(prefix);
        let mut chunks = frame.chunks(PES_LOAD_LENGTH).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let pes = ps::pes_packet(chunk, ps::STREAM_ID_VIDEO, pts, pts);
            let unit = match prefix.take() {
                Some(mut head) => {
                    head.extend_from_slice(&pes);
                    head
                }
                None => pes,
            };
            self.fragment(&unit, pts, last, &mut packets);
        }
        packets
    }

    /// Single hello packet sent when a voice intercom session starts.
    pub fn talk_hello(&mut self) -> Vec<u8> {
        self.frame(&[1, 2, 3], true, 0)
    }

    fn fragment(&mut self, data: &[u8], pts: u64, last: bool, out: &mut Vec<Vec<u8>>) {
        let max_payload = RTP_LOAD_LENGTH - RTP_HEADER_LENGTH;
        let mut pieces = data.chunks(max_payload).peekable();
        while let Some(piece) = pieces.next() {
            let marker = last && pieces.peek().is_none();
            out.push(self.frame(piece, marker, pts));
        }
    }

    fn frame(&mut self, payload: &[u8], marker: bool, pts: u64) -> Vec<u8> {
        if self.framing == Framing::Raw {
            return payload.to_vec();
        }

        let header = self.header.write(marker, pts as u32);
        let rtp_len = RTP_HEADER_LENGTH + payload.len();
        let mut packet = Vec::with_capacity(rtp_len + 2);
        if self.framing == Framing::Interleaved {
            packet.extend_from_slice(&(rtp_len as u16).to_be_bytes());
        }
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);
        packet
    }
}

impl Packetizer for PsPacketizer {
    fn packetize(&mut self, frame: &[u8], pts: u64) -> Vec<Vec<u8>> {
        match self.mode {
            EncodeMode::RawPs => self.packetize_ps(frame, pts),
            EncodeMode::Elementary => {
                let key = is_key_frame(frame);
                self.packetize_es(frame, key, pts)
            }
        }
    }

    fn last_sequence(&self) -> u16 {
        self.header.sequence()
    }
}

/// Whether an Annex B access unit contains an IDR slice or an SPS.
pub fn is_key_frame(data: &[u8]) -> bool {
    let mut i = 0usize;
    while i + 3 < data.len() {
        if data[i..i + 3] == [0, 0, 1] {
            let nal_type = data[i + 3] & 0x1f;
            if nal_type == 5 || nal_type == 7 {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}
