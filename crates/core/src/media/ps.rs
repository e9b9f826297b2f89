//! MPEG-2 Program Stream muxing (ISO/IEC 13818-1 §2.5).
//!
//! A PS frame for one video access unit looks like:
//!
//! ```text
//! pack header (0xBA, 14 bytes)
//! [system header (0xBB, 18 bytes)]      ← key frames only
//! [program stream map (0xBC, 24 bytes)] ← key frames only
//! PES packet (0xE0, 19-byte header + payload)
//! PES packet ...                         ← when the unit exceeds one PES
//! ```

/// Start code of a pack header.
pub const PACK_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBA];
/// PES stream id for the (single) video stream.
pub const STREAM_ID_VIDEO: u8 = 0xE0;
/// PES stream id for the (single) audio stream.
pub const STREAM_ID_AUDIO: u8 = 0xC0;

pub const PACK_HEADER_LENGTH: usize = 14;
pub const SYSTEM_HEADER_LENGTH: usize = 18;
pub const PSM_LENGTH: usize = 24;
pub const PES_HEADER_LENGTH: usize = 19;

/// Stream type for H.264 in the PSM.
const STREAM_TYPE_H264: u8 = 0x1B;
/// Stream type for G.711 A-law in the PSM (GB28181 convention).
const STREAM_TYPE_G711A: u8 = 0x90;

/// Bytes after the PES length field: 2 flag bytes, header length, PTS, DTS.
const PES_OPTIONAL_LENGTH: usize = 13;

/// Big-endian bit writer over a fixed buffer.
struct BitWriter {
    buf: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn with_len(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            bit: 0,
        }
    }

    fn write(&mut self, width: usize, value: u64) {
        for i in (0..width).rev() {
            if (value >> i) & 1 == 1 {
                self.buf[self.bit / 8] |= 0x80 >> (self.bit % 8);
            }
            self.bit += 1;
        }
    }

    fn into_inner(self) -> Vec<u8> {
        debug_assert_eq!(self.bit, self.buf.len() * 8);
        self.buf
    }
}

/// Pack header carrying the system clock reference.
pub fn pack_header(scr: u64) -> Vec<u8> {
    let mut w = BitWriter::with_len(PACK_HEADER_LENGTH);
    w.write(32, 0x0000_01BA);
    w.write(2, 0b01);
    w.write(3, (scr >> 30) & 0x07);
    w.write(1, 1);
    w.write(15, (scr >> 15) & 0x7fff);
    w.write(1, 1);
    w.write(15, scr & 0x7fff);
    w.write(1, 1);
    w.write(9, 0); // SCR extension
    w.write(1, 1);
    w.write(22, 255); // program_mux_rate
    w.write(2, 0b11);
    w.write(5, 0x1f); // reserved
    w.write(3, 0); // stuffing length
    w.into_inner()
}

/// System header describing one video and one audio stream.
pub fn system_header(video_buffer: u32, audio_buffer: u32) -> Vec<u8> {
    let mut w = BitWriter::with_len(SYSTEM_HEADER_LENGTH);
    w.write(32, 0x0000_01BB);
    w.write(16, (SYSTEM_HEADER_LENGTH - 6) as u64);
    w.write(1, 1);
    w.write(22, 50000); // rate_bound
    w.write(1, 1);
    w.write(6, 1); // audio_bound
    w.write(1, 0); // fixed_flag
    w.write(1, 1); // CSPS_flag
    w.write(1, 1); // system_audio_lock_flag
    w.write(1, 1); // system_video_lock_flag
    w.write(1, 1);
    w.write(5, 1); // video_bound
    w.write(1, 0); // packet_rate_restriction_flag
    w.write(7, 0x7f);
    // video stream bound, scale 1 => units of 1024 bytes
    w.write(8, STREAM_ID_VIDEO as u64);
    w.write(2, 0b11);
    w.write(1, 1);
    w.write(13, (video_buffer / 1024) as u64);
    // audio stream bound, scale 0 => units of 128 bytes
    w.write(8, STREAM_ID_AUDIO as u64);
    w.write(2, 0b11);
    w.write(1, 0);
    w.write(13, (audio_buffer / 128) as u64);
    w.into_inner()
}

/// Program stream map declaring H.264 video and G.711A audio.
pub fn program_stream_map() -> Vec<u8> {
    let mut w = BitWriter::with_len(PSM_LENGTH);
    w.write(32, 0x0000_01BC);
    w.write(16, (PSM_LENGTH - 6) as u64);
    w.write(1, 1); // current_next_indicator
    w.write(2, 0b11);
    w.write(5, 0); // version
    w.write(7, 0x7f);
    w.write(1, 1);
    w.write(16, 0); // program_stream_info_length
    w.write(16, 8); // elementary_stream_map_length
    w.write(8, STREAM_TYPE_H264 as u64);
    w.write(8, STREAM_ID_VIDEO as u64);
    w.write(16, 0);
    w.write(8, STREAM_TYPE_G711A as u64);
    w.write(8, STREAM_ID_AUDIO as u64);
    w.write(16, 0);
    w.write(32, 0); // CRC, filled below
    let mut psm = w.into_inner();
    let crc = crc32_mpeg2(&psm[..PSM_LENGTH - 4]);
    psm[PSM_LENGTH - 4..].copy_from_slice(&crc.to_be_bytes());
    psm
}

/// PES packet with PTS and DTS wrapping `payload`.
///
/// `payload` must not exceed `u16::MAX - 13` bytes.
pub fn pes_packet(payload: &[u8], stream_id: u8, pts: u64, dts: u64) -> Vec<u8> {
    let mut w = BitWriter::with_len(PES_HEADER_LENGTH);
    w.write(24, 0x00_0001);
    w.write(8, stream_id as u64);
    w.write(16, (payload.len() + PES_OPTIONAL_LENGTH) as u64);
    w.write(2, 0b10);
    w.write(2, 0); // scrambling
    w.write(1, 0); // priority
    w.write(1, 0); // data_alignment
    w.write(1, 0); // copyright
    w.write(1, 0); // original
    w.write(2, 0b11); // PTS_DTS_flags
    w.write(6, 0); // ESCR, ES_rate, DSM, additional_copy, CRC, extension
    w.write(8, 10); // PES_header_data_length
    write_timestamp(&mut w, 0b0011, pts);
    write_timestamp(&mut w, 0b0001, dts);

    let mut pes = w.into_inner();
    pes.extend_from_slice(payload);
    pes
}

fn write_timestamp(w: &mut BitWriter, prefix: u64, ts: u64) {
    w.write(4, prefix);
    w.write(3, (ts >> 30) & 0x07);
    w.write(1, 1);
    w.write(15, (ts >> 15) & 0x7fff);
    w.write(1, 1);
    w.write(15, ts & 0x7fff);
    w.write(1, 1);
}

/// CRC-32/MPEG-2 (poly 0x04C11DB7, init 0xFFFFFFFF, no reflection).
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Whether `buf` starts with a pack header start code.
pub fn is_pack_start(buf: &[u8]) -> bool {
    buf.starts_with(&PACK_START_CODE)
}

/// Decode a 33-bit timestamp written by [`write_timestamp`].
#[cfg(test)]
fn read_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64) >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64) >> 1) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64) >> 1
}
