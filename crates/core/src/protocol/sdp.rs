//! SDP offer parsing and answer generation (RFC 4566, GB28181 profile).
//!
//! GB28181 platforms send an offer like:
//!
//! ```text
//! v=0
//! o=34020000002000000001 0 0 IN IP4 192.168.1.10
//! s=Play                                  ← "Talk" for voice intercom
//! c=IN IP4 192.168.1.10
//! t=0 0
//! m=video 30000 RTP/AVP 96 98 97          ← port + transport
//! a=recvonly
//! a=rtpmap:96 PS/90000
//! y=0100000001                            ← SSRC (GB28181 extension line)
//! ```
//!
//! The device always answers with a single `TCP/RTP/AVP` video line carrying
//! PS at 90 kHz, whatever transport the offer named.

use std::fmt;

use crate::error::{Result, SimError};

/// Payload type advertised for PS in the answer.
pub const PS_PAYLOAD_TYPE: u8 = 96;
/// RTP clock rate for PS video.
pub const PS_CLOCK_RATE: u32 = 90000;

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// `video` or `audio`.
    pub kind: String,
    pub port: u16,
    /// Transport string, e.g. `RTP/AVP` or `TCP/RTP/AVP`.
    pub proto: String,
    pub formats: Vec<String>,
    /// `a=` lines of this section, without the `a=` prefix.
    pub attributes: Vec<String>,
}

impl MediaDescription {
    /// Value of the `a=<name>:<value>` attribute, if present.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find_map(|a| {
            let (key, value) = a.split_once(':')?;
            (key == name).then_some(value.trim())
        })
    }
}

/// A parsed or generated session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    /// `o=` username field.
    pub origin_user: String,
    /// `o=` unicast address.
    pub origin_addr: String,
    /// `s=` session name (`Play`, `Playback`, `Talk`, ...).
    pub session: String,
    /// `c=` connection address; falls back to the origin address.
    pub addr: String,
    /// Session-level `a=` lines.
    pub attributes: Vec<String>,
    pub media: Vec<MediaDescription>,
    /// Non-standard single-letter lines such as `y=` and `f=`.
    pub other: Vec<(char, String)>,
}

impl SessionDescription {
    /// Parse an SDP body.
    ///
    /// The first non-empty line must be `v=0` and at least one `m=` section
    /// must be present.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| SimError::Sdp("body is not UTF-8".to_string()))?;

        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some("v=0") => {}
            Some(other) => return Err(SimError::Sdp(format!("unexpected first line: {other}"))),
            None => return Err(SimError::Sdp("empty description".to_string())),
        }

        let mut sdp = SessionDescription::default();
        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| SimError::Sdp(format!("malformed line: {line}")))?;
            let mut chars = key.chars();
            let key = match (chars.next(), chars.next()) {
                (Some(k), None) => k,
                _ => return Err(SimError::Sdp(format!("malformed line: {line}"))),
            };

            match key {
                'o' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return Err(SimError::Sdp(format!("malformed origin: {value}")));
                    }
                    sdp.origin_user = parts[0].to_string();
                    sdp.origin_addr = parts[5].to_string();
                }
                's' => sdp.session = value.trim().to_string(),
                'c' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SimError::Sdp(format!("malformed connection: {value}")));
                    }
                    sdp.addr = parts[2].split('/').next().unwrap_or(parts[2]).to_string();
                }
                'm' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SimError::Sdp(format!("malformed media: {value}")));
                    }
                    let port = parts[1]
                        .split('/')
                        .next()
                        .and_then(|p| p.parse::<u16>().ok())
                        .ok_or_else(|| SimError::Sdp(format!("bad media port: {}", parts[1])))?;
                    sdp.media.push(MediaDescription {
                        kind: parts[0].to_string(),
                        port,
                        proto: parts[2].to_string(),
                        formats: parts[3..].iter().map(|f| f.to_string()).collect(),
                        attributes: Vec::new(),
                    });
                }
                'a' => match sdp.media.last_mut() {
                    Some(media) => media.attributes.push(value.to_string()),
                    None => sdp.attributes.push(value.to_string()),
                },
                'v' | 't' | 'b' | 'u' | 'e' | 'p' | 'i' | 'k' | 'r' | 'z' => {}
                other => sdp.other.push((other, value.trim().to_string())),
            }
        }

        if sdp.media.is_empty() {
            return Err(SimError::Sdp("no media section".to_string()));
        }
        if sdp.addr.is_empty() {
            sdp.addr = sdp.origin_addr.clone();
        }
        Ok(sdp)
    }

    /// SSRC carried on the `y=` line.
    ///
    /// Returns 0 when the line is absent or not a number, meaning the
    /// platform did not assert an SSRC.
    pub fn ssrc(&self) -> u32 {
        self.other
            .iter()
            .find(|(k, _)| *k == 'y')
            .and_then(|(_, v)| v.parse::<u32>().ok())
            .unwrap_or(0)
    }

    /// Whether the platform asked for a voice intercom session.
    pub fn is_talk(&self) -> bool {
        self.session == "Talk"
    }

    /// First media section of the given kind.
    pub fn media(&self, kind: &str) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == kind)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.origin_user, self.origin_addr)?;
        write!(f, "s={}\r\n", self.session)?;
        write!(f, "c=IN IP4 {}\r\n", self.addr)?;
        write!(f, "t=0 0\r\n")?;
        for attr in &self.attributes {
            write!(f, "a={}\r\n", attr)?;
        }
        for m in &self.media {
            write!(f, "m={} {} {}", m.kind, m.port, m.proto)?;
            for fmt_id in &m.formats {
                write!(f, " {}", fmt_id)?;
            }
            write!(f, "\r\n")?;
            for attr in &m.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }
        for (key, value) in &self.other {
            write!(f, "{}={}\r\n", key, value)?;
        }
        Ok(())
    }
}

/// Build the device's answer.
///
/// Always one send-only video line over `TCP/RTP/AVP` with PS/90000, and the
/// SSRC echoed on a `y=` line.
pub fn build_answer(device_id: &str, local_host: &str, local_port: u16, ssrc: u32) -> SessionDescription {
    let answer = SessionDescription {
        origin_user: device_id.to_string(),
        origin_addr: local_host.to_string(),
        session: "Play".to_string(),
        addr: local_host.to_string(),
        attributes: Vec::new(),
        media: vec![MediaDescription {
            kind: "video".to_string(),
            port: local_port,
            proto: "TCP/RTP/AVP".to_string(),
            formats: vec![PS_PAYLOAD_TYPE.to_string()],
            attributes: vec![
                format!("rtpmap:{} PS/{}", PS_PAYLOAD_TYPE, PS_CLOCK_RATE),
                "sendonly".to_string(),
            ],
        }],
        other: vec![('y', format!("{:010}", ssrc))],
    };
    tracing::debug!(sdp = %answer, "built SDP answer");
    answer
}
