use crate::protocol::SipMessage;
use crate::protocol::sdp::SessionDescription;

/// Identity of a negotiated call.
///
/// Recorded when an INVITE is answered and used to check that the ACK and
/// BYE that follow belong to the same dialog. Call-ID is compared exactly,
/// the from-tag case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    pub call_id: String,
    /// Platform's tag (From header of the INVITE).
    pub from_tag: String,
    /// Device's tag (To header of the 200 OK).
    pub to_tag: String,
}

impl Leg {
    /// Whether `msg` belongs to this call.
    pub fn matches(&self, msg: &SipMessage) -> bool {
        self.call_id == msg.call_id()
            && msg
                .from_tag()
                .is_some_and(|tag| tag.eq_ignore_ascii_case(&self.from_tag))
    }
}

/// Media transport offered by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTransport {
    Tcp,
    Udp,
}

/// Who opens the TCP media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRole {
    /// The device dials the platform.
    Active,
    /// The device listens and the platform dials.
    Passive,
}

/// Media endpoint negotiated from the platform's offer.
///
/// Derived once per accepted INVITE and read-only afterwards.
///
/// ## Offer mapping
///
/// ```text
/// s=Talk                 → talk = true, audio m= line used
/// c=IN IP4 10.0.0.5      → ip
/// m=video 30000 TCP/...  → port = 30000, transport = Tcp
/// a=setup:active         → tcp_role = Passive (the platform dials us)
/// y=0100000001           → ssrc
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaInfo {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub transport: MediaTransport,
    pub tcp_role: TcpRole,
    pub local_ip: String,
    pub local_port: u16,
    /// Voice intercom session rather than live video.
    pub talk: bool,
}

impl RemoteMediaInfo {
    /// Derive the media endpoint from an offer.
    ///
    /// Returns `None` when the offer has no media line of the needed kind.
    pub fn from_offer(sdp: &SessionDescription, local_ip: &str, local_port: u16) -> Option<Self> {
        let talk = sdp.is_talk();
        let media = if talk {
            sdp.media("audio")
        } else {
            sdp.media("video")
        }?;

        let transport = if media.proto.to_ascii_uppercase().starts_with("TCP") {
            MediaTransport::Tcp
        } else {
            MediaTransport::Udp
        };
        let tcp_role = match media.attribute("setup") {
            Some(setup) if setup.eq_ignore_ascii_case("active") => TcpRole::Passive,
            _ => TcpRole::Active,
        };

        Some(Self {
            ssrc: sdp.ssrc(),
            ip: sdp.addr.clone(),
            port: media.port,
            transport,
            tcp_role,
            local_ip: local_ip.to_string(),
            local_port,
            talk,
        })
    }
}
