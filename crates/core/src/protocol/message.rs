use crate::error::{ParseErrorKind, Result, SimError};

/// SIP protocol version carried on every start line.
pub const SIP_VERSION: &str = "SIP/2.0";

/// User agent string stamped on every message the device originates.
pub const USER_AGENT: &str = "Embedded Net DVR/NVR/DVS";

/// Compact header forms (RFC 3261 §7.3.3) mapped to their full names.
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("i", "Call-ID"),
    ("f", "From"),
    ("t", "To"),
    ("v", "Via"),
    ("m", "Contact"),
    ("l", "Content-Length"),
    ("c", "Content-Type"),
];

/// Ordered header list with case-insensitive, compact-form aware lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    fn matches(key: &str, name: &str) -> bool {
        if key.eq_ignore_ascii_case(name) {
            return true;
        }
        COMPACT_FORMS.iter().any(|(short, long)| {
            (key.eq_ignore_ascii_case(short) && name.eq_ignore_ascii_case(long))
                || (key.eq_ignore_ascii_case(long) && name.eq_ignore_ascii_case(short))
        })
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| Self::matches(key, name))
            .map(|(_, value)| value.as_str())
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Replace the first value for `name`, or append if absent.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(key, _)| Self::matches(key, name)) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.push(name, value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A SIP request (RFC 3261 §7.1).
#[derive(Debug, Clone)]
#[must_use]
pub struct SipRequest {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(name, value);
        self
    }

    /// Attach a body together with its `Content-Type`.
    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }
}

/// A SIP response (RFC 3261 §7.2).
#[derive(Debug, Clone)]
#[must_use]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: reason_phrase(status_code).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// Response to `req` copying its Via, From, To, Call-ID and CSeq.
    ///
    /// `to_tag` is added to the To header unless the request already
    /// carries one.
    pub fn for_request(req: &SipMessage, status_code: u16, to_tag: &str) -> Self {
        let headers = req.headers();
        let mut resp = Self::new(status_code);
        for (name, value) in headers.iter().filter(|(name, _)| Headers::matches(name, "Via")) {
            resp.headers.push("Via", value);
        }
        for name in ["From", "Call-ID", "CSeq"] {
            if let Some(value) = headers.get(name) {
                resp.headers.push(name, value);
            }
        }
        if let Some(to) = headers.get("To") {
            match req.to_tag() {
                Some(_) => resp.headers.push("To", to),
                None => resp.headers.push("To", &with_header_param(to, "tag", to_tag)),
            }
        }
        resp.add_header("User-Agent", USER_AGENT)
    }
}

/// Default reason phrase for the status codes the device emits.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        481 => "Call/Transaction Does Not Exist",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        _ => "Unknown",
    }
}

/// A parsed SIP message: either a request or a response.
///
/// Both variants share the same header contract, so session logic reads
/// Call-ID, CSeq, From/To tags and the payload through the accessors here
/// without caring which variant it holds.
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl From<SipRequest> for SipMessage {
    fn from(req: SipRequest) -> Self {
        SipMessage::Request(req)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(resp: SipResponse) -> Self {
        SipMessage::Response(resp)
    }
}

impl SipMessage {
    /// Parse one SIP message from raw bytes.
    ///
    /// The header section must be UTF-8 and terminated by an empty line.
    /// The body is everything after it, truncated to `Content-Length` when
    /// that header is present and smaller than the remaining bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (head_end, body_start) = find_header_end(raw).ok_or(SimError::Parse {
            kind: ParseErrorKind::Incomplete,
        })?;
        let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| SimError::Parse {
            kind: ParseErrorKind::InvalidEncoding,
        })?;

        let mut lines = head.lines().skip_while(|l| l.trim().is_empty());
        let start_line = lines.next().ok_or(SimError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or(SimError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push(line[..colon].trim(), line[colon + 1..].trim());
        }

        let mut body = raw[body_start..].to_vec();
        if let Some(len) = headers
            .get("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            && len < body.len()
        {
            body.truncate(len);
        }

        if let Some(rest) = start_line.strip_prefix(SIP_VERSION) {
            let mut parts = rest.trim().splitn(2, ' ');
            let status_code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or(SimError::Parse {
                    kind: ParseErrorKind::InvalidStartLine,
                })?;
            let reason = parts.next().unwrap_or("").trim().to_string();
            return Ok(SipMessage::Response(SipResponse {
                status_code,
                reason,
                headers,
                body,
            }));
        }

        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 || parts[2] != SIP_VERSION {
            return Err(SimError::Parse {
                kind: ParseErrorKind::InvalidStartLine,
            });
        }
        Ok(SipMessage::Request(SipRequest {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            headers,
            body,
        }))
    }

    /// Serialize to the SIP text wire format.
    ///
    /// `Content-Length` is always recomputed from the body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = match self {
            SipMessage::Request(req) => format!("{} {} {}\r\n", req.method, req.uri, SIP_VERSION),
            SipMessage::Response(resp) => {
                format!("{} {} {}\r\n", SIP_VERSION, resp.status_code, resp.reason)
            }
        };
        for (name, value) in self.headers().iter() {
            if Headers::matches(name, "Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body().len()));

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(self.body());
        bytes
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    /// Status code for responses, `None` for requests.
    pub fn status(&self) -> Option<u16> {
        match self {
            SipMessage::Request(_) => None,
            SipMessage::Response(resp) => Some(resp.status_code),
        }
    }

    /// Method the message belongs to.
    ///
    /// For requests this is the request method; for responses it is the
    /// method named in the CSeq header.
    pub fn method(&self) -> &str {
        match self {
            SipMessage::Request(req) => &req.method,
            SipMessage::Response(_) => self.cseq().map(|(_, m)| m).unwrap_or(""),
        }
    }

    pub fn call_id(&self) -> &str {
        self.headers().get("Call-ID").unwrap_or("")
    }

    /// CSeq sequence number and method.
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.headers().get("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?;
        Some((seq, method))
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers().get("From").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers().get("To").and_then(|v| header_param(v, "tag"))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers().get("Content-Type")
    }
}

/// Locate the end of the header block.
///
/// Returns `(header_end, body_start)`; accepts both CRLF and bare LF.
fn find_header_end(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    raw.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// Look up a `;name=value` parameter in a header value.
///
/// Parameters inside `<...>` belong to the URI and are skipped.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let (key, val) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then_some(val.trim())
    })
}

/// Return `value` with its `;name=` parameter set to `param`.
pub fn with_header_param(value: &str, name: &str, param: &str) -> String {
    let (addr, params) = match value.rfind('>') {
        Some(pos) => value.split_at(pos + 1),
        None => match value.find(';') {
            Some(pos) => value.split_at(pos),
            None => (value, ""),
        },
    };
    let mut out = addr.to_string();
    for p in params.split(';').filter(|p| !p.trim().is_empty()) {
        let key = p.split('=').next().unwrap_or("").trim();
        if !key.eq_ignore_ascii_case(name) {
            out.push(';');
            out.push_str(p.trim());
        }
    }
    out.push_str(&format!(";{}={}", name, param));
    out
}

/// Fresh random dialog tag.
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Fresh Call-ID for device-originated requests.
pub fn generate_call_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Fresh Via branch carrying the RFC 3261 magic cookie.
pub fn generate_branch() -> String {
    format!("z9hG4bK{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:34020000001320000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK123\r\n\
        From: <sip:34020000002000000001@3402000000>;tag=AbC1\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: call-1@10.0.0.1\r\n\
        CSeq: 20 INVITE\r\n\
        Content-Type: APPLICATION/SDP\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\r\nGARBAGE";

    #[test]
    fn parse_request_fields() {
        let msg = SipMessage::parse(INVITE.as_bytes()).unwrap();
        assert!(!msg.is_response());
        assert_eq!(msg.method(), "INVITE");
        assert_eq!(msg.call_id(), "call-1@10.0.0.1");
        assert_eq!(msg.cseq(), Some((20, "INVITE")));
        assert_eq!(msg.from_tag(), Some("AbC1"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.content_type(), Some("APPLICATION/SDP"));
        assert_eq!(msg.body(), b"v=0\r");
    }

    #[test]
    fn parse_response_uses_cseq_method() {
        let raw = "SIP/2.0 200 OK\r\nCSeq: 1 REGISTER\r\nCall-ID: x\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.status(), Some(200));
        assert_eq!(msg.method(), "REGISTER");
    }

    #[test]
    fn compact_headers() {
        let raw = "BYE sip:a SIP/2.0\r\ni: cid\r\nf: <sip:b>;tag=t1\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.call_id(), "cid");
        assert_eq!(msg.from_tag(), Some("t1"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(SipMessage::parse(b"").is_err());
        assert!(SipMessage::parse(b"hello world\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:a SIP/2.0\r\nBroken\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:a SIP/2.0\r\nCall-ID: x").is_err());
    }

    #[test]
    fn serialize_recomputes_content_length() {
        let msg: SipMessage = SipResponse::new(200)
            .add_header("Call-ID", "abc")
            .add_header("Content-Length", "999")
            .with_body("application/sdp", "v=0\r\n")
            .into();
        let text = String::from_utf8(msg.serialize()).unwrap();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
        assert!(!text.contains("999"));

        let back = SipMessage::parse(text.as_bytes()).unwrap();
        assert_eq!(back.body(), b"v=0\r\n");
    }

    #[test]
    fn header_param_ignores_uri_params() {
        let v = "<sip:a@b;tag=wrong>;tag=right";
        assert_eq!(header_param(v, "tag"), Some("right"));
        assert_eq!(header_param("<sip:a@b>", "tag"), None);
    }

    #[test]
    fn with_header_param_replaces_existing() {
        assert_eq!(with_header_param("<sip:a@b>", "tag", "x"), "<sip:a@b>;tag=x");
        assert_eq!(
            with_header_param("<sip:a@b>;tag=old;foo=1", "tag", "new"),
            "<sip:a@b>;foo=1;tag=new"
        );
        assert_eq!(with_header_param("sip:a@b;tag=old", "tag", "n"), "sip:a@b;tag=n");
    }

    #[test]
    fn response_copies_dialog_headers() {
        let req = SipMessage::parse(INVITE.as_bytes()).unwrap();
        let resp = SipMessage::from(SipResponse::for_request(&req, 481, "dev1"));
        assert_eq!(resp.status(), Some(481));
        assert_eq!(resp.call_id(), req.call_id());
        assert_eq!(resp.cseq(), req.cseq());
        assert_eq!(resp.from_tag(), Some("AbC1"));
        assert_eq!(resp.to_tag(), Some("dev1"));
        assert_eq!(resp.headers().get("Via"), req.headers().get("Via"));
        assert_eq!(resp.headers().get("User-Agent"), Some(USER_AGENT));
    }
}
