//! Error types for the device simulator.

use std::fmt;

/// Errors that can occur in the simulator.
///
/// Every variant is scoped to a single message or a single call; none of
/// them is meant to bring the process down.
///
/// - **Signaling**: [`Parse`](Self::Parse) for malformed SIP messages,
///   [`Sdp`](Self::Sdp) for malformed session descriptions.
/// - **Transport**: [`Io`](Self::Io) for socket/file failures,
///   [`UnknownTransport`](Self::UnknownTransport) for unsupported protocol names.
/// - **Media**: [`QueueClosed`](Self::QueueClosed) when the writer side of a
///   call has gone away, [`NoRemoteMedia`](Self::NoRemoteMedia) when a
///   pipeline is started without a negotiated endpoint.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a SIP message.
    #[error("SIP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Failed to parse an SDP body.
    #[error("SDP parse error: {0}")]
    Sdp(String),

    /// The outbound media queue was closed by the writer.
    #[error("outbound media queue closed")]
    QueueClosed,

    /// A media pipeline was requested before an INVITE was negotiated.
    #[error("no negotiated remote media endpoint")]
    NoRemoteMedia,

    /// Transport name did not match any supported protocol.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),
}

/// Specific kind of SIP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Start line was neither `METHOD URI SIP/2.0` nor `SIP/2.0 CODE REASON`.
    InvalidStartLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Header section was not valid UTF-8.
    InvalidEncoding,
    /// No blank line separating headers from the body.
    Incomplete,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidEncoding => write!(f, "header section is not UTF-8"),
            Self::Incomplete => write!(f, "missing end of headers"),
        }
    }
}

/// Convenience alias for `Result<T, SimError>`.
pub type Result<T> = std::result::Result<T, SimError>;
