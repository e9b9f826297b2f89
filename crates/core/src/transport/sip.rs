use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::error::{Result, SimError};
use crate::protocol::{CONTENT_TYPE_MANSCDP, SipMessage};

/// Largest signaling read.
pub const SIP_MAX_PACKET_SIZE: usize = 15000;

/// Read deadline on the signaling socket; expiry just loops back to check the running flag.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const QUEUE_DEPTH: usize = 1000;
const LENGTH_MARKER: &[u8] = b"Content-Length:";
const SPLIT_KEYWORD: &[u8] = b"MESSAGE";

/// Socket type used for signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingProtocol {
    Tcp,
    Udp,
}

impl FromStr for SignalingProtocol {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(SimError::UnknownTransport(other.to_string())),
        }
    }
}

/// Simulated compound delivery.
///
/// With probability `probability`, an outgoing message is written together
/// with the last `depth` previously sent messages whose content type equals
/// `content_type`, in a single socket write. This only changes how bytes are
/// grouped on the wire; it never alters a message.
///
/// The default policy never fires.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub probability: f64,
    pub depth: usize,
    pub content_type: String,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            probability: 0.0,
            depth: 3,
            content_type: CONTENT_TYPE_MANSCDP.to_string(),
        }
    }
}

/// Applies a [`BatchPolicy`] to the outbound message stream.
#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    recent: VecDeque<Vec<u8>>,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::new(),
        }
    }

    /// Bytes to write for `msg`: the message alone, or preceded by the
    /// recently sent messages of the batched content type.
    pub fn next_write(&mut self, msg: &SipMessage) -> Vec<u8> {
        let bytes = msg.serialize();

        let coalesce = !self.recent.is_empty()
            && self.policy.probability > 0.0
            && rand::random_bool(self.policy.probability.min(1.0));
        let out = if coalesce {
            tracing::debug!(batched = self.recent.len(), "coalescing outbound messages");
            let mut out: Vec<u8> = self.recent.iter().flatten().copied().collect();
            out.extend_from_slice(&bytes);
            out
        } else {
            bytes.clone()
        };

        let batched_type = msg
            .content_type()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(&self.policy.content_type));
        if batched_type && self.policy.depth > 0 {
            if self.recent.len() == self.policy.depth {
                self.recent.pop_front();
            }
            self.recent.push_back(bytes);
        }
        out
    }
}

/// Split a read that may hold two concatenated messages.
///
/// When the buffer holds more than one `Content-Length:` marker, it is cut at
/// the first line (after the first byte) starting with `MESSAGE`, and both
/// halves are returned. Otherwise the buffer is returned whole.
pub fn split_messages(buf: &[u8]) -> Vec<&[u8]> {
    let markers = buf
        .windows(LENGTH_MARKER.len())
        .filter(|w| *w == LENGTH_MARKER)
        .count();
    if markers <= 1 {
        return vec![buf];
    }

    let split = (1..buf.len()).find(|&i| buf[i - 1] == b'\n' && buf[i..].starts_with(SPLIT_KEYWORD));
    match split {
        Some(at) => vec![&buf[..at], &buf[at..]],
        None => vec![buf],
    }
}

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    fn try_clone(&self) -> std::io::Result<Self> {
        Ok(match self {
            Socket::Tcp(s) => Socket::Tcp(s.try_clone()?),
            Socket::Udp(s) => Socket::Udp(s.try_clone()?),
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Udp(s) => s.recv(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.write_all(buf),
            Socket::Udp(s) => s.send(buf).map(|_| ()),
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.local_addr(),
            Socket::Udp(s) => s.local_addr(),
        }
    }

    fn close(&self) {
        if let Socket::Tcp(s) = self {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// Duplex signaling channel bound to one socket.
///
/// Parsed inbound messages arrive on [`inbound`](Self::inbound); messages
/// pushed to [`outbound`](Self::outbound) are written by the sender thread.
pub struct SipEndpoint {
    pub inbound: Receiver<SipMessage>,
    pub outbound: Sender<SipMessage>,
    local_addr: SocketAddr,
    protocol: SignalingProtocol,
    running: Arc<AtomicBool>,
    socket: Socket,
}

impl SipEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> SignalingProtocol {
        self.protocol
    }

    /// Stop both loops and close the socket.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.socket.close();
            tracing::info!(local = %self.local_addr, "signaling transport closed");
        }
    }
}

/// Opens signaling connections to the platform.
pub struct SipTransport;

impl SipTransport {
    /// Dial `remote` and start the receive and send loops.
    pub fn open(remote: &str, protocol: SignalingProtocol, policy: BatchPolicy) -> Result<SipEndpoint> {
        let remote_addr = remote.to_socket_addrs()?.next().ok_or_else(|| {
            SimError::Io(std::io::Error::new(
                ErrorKind::AddrNotAvailable,
                format!("cannot resolve {remote}"),
            ))
        })?;

        let socket = match protocol {
            SignalingProtocol::Tcp => {
                let stream = TcpStream::connect(remote_addr).inspect_err(|e| {
                    tracing::error!(%remote_addr, error = %e, "signaling connect failed");
                })?;
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                Socket::Tcp(stream)
            }
            SignalingProtocol::Udp => {
                let bind = if remote_addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = UdpSocket::bind(bind)?;
                socket.connect(remote_addr)?;
                socket.set_read_timeout(Some(READ_TIMEOUT))?;
                Socket::Udp(socket)
            }
        };

        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let (inbound_tx, inbound_rx) = bounded(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = bounded(QUEUE_DEPTH);

        let reader = socket.try_clone()?;
        let writer = socket.try_clone()?;
        let r = running.clone();
        thread::spawn(move || receive_loop(reader, inbound_tx, r, protocol));
        let r = running.clone();
        thread::spawn(move || send_loop(writer, outbound_rx, r, Batcher::new(policy)));

        tracing::info!(%local_addr, %remote_addr, ?protocol, "signaling transport open");

        Ok(SipEndpoint {
            inbound: inbound_rx,
            outbound: outbound_tx,
            local_addr,
            protocol,
            running,
            socket,
        })
    }
}

fn receive_loop(
    mut socket: Socket,
    output: Sender<SipMessage>,
    running: Arc<AtomicBool>,
    protocol: SignalingProtocol,
) {
    let mut buf = vec![0u8; SIP_MAX_PACKET_SIZE];
    while running.load(Ordering::SeqCst) {
        let n = match socket.read(&mut buf) {
            Ok(0) if protocol == SignalingProtocol::Tcp => {
                tracing::warn!("signaling peer closed the connection");
                break;
            }
            Ok(0) => continue,
            Ok(n) => n,
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "signaling read failed");
                }
                if protocol == SignalingProtocol::Tcp {
                    break;
                }
                continue;
            }
        };

        for part in split_messages(&buf[..n]) {
            match SipMessage::parse(part) {
                Ok(msg) => {
                    tracing::trace!(method = msg.method(), call_id = msg.call_id(), "received");
                    if output.send(msg).is_err() {
                        tracing::debug!("inbound consumer gone");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, bytes = part.len(), "dropping unparsable signaling data");
                }
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    tracing::debug!("signaling receive loop exited");
}

fn send_loop(
    mut socket: Socket,
    input: Receiver<SipMessage>,
    running: Arc<AtomicBool>,
    mut batcher: Batcher,
) {
    while running.load(Ordering::SeqCst) {
        let msg = match input.recv_timeout(READ_TIMEOUT) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let bytes = batcher.next_write(&msg);
        tracing::trace!(method = msg.method(), status = ?msg.status(), bytes = bytes.len(), "sending");
        if let Err(e) = socket.write(&bytes) {
            tracing::error!(error = %e, method = msg.method(), "signaling write failed");
        }
    }
    tracing::debug!("signaling send loop exited");
}
