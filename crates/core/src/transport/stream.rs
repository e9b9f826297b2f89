use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};

use crate::error::{Result, SimError};
use crate::media::Framing;

/// Capacity of the queue between the packetizer and the writer thread.
pub const QUEUE_DEPTH: usize = 25;

/// The writer gives up when no packet arrives for this long.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Where a call's media goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// RTP datagrams from `local_port` to the remote endpoint.
    Udp,
    /// The device dials the platform and sends RTP over TCP.
    TcpActive,
    /// The device listens on `local_port` and the platform dials in.
    TcpPassive,
    /// Raw PS written to a file (for offline inspection).
    LocalFile(PathBuf),
}

impl StreamKind {
    /// Packet framing this sink expects.
    pub fn framing(&self) -> Framing {
        match self {
            StreamKind::Udp => Framing::Udp,
            StreamKind::TcpActive | StreamKind::TcpPassive => Framing::Interleaved,
            StreamKind::LocalFile(_) => Framing::Raw,
        }
    }
}

/// Concrete sink the writer thread writes to.
enum Sink {
    Udp(UdpSocket),
    Tcp(TcpStream),
    File(File),
}

impl Sink {
    fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Udp(socket) => {
                let sent = socket.send(packet)?;
                if sent != packet.len() {
                    return Err(std::io::Error::new(ErrorKind::WriteZero, "short datagram write"));
                }
                Ok(())
            }
            Sink::Tcp(stream) => stream.write_all(packet),
            Sink::File(file) => file.write_all(packet),
        }
    }

    fn close(self) {
        match self {
            Sink::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Sink::File(mut file) => {
                let _ = file.flush();
            }
            Sink::Udp(_) => {}
        }
    }
}

/// Outbound media socket of one call plus its writer thread.
///
/// [`open`](Self::open) establishes the sink and starts a writer that drains
/// the bounded packet queue in order. The writer stops on a write error,
/// when every producer handle is dropped, on [`exit`](Self::exit), or after
/// [`INACTIVITY_TIMEOUT`] without packets. Once it stops, the queue is
/// closed and producers get [`SimError::QueueClosed`].
///
/// [`exit`](Self::exit) blocks until the writer has released the socket.
pub struct StreamTransport {
    kind: StreamKind,
    queue: Option<Sender<Vec<u8>>>,
    stop: Sender<()>,
    writer: Option<JoinHandle<()>>,
}

impl StreamTransport {
    pub fn open(
        kind: StreamKind,
        local_ip: &str,
        remote_ip: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self> {
        let (queue_tx, queue_rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let label = format!("{:?}", kind);
        let writer = match &kind {
            StreamKind::Udp => {
                let socket = UdpSocket::bind(resolve(local_ip, local_port)?)?;
                socket.connect(resolve(remote_ip, remote_port)?)?;
                tracing::info!(local = ?socket.local_addr().ok(), remote_ip, remote_port, "media over UDP");
                spawn_writer(Sink::Udp(socket), queue_rx, stop_rx, label)
            }
            StreamKind::TcpActive => {
                let remote = resolve(remote_ip, remote_port)?;
                let stream = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT)?;
                stream.set_nodelay(true)?;
                tracing::info!(local = ?stream.local_addr().ok(), %remote, "media over TCP (active)");
                watch_peer_close(stream.try_clone()?, stop_tx.clone());
                spawn_writer(Sink::Tcp(stream), queue_rx, stop_rx, label)
            }
            StreamKind::TcpPassive => {
                let listener = TcpListener::bind(resolve(local_ip, local_port)?)?;
                listener.set_nonblocking(true)?;
                tracing::info!(local = ?listener.local_addr().ok(), "media over TCP (passive), waiting for platform");
                thread::spawn(move || {
                    let Some(stream) = accept_one(&listener, &stop_rx) else {
                        return;
                    };
                    run_writer(Sink::Tcp(stream), queue_rx, stop_rx, &label);
                })
            }
            StreamKind::LocalFile(path) => {
                let file = File::create(path)?;
                tracing::info!(path = %path.display(), "media to local file");
                spawn_writer(Sink::File(file), queue_rx, stop_rx, label)
            }
        };

        Ok(Self {
            kind,
            queue: Some(queue_tx),
            stop: stop_tx,
            writer: Some(writer),
        })
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    /// Enqueue one packet, blocking while the queue is full.
    pub fn send(&self, packet: Vec<u8>) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(SimError::QueueClosed)?;
        queue.send(packet).map_err(|_| SimError::QueueClosed)
    }

    /// Whether the writer thread has already stopped.
    pub fn is_finished(&self) -> bool {
        self.writer.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Stop the writer and wait until it has released the sink.
    pub fn exit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        self.queue.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("media writer thread panicked");
            }
            tracing::debug!(kind = ?self.kind, "media transport closed");
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        SimError::Io(std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("cannot resolve {host}:{port}"),
        ))
    })
}

fn spawn_writer(
    sink: Sink,
    queue: Receiver<Vec<u8>>,
    stop: Receiver<()>,
    label: String,
) -> JoinHandle<()> {
    thread::spawn(move || run_writer(sink, queue, stop, &label))
}

/// Accept exactly one connection, polling so a stop request or the
/// inactivity window can end the wait.
fn accept_one(listener: &TcpListener, stop: &Receiver<()>) -> Option<TcpStream> {
    let deadline = Instant::now() + INACTIVITY_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "platform connected for media");
                return stream.set_nonblocking(false).ok().map(|_| stream);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if stop.try_recv().is_ok() {
                    tracing::debug!("stop requested before platform connected");
                    return None;
                }
                if Instant::now() >= deadline {
                    tracing::warn!("no platform connection for media, giving up");
                    return None;
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "media accept failed");
                return None;
            }
        }
    }
}

/// The platform never sends on the media connection; any read result means
/// it went away, so ask the writer to stop.
fn watch_peer_close(mut stream: TcpStream, stop: Sender<()>) {
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => tracing::trace!(bytes = n, "unexpected data on media connection"),
            }
        }
        tracing::debug!("media peer closed");
        let _ = stop.try_send(());
    });
}

fn run_writer(mut sink: Sink, queue: Receiver<Vec<u8>>, stop: Receiver<()>, label: &str) {
    let mut sent: u64 = 0;
    let reason = loop {
        let next: std::result::Result<Vec<u8>, &'static str> = select! {
            recv(queue) -> packet => packet.map_err(|_| "producer closed"),
            recv(stop) -> _ => Err("stop requested"),
            default(INACTIVITY_TIMEOUT) => Err("no packets within inactivity window"),
        };
        match next {
            Ok(packet) => {
                if let Err(e) = sink.write_packet(&packet) {
                    tracing::warn!(kind = label, error = %e, "media write failed");
                    break "write error";
                }
                sent += 1;
                if sent % 6000 == 0 {
                    tracing::debug!(kind = label, sent, "media packets sent");
                }
            }
            Err("stop requested") => {
                // flush what the producer already queued
                for packet in queue.try_iter() {
                    if sink.write_packet(&packet).is_err() {
                        break;
                    }
                    sent += 1;
                }
                break "stop requested";
            }
            Err(reason) => break reason,
        }
    };
    drop(queue);
    sink.close();
    tracing::info!(kind = label, sent, reason, "media writer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_per_kind() {
        assert_eq!(StreamKind::Udp.framing(), Framing::Udp);
        assert_eq!(StreamKind::TcpActive.framing(), Framing::Interleaved);
        assert_eq!(StreamKind::TcpPassive.framing(), Framing::Interleaved);
        assert_eq!(StreamKind::LocalFile("x".into()).framing(), Framing::Raw);
    }

    #[test]
    fn udp_delivers_in_order() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let transport =
            StreamTransport::open(StreamKind::Udp, "127.0.0.1", "127.0.0.1", 0, port).unwrap();
        for i in 0..10u8 {
            transport.send(vec![i; 4]).unwrap();
        }

        let mut buf = [0u8; 16];
        for i in 0..10u8 {
            let n = receiver.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[i; 4]);
        }
        transport.exit();
    }

    #[test]
    fn tcp_active_peer_close_stops_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport =
            StreamTransport::open(StreamKind::TcpActive, "127.0.0.1", "127.0.0.1", 0, port)
                .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        transport.send(vec![0, 2, 7, 7]).unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 2, 7, 7]);

        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(3);
        while !transport.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(transport.is_finished());
        assert!(transport.send(vec![1]).is_err());
    }

    #[test]
    fn tcp_passive_accepts_platform() {
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let transport =
            StreamTransport::open(StreamKind::TcpPassive, "127.0.0.1", "127.0.0.1", port, 0)
                .unwrap();
        let mut platform = TcpStream::connect(("127.0.0.1", port)).unwrap();
        platform.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        transport.send(vec![5, 6, 7]).unwrap();
        let mut buf = [0u8; 3];
        platform.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [5, 6, 7]);
        transport.exit();
    }

    #[test]
    fn local_file_sink() {
        let path = std::env::temp_dir().join(format!("gbsim-sink-{}.ps", std::process::id()));
        let transport = StreamTransport::open(
            StreamKind::LocalFile(path.clone()),
            "127.0.0.1",
            "127.0.0.1",
            0,
            0,
        )
        .unwrap();
        transport.send(vec![1, 2]).unwrap();
        transport.send(vec![3]).unwrap();
        transport.exit();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn tcp_active_connect_failure_is_reported() {
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);
        assert!(
            StreamTransport::open(StreamKind::TcpActive, "127.0.0.1", "127.0.0.1", 0, port)
                .is_err()
        );
    }
}
