//! Call state machine (GB28181 live view and voice intercom).
//!
//! One controller serves the device's single media session:
//!
//! ```text
//! Idle       --INVITE (offer ok)-->   Negotiated   200 OK + SDP answer
//! Negotiated --ACK (leg matches)-->   Confirmed    media pipeline starts
//! (any)      --BYE-->                 Idle         200 if leg matches, else 481
//! ```
//!
//! The state lives in an `AtomicU8` moved with compare-exchange so that
//! concurrent handlers cannot both win a transition. [`Leg`] and
//! [`RemoteMediaInfo`] are written before the `Negotiated` state is
//! published and only read afterwards.
//!
//! [`SessionController::confirm`] moves the call to `Confirmed` and hands
//! back a [`MediaTask`]. Callers that must keep reading signaling run the
//! task on a thread of their own; [`SessionController::handle_ack`] runs
//! video inline.

pub mod media;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};

use crate::agent::DeviceConfig;
use crate::error::{Result, SimError};
use crate::media::{EncodeMode, FRAME_INTERVAL, MediaSource, PTS_STEP, Packetizer, PsPacketizer};
use crate::protocol::message::generate_tag;
use crate::protocol::sdp::{SessionDescription, build_answer};
use crate::protocol::{CONTENT_TYPE_SDP, SipMessage, SipResponse};
use crate::transport::{StreamKind, StreamTransport};
pub use media::{Leg, MediaTransport, RemoteMediaInfo, TcpRole};

/// How long a BYE waits for the streaming task to take the stop signal.
pub const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Local media ports are drawn from this range.
pub const LOCAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 10000..=65535;

const TALK_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    /// INVITE answered, waiting for ACK.
    Negotiated = 1,
    /// ACK received, media flowing.
    Confirmed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Negotiated,
            2 => SessionState::Confirmed,
            _ => SessionState::Idle,
        }
    }
}

/// Stop handle for the running media task, tagged with its call.
struct StopSignal {
    call_id: String,
    tx: Sender<()>,
}

fn stop_channel(call_id: &str) -> (StopSignal, Receiver<()>) {
    let (tx, rx) = bounded(1);
    let signal = StopSignal {
        call_id: call_id.to_string(),
        tx,
    };
    (signal, rx)
}

/// Media pipeline of a confirmed call, ready to run.
pub struct MediaTask {
    session: Arc<SessionController>,
    call_id: String,
    remote: RemoteMediaInfo,
    stop_rx: Receiver<()>,
}

impl MediaTask {
    pub fn is_talk(&self) -> bool {
        self.remote.talk
    }

    /// Stream until stopped. Blocks for the whole call.
    pub fn run(self) {
        self.session.run_pipeline(&self.call_id, &self.remote, &self.stop_rx);
    }
}

/// The device's call state machine.
///
/// Replies are pushed onto `replies`, normally the outbound queue of a
/// [`SipEndpoint`](crate::transport::SipEndpoint).
pub struct SessionController {
    config: Arc<DeviceConfig>,
    local_ip: String,
    replies: Sender<SipMessage>,
    state: AtomicU8,
    leg: RwLock<Option<Leg>>,
    remote: RwLock<Option<RemoteMediaInfo>>,
    stop: Mutex<Option<StopSignal>>,
}

impl SessionController {
    pub fn new(config: Arc<DeviceConfig>, local_ip: &str, replies: Sender<SipMessage>) -> Self {
        Self {
            config,
            local_ip: local_ip.to_string(),
            replies,
            state: AtomicU8::new(SessionState::Idle as u8),
            leg: RwLock::new(None),
            remote: RwLock::new(None),
            stop: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn leg(&self) -> Option<Leg> {
        self.leg.read().clone()
    }

    pub fn remote_media(&self) -> Option<RemoteMediaInfo> {
        self.remote.read().clone()
    }

    /// Whether a media task currently holds a stop handle.
    pub fn is_streaming(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Answer an INVITE. Ignored unless the session is idle.
    pub fn handle_invite(&self, msg: &SipMessage) {
        let call_id = msg.call_id();
        if self.state() != SessionState::Idle {
            tracing::debug!(call_id, state = ?self.state(), "INVITE ignored, session busy");
            return;
        }

        let offer = match SessionDescription::parse(msg.body()) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(call_id, error = %e, "INVITE with unusable SDP");
                return;
            }
        };
        let local_port = rand::random_range(LOCAL_PORT_RANGE);
        let Some(remote) = RemoteMediaInfo::from_offer(&offer, &self.local_ip, local_port) else {
            tracing::warn!(call_id, talk = offer.is_talk(), "INVITE offer has no matching media line");
            return;
        };
        let Some(from_tag) = msg.from_tag() else {
            tracing::warn!(call_id, "INVITE without From tag");
            return;
        };

        let leg = Leg {
            call_id: call_id.to_string(),
            from_tag: from_tag.to_string(),
            to_tag: msg.to_tag().map_or_else(generate_tag, str::to_string),
        };
        let answer = build_answer(&self.config.device_id, &self.local_ip, local_port, remote.ssrc);

        {
            let mut leg_slot = self.leg.write();
            let mut remote_slot = self.remote.write();
            if self
                .state
                .compare_exchange(
                    SessionState::Idle as u8,
                    SessionState::Negotiated as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                tracing::debug!(call_id, "INVITE lost the race for the session");
                return;
            }
            *leg_slot = Some(leg.clone());
            *remote_slot = Some(remote.clone());
        }

        tracing::info!(
            call_id,
            remote = %format!("{}:{}", remote.ip, remote.port),
            transport = ?remote.transport,
            ssrc = remote.ssrc,
            local_port,
            talk = remote.talk,
            "call negotiated"
        );

        let contact = format!("<sip:{}@{}>", self.config.device_id, self.local_ip);
        let reply = SipResponse::for_request(msg, 200, &leg.to_tag)
            .add_header("Contact", &contact)
            .with_body(CONTENT_TYPE_SDP, answer.to_string());
        self.send(reply.into());
    }

    /// Confirm the call without starting its media.
    ///
    /// Returns the pipeline to run, or `None` when the ACK does not apply.
    /// The `Confirmed` state and the stop handle are published together, so
    /// a BYE handled right after this returns always reaches the pipeline.
    pub fn confirm(self: &Arc<Self>, msg: &SipMessage) -> Option<MediaTask> {
        let call_id = msg.call_id();
        if self.state() != SessionState::Negotiated {
            tracing::debug!(call_id, state = ?self.state(), "ACK ignored, nothing to confirm");
            return None;
        }
        let matches = self.leg.read().as_ref().is_some_and(|leg| leg.matches(msg));
        if !matches {
            tracing::warn!(call_id, from_tag = ?msg.from_tag(), "ACK does not match the negotiated call");
            return None;
        }
        let Some(remote) = self.remote_media() else {
            tracing::error!(call_id, error = %SimError::NoRemoteMedia, "cannot confirm call");
            return None;
        };

        let mut stop = self.stop.lock();
        self.state
            .compare_exchange(
                SessionState::Negotiated as u8,
                SessionState::Confirmed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        let (signal, stop_rx) = stop_channel(call_id);
        *stop = Some(signal);
        drop(stop);

        tracing::info!(call_id, talk = remote.talk, "call confirmed");
        Some(MediaTask {
            session: Arc::clone(self),
            call_id: call_id.to_string(),
            remote,
            stop_rx,
        })
    }

    /// Confirm the call and run its media pipeline.
    ///
    /// Video streams on the calling thread until the call is stopped or the
    /// pipeline ends. Talk pipelines get a thread of their own.
    pub fn handle_ack(self: &Arc<Self>, msg: &SipMessage) {
        let Some(task) = self.confirm(msg) else {
            return;
        };
        if task.is_talk() {
            thread::spawn(move || task.run());
        } else {
            task.run();
        }
    }

    /// Tear the call down. Responses to our own BYEs are ignored.
    pub fn handle_bye(&self, msg: &SipMessage) {
        if msg.is_response() {
            return;
        }
        let call_id = msg.call_id();
        let leg = self.leg();
        let to_tag = leg.as_ref().map_or_else(generate_tag, |leg| leg.to_tag.clone());
        let matches = self.state() == SessionState::Confirmed && leg.is_some_and(|leg| leg.matches(msg));

        if !matches {
            tracing::warn!(call_id, state = ?self.state(), "BYE for unknown call");
            self.send(SipResponse::for_request(msg, 481, &to_tag).into());
            self.reset();
            return;
        }

        tracing::info!(call_id, "call terminated by platform");
        self.send(SipResponse::for_request(msg, 200, &to_tag).into());
        self.reset();
        self.stop_stream();
    }

    /// Signal the running media task to stop.
    ///
    /// No-op when nothing is streaming; safe to call repeatedly.
    pub fn stop_stream(&self) {
        let Some(signal) = self.stop.lock().take() else {
            return;
        };
        match signal.tx.send_timeout((), STOP_TIMEOUT) {
            Ok(()) => tracing::debug!(call_id = %signal.call_id, "stop signalled"),
            Err(_) => tracing::info!(call_id = %signal.call_id, "media task did not take the stop signal"),
        }
    }

    /// Back to `Idle`, forgetting the current call.
    fn reset(&self) {
        let mut leg = self.leg.write();
        let mut remote = self.remote.write();
        self.state.store(SessionState::Idle as u8, Ordering::Release);
        *leg = None;
        *remote = None;
    }

    fn release_stop(&self, call_id: &str) {
        let mut stop = self.stop.lock();
        if stop.as_ref().is_some_and(|s| s.call_id == call_id) {
            *stop = None;
        }
    }

    fn run_pipeline(&self, call_id: &str, remote: &RemoteMediaInfo, stop_rx: &Receiver<()>) {
        let result = if remote.talk {
            self.talk(remote, stop_rx)
        } else {
            self.stream_file(remote, stop_rx)
        };
        self.release_stop(call_id);

        match result {
            Ok(()) => tracing::info!(call_id, "media stopped"),
            Err(SimError::QueueClosed) => {
                tracing::info!(call_id, "media sink closed, stream ended");
            }
            Err(e) => {
                tracing::error!(call_id, error = %e, "media pipeline failed");
                let owns_call = self.leg.read().as_ref().is_some_and(|leg| leg.call_id == call_id);
                if owns_call {
                    self.reset();
                }
            }
        }
    }

    fn stream_kind(&self, remote: &RemoteMediaInfo) -> StreamKind {
        if let Some(path) = &self.config.record_to {
            return StreamKind::LocalFile(path.clone());
        }
        match (remote.transport, remote.tcp_role) {
            (MediaTransport::Udp, _) => StreamKind::Udp,
            (MediaTransport::Tcp, TcpRole::Active) => StreamKind::TcpActive,
            (MediaTransport::Tcp, TcpRole::Passive) => StreamKind::TcpPassive,
        }
    }

    fn open_transport(&self, remote: &RemoteMediaInfo) -> Result<StreamTransport> {
        StreamTransport::open(
            self.stream_kind(remote),
            &remote.local_ip,
            &remote.ip,
            remote.local_port,
            remote.port,
        )
    }

    /// Replay the media file until stopped or the sink goes away.
    fn stream_file(&self, remote: &RemoteMediaInfo, stop_rx: &Receiver<()>) -> Result<()> {
        let mut source = MediaSource::open(&self.config.media_file)?;
        if source.is_empty() {
            return Err(SimError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} is empty", self.config.media_file.display()),
            )));
        }
        let transport = self.open_transport(remote)?;
        let mut packetizer = PsPacketizer::new(remote.ssrc, transport.kind().framing(), EncodeMode::RawPs);

        let mut pts = 0u64;
        let result = loop {
            let Some(frame) = source.next_frame() else {
                break Ok(());
            };
            let sent = packetizer
                .packetize(frame, pts)
                .into_iter()
                .try_for_each(|packet| transport.send(packet));
            if let Err(e) = sent {
                break Err(e);
            }
            pts += PTS_STEP;

            match stop_rx.recv_timeout(FRAME_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
        };
        tracing::debug!(last_sequence = packetizer.last_sequence(), pts, "file replay finished");
        transport.exit();
        result
    }

    /// Voice intercom: announce ourselves with one hello packet, then hold
    /// the connection until stopped or the platform goes away.
    fn talk(&self, remote: &RemoteMediaInfo, stop_rx: &Receiver<()>) -> Result<()> {
        let transport = self.open_transport(remote)?;
        let mut packetizer = PsPacketizer::new(remote.ssrc, transport.kind().framing(), EncodeMode::RawPs);
        transport.send(packetizer.talk_hello())?;

        while !transport.is_finished() {
            match stop_rx.recv_timeout(TALK_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        transport.exit();
        Ok(())
    }

    fn send(&self, msg: SipMessage) {
        if self.replies.send(msg).is_err() {
            tracing::warn!("signaling transport closed, reply dropped");
        }
    }
}
