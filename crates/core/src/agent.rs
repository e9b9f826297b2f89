use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::catalog::{self, Query};
use crate::error::Result;
use crate::protocol::message::{USER_AGENT, generate_branch, generate_call_id, generate_tag};
use crate::protocol::{CONTENT_TYPE_MANSCDP, SipMessage, SipRequest, SipResponse};
use crate::session::SessionController;
use crate::transport::{BatchPolicy, SignalingProtocol, SipEndpoint, SipTransport};

const DISPATCH_POLL: Duration = Duration::from_secs(1);

/// Device-level configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Platform signaling address, `host:port`.
    pub server_addr: String,
    pub protocol: SignalingProtocol,
    /// 20-digit GB28181 id of this device.
    pub device_id: String,
    /// 20-digit GB28181 id of the platform.
    pub server_id: String,
    /// SIP domain, usually the first 10 digits of the platform id.
    pub realm: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    /// Channel ids reported in catalog responses.
    pub channels: Vec<String>,
    pub keepalive_interval: Duration,
    /// `Expires` of the REGISTER, in seconds.
    pub register_expires: u32,
    /// PS file replayed to every call.
    pub media_file: PathBuf,
    /// When set, media is written here instead of sent to the platform.
    pub record_to: Option<PathBuf>,
    pub batch: BatchPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5060".to_string(),
            protocol: SignalingProtocol::Udp,
            device_id: "34020000001320000001".to_string(),
            server_id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            device_name: "gbsim".to_string(),
            manufacturer: "gbsim".to_string(),
            model: "simulator".to_string(),
            channels: vec!["34020000001310000001".to_string()],
            keepalive_interval: Duration::from_secs(60),
            register_expires: 3600,
            media_file: PathBuf::from("test.dat"),
            record_to: None,
            batch: BatchPolicy::default(),
        }
    }
}

impl DeviceConfig {
    fn device_uri(&self) -> String {
        format!("sip:{}@{}", self.device_id, self.realm)
    }

    fn server_uri(&self) -> String {
        format!("sip:{}@{}", self.server_id, self.realm)
    }
}

/// Builds device-originated requests with a shared CSeq counter.
#[derive(Debug, Clone)]
struct RequestFactory {
    config: Arc<DeviceConfig>,
    local_addr: SocketAddr,
    protocol: SignalingProtocol,
    cseq: Arc<AtomicU32>,
}

impl RequestFactory {
    fn request(&self, method: &str, uri: &str, to: &str) -> SipRequest {
        let transport = match self.protocol {
            SignalingProtocol::Tcp => "TCP",
            SignalingProtocol::Udp => "UDP",
        };
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst);
        SipRequest::new(method, uri)
            .add_header(
                "Via",
                &format!("SIP/2.0/{transport} {};rport;branch={}", self.local_addr, generate_branch()),
            )
            .add_header("From", &format!("<{}>;tag={}", self.config.device_uri(), generate_tag()))
            .add_header("To", &format!("<{to}>"))
            .add_header("Call-ID", &generate_call_id())
            .add_header("CSeq", &format!("{cseq} {method}"))
            .add_header("Max-Forwards", "70")
            .add_header("User-Agent", USER_AGENT)
    }

    fn register(&self) -> SipMessage {
        let contact = format!("<sip:{}@{}>", self.config.device_id, self.local_addr);
        self.request("REGISTER", &format!("sip:{}", self.config.realm), &self.config.device_uri())
            .add_header("Contact", &contact)
            .add_header("Expires", &self.config.register_expires.to_string())
            .into()
    }

    fn manscdp(&self, body: String) -> SipMessage {
        let server_uri = self.config.server_uri();
        self.request("MESSAGE", &server_uri, &server_uri)
            .with_body(CONTENT_TYPE_MANSCDP, body)
            .into()
    }

    fn keepalive(&self, sn: u32) -> SipMessage {
        self.manscdp(catalog::keepalive_notify(&self.config.device_id, sn))
    }
}

/// The simulated device.
///
/// Registers with the platform, keeps the registration alive and routes
/// everything the platform sends:
///
/// | Inbound | Handled by |
/// |---------|------------|
/// | INVITE, BYE | [`SessionController`] |
/// | ACK | [`SessionController::confirm`], media then runs on a fresh thread |
/// | MESSAGE | 200 OK, plus a catalog response for catalog queries |
/// | responses | logged |
pub struct DeviceAgent {
    config: Arc<DeviceConfig>,
    endpoint: SipEndpoint,
    session: Arc<SessionController>,
    requests: RequestFactory,
    running: AtomicBool,
}

impl DeviceAgent {
    /// Open the signaling transport described by `config`.
    pub fn connect(config: DeviceConfig) -> Result<Self> {
        let endpoint = SipTransport::open(&config.server_addr, config.protocol, config.batch.clone())?;
        Ok(Self::new(config, endpoint))
    }

    pub fn new(config: DeviceConfig, endpoint: SipEndpoint) -> Self {
        let config = Arc::new(config);
        let local_addr = endpoint.local_addr();
        let session = Arc::new(SessionController::new(
            config.clone(),
            &local_addr.ip().to_string(),
            endpoint.outbound.clone(),
        ));
        let requests = RequestFactory {
            config: config.clone(),
            local_addr,
            protocol: endpoint.protocol(),
            cseq: Arc::new(AtomicU32::new(1)),
        };
        Self {
            config,
            endpoint,
            session,
            requests,
            running: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Register, start keepalives and dispatch inbound messages until the
    /// signaling transport goes away or [`stop`](Self::stop) is called.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.send(self.requests.register());

        let (keepalive_stop, stop_rx) = bounded::<()>(1);
        let keepalive = {
            let requests = self.requests.clone();
            let outbound = self.endpoint.outbound.clone();
            let interval = self.config.keepalive_interval;
            thread::spawn(move || keepalive_loop(requests, outbound, interval, stop_rx))
        };

        tracing::info!(device_id = %self.config.device_id, local = %self.local_addr(), "device agent running");
        while self.running.load(Ordering::SeqCst) {
            match self.endpoint.inbound.recv_timeout(DISPATCH_POLL) {
                Ok(msg) => self.dispatch(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("signaling transport closed");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.session.stop_stream();
        drop(keepalive_stop);
        if keepalive.join().is_err() {
            tracing::error!("keepalive thread panicked");
        }
        self.endpoint.close();
        Ok(())
    }

    /// Ask [`run`](Self::run) to return.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Route one inbound message.
    pub fn dispatch(&self, msg: SipMessage) {
        if msg.is_response() {
            self.on_response(&msg);
            return;
        }
        match msg.method() {
            "INVITE" => self.session.handle_invite(&msg),
            "ACK" => {
                if let Some(task) = self.session.confirm(&msg) {
                    thread::spawn(move || task.run());
                }
            }
            "BYE" => self.session.handle_bye(&msg),
            "MESSAGE" => self.on_message(&msg),
            method => {
                tracing::debug!(method, call_id = msg.call_id(), "unsupported request ignored");
            }
        }
    }

    fn on_response(&self, msg: &SipMessage) {
        let status = msg.status().unwrap_or_default();
        match (msg.method(), status) {
            ("REGISTER", 200) => tracing::info!(server_id = %self.config.server_id, "registered"),
            ("REGISTER", 401) => tracing::warn!("platform requires authentication, not supported"),
            ("REGISTER", _) => tracing::warn!(status, "registration rejected"),
            (method, status) => tracing::debug!(method, status, call_id = msg.call_id(), "response"),
        }
    }

    fn on_message(&self, msg: &SipMessage) {
        self.send(SipResponse::for_request(msg, 200, &generate_tag()).into());

        let Some(query) = Query::parse(msg.body()) else {
            return;
        };
        tracing::debug!(cmd_type = %query.cmd_type, sn = query.sn, "MANSCDP query");
        if query.is_catalog() {
            let body = catalog::catalog_response(&self.config, query.sn);
            self.send(self.requests.manscdp(body));
            tracing::info!(sn = query.sn, channels = self.config.channels.len(), "catalog sent");
        }
    }

    fn send(&self, msg: SipMessage) {
        if self.endpoint.outbound.send(msg).is_err() {
            tracing::warn!("signaling transport closed, message dropped");
        }
    }
}

fn keepalive_loop(
    requests: RequestFactory,
    outbound: Sender<SipMessage>,
    interval: Duration,
    stop: Receiver<()>,
) {
    let mut sn = 1u32;
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if outbound.send(requests.keepalive(sn)).is_err() {
            break;
        }
        tracing::debug!(sn, "keepalive sent");
        sn = sn.wrapping_add(1);
    }
    tracing::debug!("keepalive loop exited");
}
