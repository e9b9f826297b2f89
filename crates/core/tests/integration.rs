//! Integration tests: a fake platform drives the device over loopback.
//!
//! Signaling runs over UDP sockets, media is received on UDP or TCP
//! listeners, and the media source is a small synthetic PS file.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use gbsim::media::rtp::{RTP_HEADER_LENGTH, RtpFields};
use gbsim::protocol::sdp::SessionDescription;
use gbsim::protocol::{CONTENT_TYPE_MANSCDP, CONTENT_TYPE_SDP, SipMessage, SipRequest};
use gbsim::transport::SignalingProtocol;
use gbsim::{DeviceAgent, DeviceConfig, SessionController, SessionState};

const TIMEOUT: Duration = Duration::from_secs(3);

/// Three pack-delimited frames, the first large enough to fragment.
fn media_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gbsim-{name}-{}.ps", std::process::id()));
    let mut data = Vec::new();
    for (i, len) in [4000usize, 200, 200].into_iter().enumerate() {
        data.extend_from_slice(&[0, 0, 1, 0xBA]);
        data.extend(std::iter::repeat_n(i as u8 + 1, len));
    }
    std::fs::write(&path, data).unwrap();
    path
}

fn offer(port: u16, proto: &str, setup: Option<&str>, ssrc: u32) -> String {
    let mut sdp = format!(
        "v=0\r\no=34020000002000000001 0 0 IN IP4 127.0.0.1\r\ns=Play\r\nc=IN IP4 127.0.0.1\r\n\
         t=0 0\r\nm=video {port} {proto} 96\r\na=recvonly\r\na=rtpmap:96 PS/90000\r\n"
    );
    if let Some(setup) = setup {
        sdp.push_str(&format!("a=setup:{setup}\r\n"));
    }
    sdp.push_str(&format!("y={ssrc:010}\r\n"));
    sdp
}

fn talk_offer(port: u16, ssrc: u32) -> String {
    format!(
        "v=0\r\no=34020000002000000001 0 0 IN IP4 127.0.0.1\r\ns=Talk\r\nc=IN IP4 127.0.0.1\r\n\
         t=0 0\r\nm=audio {port} TCP/RTP/AVP 8\r\na=sendrecv\r\na=setup:passive\r\ny={ssrc:010}\r\n"
    )
}

fn request(method: &str, call_id: &str, cseq: u32) -> SipRequest {
    SipRequest::new(method, "sip:34020000001320000001@3402000000")
        .add_header("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKplatform")
        .add_header("From", "<sip:34020000002000000001@3402000000>;tag=platform1")
        .add_header("To", "<sip:34020000001320000001@3402000000>")
        .add_header("Call-ID", call_id)
        .add_header("CSeq", &format!("{cseq} {method}"))
}

fn controller(media: PathBuf) -> (Arc<SessionController>, Receiver<SipMessage>) {
    let config = DeviceConfig {
        media_file: media,
        ..DeviceConfig::default()
    };
    let (tx, rx) = unbounded();
    (Arc::new(SessionController::new(Arc::new(config), "127.0.0.1", tx)), rx)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

struct Platform {
    socket: UdpSocket,
    device: Option<SocketAddr>,
}

impl Platform {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self { socket, device: None }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn recv(&mut self) -> SipMessage {
        let mut buf = vec![0u8; 15000];
        let (n, from) = self.socket.recv_from(&mut buf).expect("message from device");
        self.device = Some(from);
        SipMessage::parse(&buf[..n]).unwrap()
    }

    /// Next message that is not a keepalive.
    fn recv_skipping_keepalive(&mut self) -> SipMessage {
        loop {
            let msg = self.recv();
            if !String::from_utf8_lossy(msg.body()).contains("<CmdType>Keepalive</CmdType>") {
                return msg;
            }
        }
    }

    fn send(&self, msg: impl Into<SipMessage>) {
        let device = self.device.expect("device address known");
        self.socket.send_to(&msg.into().serialize(), device).unwrap();
    }
}

fn start_agent(platform: &Platform, media: PathBuf) -> (Arc<DeviceAgent>, thread::JoinHandle<()>) {
    let config = DeviceConfig {
        server_addr: platform.addr().to_string(),
        protocol: SignalingProtocol::Udp,
        media_file: media,
        register_expires: 600,
        ..DeviceConfig::default()
    };
    let agent = Arc::new(DeviceAgent::connect(config).expect("agent connects"));
    let runner = agent.clone();
    let handle = thread::spawn(move || runner.run().unwrap());
    (agent, handle)
}

#[test]
fn register_invite_ack_bye_over_udp() {
    let media = media_file("udp-call");
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(TIMEOUT)).unwrap();
    let media_port = receiver.local_addr().unwrap().port();

    let mut platform = Platform::bind();
    let (agent, handle) = start_agent(&platform, media.clone());

    let register = platform.recv();
    assert_eq!(register.method(), "REGISTER");
    assert_eq!(register.headers().get("Expires"), Some("600"));
    assert_eq!(register.headers().get("User-Agent"), Some("Embedded Net DVR/NVR/DVS"));
    platform.send(
        gbsim::protocol::SipResponse::for_request(&register, 200, "srv").add_header("Expires", "600"),
    );

    platform.send(request("INVITE", "call-udp", 1).with_body(CONTENT_TYPE_SDP, offer(media_port, "RTP/AVP", None, 777)));
    let ok = platform.recv_skipping_keepalive();
    assert_eq!(ok.status(), Some(200));
    assert_eq!(ok.call_id(), "call-udp");
    let answer = SessionDescription::parse(ok.body()).unwrap();
    assert_eq!(answer.ssrc(), 777);
    assert_eq!(answer.media("video").unwrap().proto, "TCP/RTP/AVP");
    assert_eq!(agent.session().state(), SessionState::Negotiated);

    platform.send(request("ACK", "call-udp", 1));

    let mut buf = vec![0u8; 2048];
    let n = receiver.recv(&mut buf).expect("first media packet");
    let first = RtpFields::read(&buf[..n]).unwrap();
    assert_eq!(first.pt, 96);
    assert_eq!(first.ssrc, 777);
    assert_eq!(first.sequence, 1);
    assert_eq!(&buf[RTP_HEADER_LENGTH..RTP_HEADER_LENGTH + 4], &[0, 0, 1, 0xBA]);
    assert!(wait_for(|| agent.session().state() == SessionState::Confirmed));

    platform.send(request("BYE", "call-udp", 2));
    let bye_ok = platform.recv_skipping_keepalive();
    assert_eq!(bye_ok.status(), Some(200));
    assert_eq!(bye_ok.cseq(), Some((2, "BYE")));
    assert_eq!(bye_ok.to_tag(), ok.to_tag());
    assert_eq!(agent.session().state(), SessionState::Idle);
    assert!(wait_for(|| !agent.session().is_streaming()));

    // the writer is gone, so the receiver drains and then times out
    receiver.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while receiver.recv(&mut buf).is_ok() {
        assert!(Instant::now() < deadline, "media kept flowing after BYE");
    }

    agent.stop();
    handle.join().unwrap();
    let _ = std::fs::remove_file(media);
}

#[test]
fn catalog_query_is_answered() {
    let mut platform = Platform::bind();
    let (agent, handle) = start_agent(&platform, media_file("catalog"));
    assert_eq!(platform.recv().method(), "REGISTER");

    let query = "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>99</SN>\r\n\
                 <DeviceID>34020000001320000001</DeviceID>\r\n</Query>\r\n";
    platform.send(request("MESSAGE", "q-1", 5).with_body(CONTENT_TYPE_MANSCDP, query));

    let ok = platform.recv_skipping_keepalive();
    assert_eq!(ok.status(), Some(200));
    assert_eq!(ok.call_id(), "q-1");

    let response = platform.recv_skipping_keepalive();
    assert_eq!(response.method(), "MESSAGE");
    assert_eq!(response.content_type(), Some(CONTENT_TYPE_MANSCDP));
    let body = String::from_utf8_lossy(response.body());
    assert!(body.contains("<CmdType>Catalog</CmdType>"));
    assert!(body.contains("<SN>99</SN>"));
    assert!(body.contains("<DeviceID>34020000001310000001</DeviceID>"));

    agent.stop();
    handle.join().unwrap();
}

#[test]
fn tcp_active_media_is_length_prefixed() {
    let media = media_file("tcp-active");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (session, replies) = controller(media.clone());

    let invite: SipMessage = request("INVITE", "call-tcp", 1)
        .with_body(CONTENT_TYPE_SDP, offer(port, "TCP/RTP/AVP", Some("passive"), 42))
        .into();
    session.handle_invite(&invite);
    assert_eq!(replies.try_recv().unwrap().status(), Some(200));

    let streamer = {
        let session = session.clone();
        let ack: SipMessage = request("ACK", "call-tcp", 1).into();
        thread::spawn(move || session.handle_ack(&ack))
    };

    let (mut conn, _) = listener.accept().unwrap();
    conn.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut expected_seq = 1u16;
    for _ in 0..4 {
        let mut len = [0u8; 2];
        conn.read_exact(&mut len).unwrap();
        let mut packet = vec![0u8; u16::from_be_bytes(len) as usize];
        conn.read_exact(&mut packet).unwrap();
        let rtp = RtpFields::read(&packet).unwrap();
        assert_eq!(rtp.ssrc, 42);
        assert_eq!(rtp.sequence, expected_seq);
        expected_seq += 1;
    }

    session.handle_bye(&request("BYE", "call-tcp", 2).into());
    assert_eq!(replies.try_recv().unwrap().status(), Some(200));
    streamer.join().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    let _ = std::fs::remove_file(media);
}

#[test]
fn unrelated_bye_does_not_stop_running_stream() {
    let media = media_file("unrelated-bye");
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = receiver.local_addr().unwrap().port();
    let (session, replies) = controller(media.clone());

    session.handle_invite(
        &request("INVITE", "call-a", 1)
            .with_body(CONTENT_TYPE_SDP, offer(port, "RTP/AVP", None, 1))
            .into(),
    );
    replies.try_recv().unwrap();
    let streamer = {
        let session = session.clone();
        let ack: SipMessage = request("ACK", "call-a", 1).into();
        thread::spawn(move || session.handle_ack(&ack))
    };
    let mut buf = vec![0u8; 2048];
    receiver.recv(&mut buf).expect("media flowing");

    session.handle_bye(&request("BYE", "call-b", 2).into());
    assert_eq!(replies.try_recv().unwrap().status(), Some(481));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.is_streaming());
    receiver.recv(&mut buf).expect("media still flowing");

    session.stop_stream();
    streamer.join().unwrap();
    assert!(!session.is_streaming());
    session.stop_stream();
    let _ = std::fs::remove_file(media);
}

#[test]
fn record_to_file_writes_raw_ps() {
    let media = media_file("record-src");
    let out = std::env::temp_dir().join(format!("gbsim-record-out-{}.ps", std::process::id()));
    let config = DeviceConfig {
        media_file: media.clone(),
        record_to: Some(out.clone()),
        ..DeviceConfig::default()
    };
    let (tx, replies) = unbounded();
    let session = Arc::new(SessionController::new(Arc::new(config), "127.0.0.1", tx));

    session.handle_invite(
        &request("INVITE", "call-rec", 1)
            .with_body(CONTENT_TYPE_SDP, offer(9, "RTP/AVP", None, 5))
            .into(),
    );
    replies.try_recv().unwrap();
    let streamer = {
        let session = session.clone();
        let ack: SipMessage = request("ACK", "call-rec", 1).into();
        thread::spawn(move || session.handle_ack(&ack))
    };
    assert!(wait_for(|| std::fs::metadata(&out).is_ok_and(|m| m.len() >= 4200)));

    session.handle_bye(&request("BYE", "call-rec", 2).into());
    streamer.join().unwrap();

    let written = std::fs::read(&out).unwrap();
    let source = std::fs::read(&media).unwrap();
    assert_eq!(&written[..4], &[0, 0, 1, 0xBA]);
    assert_eq!(&written[..4004], &source[..4004]);
    let _ = std::fs::remove_file(media);
    let _ = std::fs::remove_file(out);
}

#[test]
fn talk_ack_returns_while_hello_goes_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let media = media_file("talk");
    let (session, replies) = controller(media.clone());

    session.handle_invite(
        &request("INVITE", "call-talk", 1)
            .with_body(CONTENT_TYPE_SDP, talk_offer(port, 31))
            .into(),
    );
    assert_eq!(replies.try_recv().unwrap().status(), Some(200));

    let started = Instant::now();
    session.handle_ack(&request("ACK", "call-talk", 1).into());
    assert!(started.elapsed() < Duration::from_secs(1), "talk ACK blocked the caller");
    assert_eq!(session.state(), SessionState::Confirmed);

    let (mut conn, _) = listener.accept().unwrap();
    conn.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut len = [0u8; 2];
    conn.read_exact(&mut len).unwrap();
    assert_eq!(u16::from_be_bytes(len), 15);
    let mut packet = [0u8; 15];
    conn.read_exact(&mut packet).unwrap();
    let rtp = RtpFields::read(&packet).unwrap();
    assert!(rtp.marker);
    assert_eq!(rtp.ssrc, 31);
    assert_eq!(&packet[RTP_HEADER_LENGTH..], &[1, 2, 3]);

    session.handle_bye(&request("BYE", "call-talk", 2).into());
    assert_eq!(replies.try_recv().unwrap().status(), Some(200));
    assert!(wait_for(|| !session.is_streaming()));
    let _ = std::fs::remove_file(media);
}

#[test]
fn dispatched_ack_then_bye_always_finds_the_call() {
    let media = media_file("dispatch-race");
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let media_port = receiver.local_addr().unwrap().port();
    let mut platform = Platform::bind();
    let config = DeviceConfig {
        server_addr: platform.addr().to_string(),
        protocol: SignalingProtocol::Udp,
        media_file: media.clone(),
        ..DeviceConfig::default()
    };
    let agent = DeviceAgent::connect(config).unwrap();

    for round in 0..20u32 {
        let call_id = format!("race-{round}");
        agent.dispatch(
            request("INVITE", &call_id, 1)
                .with_body(CONTENT_TYPE_SDP, offer(media_port, "RTP/AVP", None, round))
                .into(),
        );
        assert_eq!(platform.recv().status(), Some(200));

        agent.dispatch(request("ACK", &call_id, 1).into());
        agent.dispatch(request("BYE", &call_id, 2).into());
        let reply = platform.recv();
        assert_eq!(reply.call_id(), call_id);
        assert_eq!(reply.status(), Some(200), "BYE in round {round}");
        assert_eq!(agent.session().state(), SessionState::Idle);
    }

    assert!(wait_for(|| !agent.session().is_streaming()));
    let _ = std::fs::remove_file(media);
}

#[test]
fn ack_and_bye_back_to_back_over_udp() {
    let media = media_file("udp-quick-bye");
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let media_port = receiver.local_addr().unwrap().port();

    let mut platform = Platform::bind();
    let (agent, handle) = start_agent(&platform, media.clone());
    assert_eq!(platform.recv().method(), "REGISTER");

    for round in 0..5u32 {
        let call_id = format!("quick-{round}");
        platform.send(
            request("INVITE", &call_id, 1)
                .with_body(CONTENT_TYPE_SDP, offer(media_port, "RTP/AVP", None, 100 + round)),
        );
        assert_eq!(platform.recv_skipping_keepalive().status(), Some(200));

        platform.send(request("ACK", &call_id, 1));
        platform.send(request("BYE", &call_id, 2));
        let bye_ok = platform.recv_skipping_keepalive();
        assert_eq!(bye_ok.call_id(), call_id);
        assert_eq!(bye_ok.status(), Some(200), "BYE in round {round}");
    }
    assert!(wait_for(|| !agent.session().is_streaming()));

    agent.stop();
    handle.join().unwrap();
    let _ = std::fs::remove_file(media);
}
