//! Shared helpers: boot a real reflector on a free port and drive it with a
//! minimal protocol client over plain TCP and UDP sockets.

#![allow(dead_code)]

use std::time::Duration;

use reflector::auth;
use reflector::messages::{ControlMessage, FrameDecoder, ProtoVer};
use reflector::udp::{UdpHeader, UdpMessage};
use reflector::{Config, ReflectorServer};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub const V2: ProtoVer = ProtoVer::new(2, 0);
pub const V1: ProtoVer = ProtoVer::new(1, 4);

/// Test users known to every server started through [`start_server`].
pub const USERS: [(&str, &str); 4] = [
    ("SM0ABC", "alpha-key"),
    ("LA1XYZ", "bravo-key"),
    ("OH2BH", "charlie-key"),
    ("DL1QRP", "delta-key"),
];

pub fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.bind_host = "127.0.0.1".to_string();
    for (callsign, key) in USERS {
        cfg.users.insert(callsign.to_string(), key.to_string());
    }
    cfg
}

pub struct TestServer {
    pub port: u16,
    pub http_port: Option<u16>,
}

pub async fn start_server(cfg: Config) -> TestServer {
    start_server_with_http(cfg, false).await
}

pub async fn start_server_with_http(mut cfg: Config, http: bool) -> TestServer {
    let port = free_port().await;
    cfg.listen_port = port;
    let http_port = if http {
        let http_port = free_port().await;
        cfg.http_srv_port = Some(http_port);
        Some(http_port)
    } else {
        None
    };
    let server = ReflectorServer::new(cfg);
    tokio::spawn(async move {
        if let Err(err) = server.serve().await {
            panic!("server failed to start: {err}");
        }
    });
    sleep(Duration::from_millis(100)).await;
    TestServer { port, http_port }
}

/// Find a port where both TCP and UDP are available, since the reflector
/// binds the same number on both transports.
async fn free_port() -> u16 {
    loop {
        let port = 20000 + (rand::random::<u16>() % 30000);
        let tcp = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
        let udp = UdpSocket::bind(("127.0.0.1", port)).await;
        if tcp.is_ok() && udp.is_ok() {
            return port;
        }
    }
}

/// A connection that has consumed the server greeting but not authenticated.
pub struct RawConn {
    pub stream: TcpStream,
    decoder: FrameDecoder,
    pub server_version: ProtoVer,
    pub nonce: Vec<u8>,
    server_port: u16,
}

/// Connect and consume the `ProtoVer` + `AuthChallenge` greeting.
pub async fn open_conn(port: u16) -> RawConn {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("tcp connect");
    let mut decoder = FrameDecoder::new();
    let server_version = match recv_on(&mut decoder, &mut stream).await {
        ControlMessage::ProtoVer(ver) => ver,
        other => panic!("expected ProtoVer greeting, got {other:?}"),
    };
    let nonce = match recv_on(&mut decoder, &mut stream).await {
        ControlMessage::AuthChallenge { nonce } => nonce,
        other => panic!("expected AuthChallenge, got {other:?}"),
    };
    RawConn {
        stream,
        decoder,
        server_version,
        nonce,
        server_port: port,
    }
}

impl RawConn {
    pub async fn send(&mut self, msg: &ControlMessage) {
        send_on(&mut self.stream, msg).await;
    }

    /// Next non-heartbeat control message.
    pub async fn recv(&mut self) -> ControlMessage {
        recv_on(&mut self.decoder, &mut self.stream).await
    }

    /// Complete the handshake and authentication.
    pub async fn authenticate(mut self, callsign: &str, key: &str, ver: ProtoVer) -> TestClient {
        self.send(&ControlMessage::ProtoVer(ver)).await;
        let digest = auth::response_digest(key, &self.nonce);
        self.send(&ControlMessage::AuthResponse {
            callsign: callsign.to_string(),
            digest,
        })
        .await;
        match self.recv().await {
            ControlMessage::AuthOk => {}
            other => panic!("expected AuthOk, got {other:?}"),
        }
        let client_id = match self.recv().await {
            ControlMessage::ServerInfo { client_id, .. } => client_id,
            other => panic!("expected ServerInfo, got {other:?}"),
        };
        TestClient {
            stream: self.stream,
            decoder: self.decoder,
            callsign: callsign.to_string(),
            client_id,
            server_port: self.server_port,
            udp: None,
            udp_seq: 0,
        }
    }

    /// Wait for the server to drop the TCP connection, tolerating any frames
    /// (e.g. a final `Error`) queued before the close.
    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("connection was not closed in time");
            match timeout(remaining, self.decoder.read_next(&mut self.stream)).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Err(_) => panic!("connection was not closed in time"),
            }
        }
    }
}

/// An authenticated client, optionally with an open UDP flow.
pub struct TestClient {
    pub stream: TcpStream,
    decoder: FrameDecoder,
    pub callsign: String,
    pub client_id: u32,
    server_port: u16,
    pub udp: Option<UdpSocket>,
    udp_seq: u16,
}

/// Connect, handshake and authenticate in one step.
pub async fn connect_client(port: u16, callsign: &str, key: &str, ver: ProtoVer) -> TestClient {
    open_conn(port).await.authenticate(callsign, key, ver).await
}

impl TestClient {
    pub async fn send(&mut self, msg: &ControlMessage) {
        send_on(&mut self.stream, msg).await;
    }

    /// Next non-heartbeat control message.
    pub async fn recv(&mut self) -> ControlMessage {
        recv_on(&mut self.decoder, &mut self.stream).await
    }

    /// Assert that no non-heartbeat control message arrives within `dur`.
    pub async fn expect_no_frame(&mut self, dur: Duration) {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return;
            };
            match timeout(remaining, self.decoder.read_next(&mut self.stream)).await {
                Err(_) => return,
                Ok(frame) => {
                    let frame = frame.expect("read").expect("unexpected close");
                    let msg = ControlMessage::decode(&frame).expect("decode");
                    if msg != ControlMessage::Heartbeat {
                        panic!("unexpected control message: {msg:?}");
                    }
                }
            }
        }
    }

    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("connection was not closed in time");
            match timeout(remaining, self.decoder.read_next(&mut self.stream)).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Err(_) => panic!("connection was not closed in time"),
            }
        }
    }

    /// Open the UDP flow: bind a local socket, latch the port with a
    /// heartbeat and consume the server's confirmation heartbeat.
    pub async fn open_udp(&mut self) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.expect("udp bind");
        self.udp = Some(socket);
        self.send_udp(&UdpMessage::Heartbeat).await;
        match self.recv_udp().await {
            (_, UdpMessage::Heartbeat) => {}
            (_, other) => panic!("expected confirmation heartbeat, got {other:?}"),
        }
    }

    /// Send a datagram with the next outbound sequence number.
    pub async fn send_udp(&mut self, msg: &UdpMessage) {
        let seq = self.udp_seq;
        self.udp_seq = self.udp_seq.wrapping_add(1);
        self.send_udp_seq(seq, msg).await;
    }

    /// Send a datagram with an explicit sequence number (the internal counter
    /// continues from it).
    pub async fn send_udp_seq(&mut self, seq: u16, msg: &UdpMessage) {
        self.udp_seq = seq.wrapping_add(1);
        let header = UdpHeader {
            client_id: self.client_id,
            sequence: seq,
        };
        let wire = msg.encode(header);
        self.udp
            .as_ref()
            .expect("udp flow not open")
            .send_to(&wire, ("127.0.0.1", self.server_port))
            .await
            .expect("udp send");
    }

    pub async fn audio(&mut self, tg: u32, payload: &[u8]) {
        self.send_udp(&UdpMessage::Audio {
            tg,
            payload: bytes::Bytes::copy_from_slice(payload),
        })
        .await;
    }

    /// Next datagram of any type.
    pub async fn recv_udp(&mut self) -> (UdpHeader, UdpMessage) {
        let socket = self.udp.as_ref().expect("udp flow not open");
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("udp recv");
        UdpMessage::decode(&buf[..len]).expect("datagram decode")
    }

    /// Next non-heartbeat datagram.
    pub async fn recv_udp_msg(&mut self) -> UdpMessage {
        loop {
            let (_, msg) = self.recv_udp().await;
            if msg != UdpMessage::Heartbeat {
                return msg;
            }
        }
    }

    /// Assert that no non-heartbeat datagram arrives within `dur`.
    pub async fn expect_no_udp(&mut self, dur: Duration) {
        let socket = self.udp.as_ref().expect("udp flow not open");
        let deadline = tokio::time::Instant::now() + dur;
        let mut buf = [0u8; 2048];
        loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return;
            };
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => return,
                Ok(received) => {
                    let (len, _) = received.expect("udp recv");
                    let (_, msg) = UdpMessage::decode(&buf[..len]).expect("datagram decode");
                    if msg != UdpMessage::Heartbeat {
                        panic!("unexpected datagram: {msg:?}");
                    }
                }
            }
        }
    }
}

async fn send_on(stream: &mut TcpStream, msg: &ControlMessage) {
    use tokio::io::AsyncWriteExt;
    stream
        .write_all(&msg.encode_frame())
        .await
        .expect("tcp send");
}

/// Read control messages, skipping heartbeats, until one arrives.
async fn recv_on(decoder: &mut FrameDecoder, stream: &mut TcpStream) -> ControlMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, decoder.read_next(stream))
            .await
            .expect("timed out waiting for control message")
            .expect("tcp read")
            .expect("connection closed unexpectedly");
        let msg = ControlMessage::decode(&frame).expect("frame decode");
        if msg != ControlMessage::Heartbeat {
            return msg;
        }
    }
}
