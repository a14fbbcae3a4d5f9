//! Reflector core: client table, session state machine, broadcasts and QSY.
//!
//! The core is owned by the server's single event loop task. Every handler
//! runs to completion before the next event is taken, so the client table and
//! the talkgroup registry never see interleaved mutation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth;
use crate::messages::{ControlMessage, ProtoVer, PROTOCOL_VERSION};
use crate::server::client::{Client, ConState, Filter};
use crate::server::config::Config;
use crate::server::conn::{self, Event};
use crate::server::status::{NodeStatus, ProtoVerStatus, StatusRequest, StatusSnapshot};
use crate::tg::{ClientId, TalkerChange, TgRegistry, NO_TG};
use crate::udp::UdpMessage;

/// Undecodable frames tolerated on one connection before it is dropped.
const MAX_DECODE_ERRORS: u32 = 5;

/// Rotating allocator over the random QSY talkgroup pool `[lo, hi]`.
#[derive(Debug)]
pub(crate) struct QsyPool {
    lo: u32,
    hi: u32,
    next: u32,
}

impl QsyPool {
    pub(crate) fn new(lo: u32, hi: u32) -> Self {
        // The cursor starts at the top so the first allocation wraps to `lo`.
        Self { lo, hi, next: hi }
    }

    /// Advance circularly from the cursor and pick the first talkgroup with
    /// no members. `None` when every talkgroup in the pool is occupied.
    pub(crate) fn allocate(&mut self, registry: &TgRegistry) -> Option<u32> {
        let size = self.hi - self.lo + 1;
        for _ in 0..size {
            self.next = if self.next < self.hi {
                self.next + 1
            } else {
                self.lo
            };
            if !registry.has_members(self.next) {
                return Some(self.next);
            }
        }
        None
    }
}

pub(crate) struct Core {
    cfg: Config,
    udp: Arc<UdpSocket>,
    events_tx: mpsc::UnboundedSender<Event>,
    pub(crate) registry: TgRegistry,
    pub(crate) clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
    qsy: Option<QsyPool>,
    reap_list: Vec<ClientId>,
}

impl Core {
    pub(crate) fn new(
        cfg: Config,
        udp: Arc<UdpSocket>,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let registry = TgRegistry::new(cfg.sql_timeout(), cfg.sql_timeout_blocktime());
        let qsy = cfg.random_qsy_pool().map(|(lo, hi)| QsyPool::new(lo, hi));
        Self {
            cfg,
            udp,
            events_tx,
            registry,
            clients: HashMap::new(),
            next_client_id: 1,
            qsy,
            reap_list: Vec::new(),
        }
    }

    pub(crate) fn udp_socket(&self) -> &UdpSocket {
        &self.udp
    }

    /// Register a freshly accepted connection and open the handshake.
    pub(crate) fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "client connected");
        let _ = stream.set_nodelay(true);
        let id = self.next_client_id;
        self.next_client_id += 1;

        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = conn::spawn_reader(id, read, self.events_tx.clone());
        // The writer lives until its sender is dropped at reap time; it needs
        // no handle.
        let _ = conn::spawn_writer(write, rx);

        let nonce = auth::generate_nonce();
        let mut client = Client::new(id, peer, nonce, tx, reader);
        client.send(ControlMessage::ProtoVer(PROTOCOL_VERSION));
        client.send(ControlMessage::AuthChallenge {
            nonce: nonce.to_vec(),
        });
        self.clients.insert(id, client);
    }

    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::Frame { client, frame } => self.handle_frame(client, &frame),
            Event::Closed { client, reason } => self.disconnect(client, &reason),
        }
    }

    fn handle_frame(&mut self, id: ClientId, frame: &[u8]) {
        let Some(msg) = self.decode_frame(id, frame) else {
            return;
        };
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        match msg {
            // Liveness was refreshed when the frame arrived.
            ControlMessage::Heartbeat => {}
            ControlMessage::Unknown { type_id } => {
                debug!(client = %client.display_name(), type_id, "ignoring unknown control message");
            }
            other => match client.state {
                ConState::Listening => self.frame_listening(id, other),
                ConState::ExpectAuthResponse => self.frame_expect_auth(id, other),
                ConState::Connected => self.frame_connected(id, other),
                ConState::Disconnected => {}
            },
        }
    }

    /// Decode one frame, tracking per-connection codec failures. Repeated
    /// garbage ends the connection; a single bad frame does not.
    fn decode_frame(&mut self, id: ClientId, frame: &[u8]) -> Option<ControlMessage> {
        let over_limit = {
            let client = self.clients.get_mut(&id)?;
            if client.state == ConState::Disconnected {
                return None;
            }
            client.last_tcp_rx = Instant::now();
            match ControlMessage::decode(frame) {
                Ok(msg) => return Some(msg),
                Err(err) => {
                    client.decode_errors += 1;
                    warn!(
                        client = %client.display_name(),
                        error = %err,
                        "dropping malformed control frame"
                    );
                    client.decode_errors >= MAX_DECODE_ERRORS
                }
            }
        };
        if over_limit {
            self.error_close(id, "protocol violation");
        }
        None
    }

    fn frame_listening(&mut self, id: ClientId, msg: ControlMessage) {
        match msg {
            ControlMessage::ProtoVer(ver) => {
                if !(1..=PROTOCOL_VERSION.major).contains(&ver.major) {
                    let Some(client) = self.clients.get(&id) else {
                        return;
                    };
                    info!(
                        client = %client.display_name(),
                        version = %ver,
                        "unsupported protocol version"
                    );
                    self.error_close(id, "Unsupported protocol version");
                    return;
                }
                if let Some(client) = self.clients.get_mut(&id) {
                    client.proto_ver = Some(ver);
                    client.state = ConState::ExpectAuthResponse;
                }
            }
            _ => self.error_close(id, "protocol violation"),
        }
    }

    fn frame_expect_auth(&mut self, id: ClientId, msg: ControlMessage) {
        match msg {
            ControlMessage::AuthResponse { callsign, digest } => {
                self.authenticate(id, callsign, &digest)
            }
            _ => self.error_close(id, "protocol violation"),
        }
    }

    fn authenticate(&mut self, id: ClientId, callsign: String, digest: &[u8]) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        if !auth::callsign_is_valid(&callsign) {
            info!(client = %client.display_name(), callsign, "malformed callsign");
            self.error_close(id, "Access denied");
            return;
        }
        let verified = self
            .cfg
            .users
            .get(&callsign)
            .is_some_and(|key| auth::verify_response(key, &client.nonce, digest));
        if !verified {
            info!(client = %client.display_name(), callsign, "authentication failed");
            self.error_close(id, "Access denied");
            return;
        }
        let duplicate = self
            .clients
            .values()
            .any(|c| c.id != id && c.callsign.as_deref() == Some(callsign.as_str()));
        if duplicate {
            info!(callsign, "rejecting duplicate callsign");
            self.error_close(id, "Callsign already in use");
            return;
        }

        let nodes = self.node_list();
        let is_v1;
        {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            client.callsign = Some(callsign.clone());
            client.state = ConState::Connected;
            // The UDP liveness clock starts at auth; the flow opens now.
            client.last_udp_rx = Instant::now();
            is_v1 = client.is_v1();
            client.send(ControlMessage::AuthOk);
            client.send(ControlMessage::ServerInfo {
                client_id: id,
                nodes,
            });
            info!(callsign, version = %client.proto_ver.unwrap_or(ProtoVer::new(0, 0)), "login ok");
        }

        self.broadcast(
            ControlMessage::NodeJoined {
                callsign: callsign.clone(),
            },
            &Filter::Except(id),
        );

        if is_v1 {
            // Legacy clients live on a fixed talkgroup.
            self.select_tg(id, self.cfg.tg_for_v1_clients);
        }
    }

    fn frame_connected(&mut self, id: ClientId, msg: ControlMessage) {
        match msg {
            ControlMessage::SelectTg { tg } => {
                let Some(client) = self.clients.get(&id) else {
                    return;
                };
                if client.is_v1() {
                    debug!(client = %client.display_name(), tg, "v1 client cannot select TG; ignored");
                    return;
                }
                self.select_tg(id, tg);
            }
            ControlMessage::TgMonitor { tgs } => {
                let Some(client) = self.clients.get_mut(&id) else {
                    return;
                };
                if client.is_v1() {
                    debug!(client = %client.display_name(), "v1 client cannot monitor TGs; ignored");
                    return;
                }
                client.monitored_tgs = tgs.into_iter().collect();
                info!(
                    client = %client.display_name(),
                    monitored = ?client.monitored_tgs,
                    "monitor list updated"
                );
            }
            ControlMessage::RequestQsy { tg } => self.request_qsy(id, tg),
            ControlMessage::NodeList { .. } => {
                let nodes = self.node_list();
                if let Some(client) = self.clients.get_mut(&id) {
                    client.send(ControlMessage::NodeList { nodes });
                }
            }
            ControlMessage::Error { message } => {
                let Some(client) = self.clients.get(&id) else {
                    return;
                };
                warn!(client = %client.display_name(), message, "error reported by client");
            }
            other => {
                let Some(client) = self.clients.get(&id) else {
                    return;
                };
                debug!(
                    client = %client.display_name(),
                    type_id = other.type_id(),
                    "ignoring unexpected control message"
                );
            }
        }
    }

    /// Subscribe `id` to `tg` (0 leaves), keeping the client mirror in sync
    /// and reacting to any talker handover the move caused.
    fn select_tg(&mut self, id: ClientId, tg: u32) {
        let events = self.registry.join(id, tg);
        if let Some(client) = self.clients.get_mut(&id) {
            client.current_tg = tg;
            info!(client = %client.display_name(), tg, "selected TG");
        }
        self.apply_talker_events(events);
    }

    /// QSY coordination: resolve `tg == 0` through the random pool, then
    /// invite everyone on the caller's current talkgroup.
    pub(crate) fn request_qsy(&mut self, id: ClientId, requested: u32) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let name = client.display_name();
        let tg = if requested == NO_TG {
            match &mut self.qsy {
                None => {
                    info!(
                        client = %name,
                        "QSY request for random TG received but no random QSY range is configured"
                    );
                    return;
                }
                Some(pool) => match pool.allocate(&self.registry) {
                    Some(tg) => tg,
                    None => {
                        warn!("no random TG available for QSY");
                        return;
                    }
                },
            }
        } else {
            requested
        };

        let current_tg = self.registry.tg_of(id);
        info!(client = %name, from_tg = current_tg, to_tg = tg, "requesting QSY");
        self.broadcast(
            ControlMessage::RequestQsy { tg },
            &Filter::v2().and(Filter::Tg(current_tg)),
        );
    }

    /// Translate registry talker-change events into broadcasts.
    ///
    /// Modern and legacy notifications are deliberately two independent
    /// frames behind independent filters; the legacy variant only exists on
    /// the fixed v1 talkgroup.
    pub(crate) fn apply_talker_events(&mut self, events: Vec<TalkerChange>) {
        for TalkerChange { tg, old, new } in events {
            if let Some(old_id) = old {
                if let Some(callsign) = self.callsign_of(old_id) {
                    info!(callsign, tg, "talker stop");
                    self.broadcast(
                        ControlMessage::TalkerStop {
                            tg,
                            callsign: callsign.clone(),
                        },
                        &Filter::v2().and(Filter::Tg(tg).or(Filter::MonitorsTg(tg))),
                    );
                    if tg == self.cfg.tg_for_v1_clients {
                        self.broadcast(ControlMessage::TalkerStopV1 { callsign }, &Filter::v1());
                    }
                    self.broadcast_udp(
                        &UdpMessage::FlushSamples,
                        &Filter::Tg(tg).and(Filter::Except(old_id)),
                    );
                }
            }
            if let Some(new_id) = new {
                if let Some(callsign) = self.callsign_of(new_id) {
                    info!(callsign, tg, "talker start");
                    self.broadcast(
                        ControlMessage::TalkerStart {
                            tg,
                            callsign: callsign.clone(),
                        },
                        &Filter::v2().and(Filter::Tg(tg).or(Filter::MonitorsTg(tg))),
                    );
                    if tg == self.cfg.tg_for_v1_clients {
                        self.broadcast(ControlMessage::TalkerStartV1 { callsign }, &Filter::v1());
                    }
                }
            }
        }
    }

    /// Send `msg` to every connected client the filter selects.
    pub(crate) fn broadcast(&mut self, msg: ControlMessage, filter: &Filter) {
        let targets: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.state == ConState::Connected && filter.matches(c))
            .map(|c| c.id)
            .collect();
        for id in targets {
            if let Some(client) = self.clients.get_mut(&id) {
                client.send(msg.clone());
            }
        }
    }

    /// Datagram counterpart of [`Core::broadcast`]; clients whose UDP port is
    /// not yet latched are skipped by `send_udp`.
    pub(crate) fn broadcast_udp(&mut self, msg: &UdpMessage, filter: &Filter) {
        let targets: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.state == ConState::Connected && filter.matches(c))
            .map(|c| c.id)
            .collect();
        for id in targets {
            self.send_udp(id, msg);
        }
    }

    /// Send an error frame, then run the disconnect path.
    pub(crate) fn error_close(&mut self, id: ClientId, message: &str) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.send(ControlMessage::Error {
                message: message.to_string(),
            });
        }
        self.disconnect(id, message);
    }

    /// Tear a session down. The record is only reaped after the current loop
    /// turn so outer frames can still read its fields.
    pub(crate) fn disconnect(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.state == ConState::Disconnected {
            return;
        }
        client.state = ConState::Disconnected;
        client.current_tg = NO_TG;
        client.shutdown_reader();
        let name = client.display_name();
        let callsign = client.callsign.clone();
        info!(client = %name, reason, "disconnected");

        let events = self.registry.remove_client(id);
        self.apply_talker_events(events);

        if let Some(callsign) = callsign {
            self.broadcast(ControlMessage::NodeLeft { callsign }, &Filter::Except(id));
        }
        self.reap_list.push(id);
    }

    /// Drop sessions whose teardown was deferred during this loop turn.
    pub(crate) fn reap(&mut self) {
        for id in self.reap_list.drain(..) {
            self.clients.remove(&id);
        }
    }

    /// Periodic work: squelch timeouts, dead-peer detection, idle heartbeats.
    pub(crate) fn tick(&mut self) {
        let now = Instant::now();
        let events = self.registry.poll_timeouts(now);
        self.apply_talker_events(events);

        let timeout = self.cfg.heartbeat_timeout();
        let dead: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.state != ConState::Disconnected)
            .filter(|c| {
                now.duration_since(c.last_tcp_rx) >= timeout
                    || (c.state == ConState::Connected
                        && now.duration_since(c.last_udp_rx) >= timeout)
            })
            .map(|c| c.id)
            .collect();
        for id in dead {
            self.disconnect(id, "timeout");
        }

        let interval = self.cfg.heartbeat_interval();
        let idle_tcp: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| {
                c.state == ConState::Connected && now.duration_since(c.last_tcp_tx) >= interval
            })
            .map(|c| c.id)
            .collect();
        for id in idle_tcp {
            if let Some(client) = self.clients.get_mut(&id) {
                client.send(ControlMessage::Heartbeat);
            }
        }
        let idle_udp: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| {
                c.state == ConState::Connected
                    && c.udp_port.is_some()
                    && now.duration_since(c.last_udp_tx) >= interval
            })
            .map(|c| c.id)
            .collect();
        for id in idle_udp {
            self.send_udp(id, &UdpMessage::Heartbeat);
        }
    }

    pub(crate) fn handle_status_request(&mut self, request: StatusRequest) {
        let snapshot = self.status_snapshot();
        let _ = request.reply.send(snapshot);
    }

    fn status_snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        for client in self.clients.values() {
            let (Some(callsign), Some(ver)) = (&client.callsign, client.proto_ver) else {
                continue;
            };
            if client.state != ConState::Connected {
                continue;
            }
            let is_talker = self.registry.talker(client.current_tg) == Some(client.id);
            snapshot.nodes.insert(
                callsign.clone(),
                NodeStatus {
                    addr: client.tcp_addr.ip().to_string(),
                    proto_ver: ProtoVerStatus {
                        major_ver: ver.major,
                        minor_ver: ver.minor,
                    },
                    tg: client.current_tg.to_string(),
                    monitored_tgs: client.monitored_tgs.iter().copied().collect(),
                    is_talker,
                },
            );
        }
        snapshot
    }

    /// Callsigns of all authenticated clients, alphabetically.
    fn node_list(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.state == ConState::Connected)
            .filter_map(|c| c.callsign.clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn callsign_of(&self, id: ClientId) -> Option<String> {
        self.clients.get(&id).and_then(|c| c.callsign.clone())
    }
}
