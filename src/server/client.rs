//! Per-client connection record and broadcast filters.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::NONCE_LEN;
use crate::messages::{ControlMessage, ProtoVer};
use crate::tg::{ClientId, NO_TG};

/// Connection state machine of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConState {
    /// TCP accepted; challenge sent; waiting for the peer's `ProtoVer`.
    Listening,
    /// Peer version recorded; waiting for `AuthResponse`.
    ExpectAuthResponse,
    /// Authenticated and in service.
    Connected,
    /// Torn down; the record lingers until the end of the loop turn.
    Disconnected,
}

/// Everything the reflector core tracks about one connection.
///
/// Owned exclusively by the core's client table; the rest of the code refers
/// to clients by [`ClientId`].
pub(crate) struct Client {
    pub(crate) id: ClientId,
    pub(crate) state: ConState,
    pub(crate) callsign: Option<String>,
    pub(crate) proto_ver: Option<ProtoVer>,
    pub(crate) tcp_addr: SocketAddr,
    /// Latched from the first valid inbound datagram.
    pub(crate) udp_port: Option<u16>,
    pub(crate) next_udp_rx_seq: u16,
    pub(crate) next_udp_tx_seq: u16,
    pub(crate) nonce: [u8; NONCE_LEN],
    /// Mirror of the registry's talkgroup assignment, used by broadcast
    /// filters and the status snapshot.
    pub(crate) current_tg: u32,
    pub(crate) monitored_tgs: BTreeSet<u32>,
    pub(crate) last_tcp_rx: Instant,
    pub(crate) last_udp_rx: Instant,
    pub(crate) last_tcp_tx: Instant,
    pub(crate) last_udp_tx: Instant,
    pub(crate) decode_errors: u32,
    tx: mpsc::UnboundedSender<ControlMessage>,
    reader: JoinHandle<()>,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        tcp_addr: SocketAddr,
        nonce: [u8; NONCE_LEN],
        tx: mpsc::UnboundedSender<ControlMessage>,
        reader: JoinHandle<()>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConState::Listening,
            callsign: None,
            proto_ver: None,
            tcp_addr,
            udp_port: None,
            next_udp_rx_seq: 0,
            next_udp_tx_seq: 0,
            nonce,
            current_tg: NO_TG,
            monitored_tgs: BTreeSet::new(),
            last_tcp_rx: now,
            last_udp_rx: now,
            last_tcp_tx: now,
            last_udp_tx: now,
            decode_errors: 0,
            tx,
            reader,
        }
    }

    /// Queue a control message for the writer task. Send failures mean the
    /// writer is already gone; the reader will surface the close shortly.
    pub(crate) fn send(&mut self, msg: ControlMessage) {
        if self.tx.send(msg).is_ok() {
            self.last_tcp_tx = Instant::now();
        }
    }

    /// Callsign once authenticated, remote address before that. For logs.
    pub(crate) fn display_name(&self) -> String {
        match &self.callsign {
            Some(callsign) => callsign.clone(),
            None => self.tcp_addr.to_string(),
        }
    }

    pub(crate) fn is_v1(&self) -> bool {
        self.proto_ver.is_some_and(|ver| ver.is_v1())
    }

    /// Stop pumping inbound frames. The writer task drains its queue and
    /// exits on its own once this record (and with it the sender) is dropped.
    pub(crate) fn shutdown_reader(&self) {
        self.reader.abort();
    }
}

/// Composable broadcast predicate.
///
/// The vocabulary mirrors the filters the reflector composes for
/// talker-change and QSY broadcasts: protocol-version ranges, talkgroup
/// membership, monitor subscriptions and sender exclusion. `All` and `Not`
/// round out the algebra.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub(crate) enum Filter {
    All,
    VersionIn(ProtoVer, ProtoVer),
    Tg(u32),
    MonitorsTg(u32),
    Except(ClientId),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Legacy clients: major version 1.
    pub(crate) fn v1() -> Filter {
        Filter::VersionIn(ProtoVer::new(1, 0), ProtoVer::new(1, 999))
    }

    /// Modern clients: major version 2.
    pub(crate) fn v2() -> Filter {
        Filter::VersionIn(ProtoVer::new(2, 0), ProtoVer::new(2, 999))
    }

    pub(crate) fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub(crate) fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    #[allow(dead_code)]
    pub(crate) fn negate(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    pub(crate) fn matches(&self, client: &Client) -> bool {
        match self {
            Filter::All => true,
            Filter::VersionIn(lo, hi) => client
                .proto_ver
                .is_some_and(|ver| *lo <= ver && ver <= *hi),
            Filter::Tg(tg) => client.current_tg == *tg,
            Filter::MonitorsTg(tg) => client.monitored_tgs.contains(tg),
            Filter::Except(id) => client.id != *id,
            Filter::And(a, b) => a.matches(client) && b.matches(client),
            Filter::Or(a, b) => a.matches(client) || b.matches(client),
            Filter::Not(inner) => !inner.matches(client),
        }
    }
}
