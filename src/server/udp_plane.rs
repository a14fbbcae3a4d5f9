//! UDP audio plane: datagram validation, sequencing and talker arbitration.
//!
//! Everything here runs inside the core loop task; handlers contain no await
//! points, so a datagram is fully processed (including any fan-out) before
//! the next event is taken.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::client::ConState;
use crate::server::core::Core;
use crate::tg::{ClientId, NO_TG};
use crate::udp::{check_sequence, SeqCheck, UdpHeader, UdpMessage};

impl Core {
    /// Entry point for every datagram received on the shared socket.
    pub(crate) fn handle_datagram(&mut self, source: SocketAddr, datagram: &[u8]) {
        let (header, msg) = match UdpMessage::decode(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%source, error = %err, "unpacking failed for UDP message");
                return;
            }
        };
        let now = Instant::now();

        let Some(client) = self.clients.get_mut(&header.client_id) else {
            warn!(%source, client_id = header.client_id, "incoming UDP packet has invalid client id");
            return;
        };
        if client.state != ConState::Connected {
            warn!(%source, client_id = header.client_id, "UDP packet for unauthenticated client");
            return;
        }
        // Source validation: the IP must match the TCP peer; the port is
        // latched from the first valid datagram and pinned afterwards.
        if source.ip() != client.tcp_addr.ip() {
            warn!(
                client = %client.display_name(),
                %source,
                "incoming UDP packet has the wrong source ip"
            );
            return;
        }
        match client.udp_port {
            None => {
                client.udp_port = Some(source.port());
                info!(client = %client.display_name(), port = source.port(), "UDP port latched");
                let id = client.id;
                self.send_udp(id, &UdpMessage::Heartbeat);
            }
            Some(port) if port != source.port() => {
                warn!(
                    client = %client.display_name(),
                    %source,
                    "incoming UDP packet has the wrong source UDP port number"
                );
                return;
            }
            Some(_) => {}
        }

        let Some(client) = self.clients.get_mut(&header.client_id) else {
            return;
        };
        match check_sequence(client.next_udp_rx_seq, header.sequence) {
            SeqCheck::Stale => {
                info!(
                    client = %client.display_name(),
                    received = header.sequence,
                    expected = client.next_udp_rx_seq,
                    "dropping out of sequence frame"
                );
                return;
            }
            SeqCheck::Lost => {
                info!(
                    client = %client.display_name(),
                    expected = client.next_udp_rx_seq,
                    received = header.sequence,
                    "UDP frame(s) lost"
                );
            }
            SeqCheck::InOrder => {}
        }
        client.next_udp_rx_seq = header.sequence.wrapping_add(1);
        client.last_udp_rx = now;

        match msg {
            UdpMessage::Heartbeat => {}
            UdpMessage::Audio { payload, .. } => self.client_audio(header.client_id, payload, now),
            UdpMessage::FlushSamples => self.client_flush(header.client_id, now),
            UdpMessage::AllSamplesFlushed => {}
            UdpMessage::Unknown { type_id } => {
                debug!(type_id, "ignoring unknown UDP message");
            }
        }
    }

    /// Audio dispatch: claim the talker slot if free, then fan out to every
    /// other member of the sender's talkgroup. Frames from non-talkers and
    /// from blocked clients are silently dropped.
    fn client_audio(&mut self, id: ClientId, payload: Bytes, now: Instant) {
        // Squelch evaluation happens at frame granularity, not just on the
        // periodic tick.
        let events = self.registry.poll_timeouts(now);
        self.apply_talker_events(events);

        if self.registry.is_blocked(id, now) {
            return;
        }
        let tg = self.registry.tg_of(id);
        if tg == NO_TG || payload.is_empty() {
            return;
        }
        if self.registry.talker(tg).is_none() {
            if let Some(event) = self.registry.set_talker(tg, Some(id), now) {
                self.apply_talker_events(vec![event]);
            }
        }
        if self.registry.talker(tg) != Some(id) {
            return;
        }
        self.registry.set_talker(tg, Some(id), now);

        let listeners: Vec<ClientId> = self.registry.members(tg).filter(|&m| m != id).collect();
        let msg = UdpMessage::Audio { tg, payload };
        for listener in listeners {
            self.send_udp(listener, &msg);
        }
    }

    /// Flush: release the talker slot if the sender holds it, then ack the
    /// sender immediately. Waiting for every listener to confirm would fan
    /// in badly on large talkgroups, so the reflector acks on their behalf.
    fn client_flush(&mut self, id: ClientId, now: Instant) {
        let tg = self.registry.tg_of(id);
        if tg != NO_TG && self.registry.talker(tg) == Some(id) {
            if let Some(event) = self.registry.set_talker(tg, None, now) {
                self.apply_talker_events(vec![event]);
            }
        }
        self.send_udp(id, &UdpMessage::AllSamplesFlushed);
    }

    /// Send one datagram to a client, stamping the per-recipient outbound
    /// sequence number. Skipped until the client's UDP port is latched.
    pub(crate) fn send_udp(&mut self, id: ClientId, msg: &UdpMessage) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let Some(port) = client.udp_port else {
            return;
        };
        let header = UdpHeader {
            client_id: id,
            sequence: client.next_udp_tx_seq,
        };
        client.next_udp_tx_seq = client.next_udp_tx_seq.wrapping_add(1);
        let dest = SocketAddr::new(client.tcp_addr.ip(), port);
        let datagram = msg.encode(header);
        match self.udp_socket().try_send_to(&datagram, dest) {
            Ok(_) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.last_udp_tx = Instant::now();
                }
            }
            Err(err) => {
                debug!(%dest, error = %err, "dropping outbound UDP datagram");
            }
        }
    }
}
