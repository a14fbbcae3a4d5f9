//! Reflector server: sockets, accept loop and the single core event loop.

mod client;
mod config;
mod conn;
mod core;
mod status;
mod udp_plane;

pub use config::Config;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use self::core::Core;
use crate::error::ReflectorError;
use crate::udp::MAX_DATAGRAM_SIZE;

/// The reflector daemon.
///
/// All mutable state lives inside the event loop of [`ReflectorServer::serve`];
/// network callbacks, timers and status snapshots are serialized onto that one
/// task, so handlers never observe each other's partial updates.
pub struct ReflectorServer {
    cfg: Config,
}

impl ReflectorServer {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Bind the control, audio and optional status sockets, then run the
    /// event loop. Only startup failures return; the loop itself runs until
    /// the process is shut down.
    pub async fn serve(self) -> Result<(), ReflectorError> {
        self.cfg.validate()?;
        let ip: IpAddr = self
            .cfg
            .bind_host
            .parse()
            .map_err(|_| ReflectorError::InvalidConfig(format!("bad bind_host: {}", self.cfg.bind_host)))?;
        let addr = SocketAddr::new(ip, self.cfg.listen_port);

        let listener = TcpListener::bind(addr).await?;
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        info!(%addr, "reflector listening");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        if let Some(port) = self.cfg.http_srv_port {
            let http_addr = SocketAddr::new(ip, port);
            let http_listener = TcpListener::bind(http_addr).await?;
            info!(%http_addr, "status endpoint listening");
            tokio::spawn(status::serve(http_listener, status_tx.clone()));
        }
        drop(status_tx);

        let mut core = Core::new(self.cfg, udp.clone(), events_tx);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => core.accept(stream, peer),
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(event) = events_rx.recv() => core.handle_event(event),
                received = udp.recv_from(&mut buf) => match received {
                    Ok((len, source)) => core.handle_datagram(source, &buf[..len]),
                    Err(err) => warn!(error = %err, "UDP receive error"),
                },
                Some(request) = status_rx.recv() => core.handle_status_request(request),
                _ = tick.tick() => core.tick(),
            }
            // Sessions closed during this turn are destroyed only now, after
            // every handler that might still reference them has unwound.
            core.reap();
        }
    }
}
