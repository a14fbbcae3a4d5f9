//! Connection byte pumps.
//!
//! Each accepted connection gets a reader task and a writer task. Neither
//! touches shared state: the reader forwards complete frames to the core's
//! event channel and the writer drains typed messages queued by the core.

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::messages::{ControlMessage, FrameDecoder};
use crate::tg::ClientId;

/// Inbound notifications from connection tasks to the core loop.
#[derive(Debug)]
pub(crate) enum Event {
    /// One complete control frame (type tag plus body).
    Frame { client: ClientId, frame: Bytes },
    /// The connection ended, cleanly or otherwise.
    Closed { client: ClientId, reason: String },
}

pub(crate) fn spawn_reader(
    client: ClientId,
    mut read: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        loop {
            match decoder.read_next(&mut read).await {
                Ok(Some(frame)) => {
                    if events.send(Event::Frame { client, frame }).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = events.send(Event::Closed {
                        client,
                        reason: "closed by remote peer".into(),
                    });
                    return;
                }
                Err(err) => {
                    let _ = events.send(Event::Closed {
                        client,
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }
    })
}

pub(crate) fn spawn_writer(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = msg.encode_frame();
            if let Err(err) = write.write_all(&frame).await {
                tracing::debug!(error = %err, "control writer stopped");
                return;
            }
        }
        // Sender dropped: queued messages (e.g. a final Error) are flushed
        // above before the socket is shut down.
        let _ = write.shutdown().await;
    })
}
