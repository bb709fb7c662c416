//! Server side of the transport: accepts connections and decodes frames onto
//! the ingestion queue.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::MessageCodec;
use super::message::Message;
use crate::export::health::HealthMetrics;

/// Accepts agent connections and funnels every decoded message into one
/// bounded queue.
pub struct TransportListener {
    listener: TcpListener,
    max_frame_length: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl TransportListener {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, max_frame_length: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))?;

        Ok(Self {
            listener,
            max_frame_length,
            health: None,
        })
    }

    /// Attach health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("getting listener address")
    }

    /// Accept connections until cancelled.
    ///
    /// Each connection gets its own reader task. Readers only decode and
    /// enqueue, so a slow consumer pushes back on the socket.
    pub async fn run(self, queue: mpsc::Sender<Message>, cancel: CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!(addr = %local, "transport listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    info!(peer = %peer, "agent connected");
                    if let Some(h) = &self.health {
                        h.connections_active.inc();
                    }

                    let queue = queue.clone();
                    let health = self.health.clone();
                    let cancel = cancel.child_token();
                    let max = self.max_frame_length;
                    tokio::spawn(async move {
                        let received = read_connection(stream, peer, max, queue, health.clone(), cancel).await;
                        if let Some(h) = &health {
                            h.connections_active.dec();
                        }
                        info!(peer = %peer, messages = received, "agent disconnected");
                    });
                }
            }
        }

        info!("transport listener stopped");

        Ok(())
    }
}

/// Decode frames from one connection and push them onto the queue.
///
/// Returns the number of messages enqueued. Malformed frames are logged,
/// counted and skipped; the connection stays open.
pub async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_length: usize,
    queue: mpsc::Sender<Message>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> u64 {
    let mut frames = FramedRead::new(stream, MessageCodec::with_max_length(max_frame_length));
    let mut received: u64 = 0;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = frames.next() => item,
        };

        match item {
            Some(Ok(Ok(msg))) => {
                if let Some(h) = &health {
                    h.messages_received
                        .with_label_values(&[msg.tag()])
                        .inc();
                }
                debug!(peer = %peer, tag = msg.tag(), "message received");

                if queue.send(msg).await.is_err() {
                    debug!(peer = %peer, "ingestion queue closed");
                    break;
                }
                received += 1;

                if let Some(h) = &health {
                    h.queue_depth
                        .set((queue.max_capacity() - queue.capacity()) as f64);
                }
            }
            Some(Ok(Err(e))) => {
                warn!(peer = %peer, error = %e, "dropping malformed frame");
                if let Some(h) = &health {
                    h.protocol_errors.with_label_values(&[e.as_label()]).inc();
                }
            }
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "connection read failed");
                break;
            }
            None => break,
        }
    }

    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use crate::transport::codec::{encode_frame, DEFAULT_MAX_FRAME_LENGTH, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_listener_skips_bad_frame_and_keeps_connection() {
        let listener = TransportListener::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_LENGTH)
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(listener.run(tx, cancel.clone()));

        let mut buf = bytes::BytesMut::new();
        encode_frame(&Message::TransmissionBegin(1.0), DEFAULT_MAX_FRAME_LENGTH, &mut buf)
            .expect("encode");
        buf.extend_from_slice(&[PROTOCOL_VERSION]);
        buf.extend_from_slice(b"{\"tag\":\"Nope\"}\r\n");
        encode_frame(&Message::TransmissionEnd(2.0), DEFAULT_MAX_FRAME_LENGTH, &mut buf)
            .expect("encode");

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client.write_all(&buf).await.expect("write");
        client.shutdown().await.expect("shutdown");

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time");
        assert_eq!(first, Some(Message::TransmissionBegin(1.0)));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time");
        assert_eq!(second, Some(Message::TransmissionEnd(2.0)));

        cancel.cancel();
        server.await.expect("join").expect("listener result");
    }
}
