//! Agent side of the transport: connection establishment and the writer task.

use std::io::ErrorKind;
use std::time::Duration;

use futures::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info};

use super::codec::{MessageCodec, ProtocolError};
use super::message::Message;

/// Errors raised while connecting to the server.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("could not connect to {addr} within {window:?}")]
    Timeout { addr: String, window: Duration },

    #[error("connecting to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
    )
}

/// Connect to `addr`, retrying refused or timed-out attempts every `poll`
/// until `window` has elapsed.
pub async fn connect_with_retry(
    addr: &str,
    window: Duration,
    poll: Duration,
) -> Result<TcpStream, ConnectError> {
    let attempts = async {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_retryable(e.kind()) => {
                    debug!(addr, attempt, error = %e, "connect failed, retrying");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => {
                    return Err(ConnectError::Io {
                        addr: addr.to_string(),
                        source: e,
                    })
                }
            }
        }
    };

    match tokio::time::timeout(window, attempts).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout {
            addr: addr.to_string(),
            window,
        }),
    }
}

/// Command consumed by the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    Send(Message),
    /// Flush everything queued so far and stop.
    Shutdown,
}

/// Handle to the writer task owning the connection.
///
/// The task drains its queue until it sees [`WriterCommand::Shutdown`], so
/// every message enqueued before [`TransportClient::shutdown`] is written.
pub struct TransportClient {
    tx: mpsc::Sender<WriterCommand>,
    handle: JoinHandle<Result<u64, ProtocolError>>,
}

impl TransportClient {
    /// Spawn the writer task on an established connection.
    pub fn spawn(stream: TcpStream, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = tokio::spawn(run_writer(stream, rx));
        Self { tx, handle }
    }

    /// Queue a message, waiting while the queue is full.
    pub async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx
            .send(WriterCommand::Send(msg))
            .await
            .map_err(|_| writer_gone())
    }

    /// A cloneable sender for producers on other tasks.
    pub fn sender(&self) -> mpsc::Sender<WriterCommand> {
        self.tx.clone()
    }

    /// Push the shutdown sentinel and wait for the queue to drain.
    ///
    /// Returns the number of messages written.
    pub async fn shutdown(self) -> Result<u64, ProtocolError> {
        // A closed queue means the writer already stopped; its result says why.
        let _ = self.tx.send(WriterCommand::Shutdown).await;
        drop(self.tx);

        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::Io(std::io::Error::other(e))),
        }
    }
}

fn writer_gone() -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        ErrorKind::BrokenPipe,
        "writer task stopped",
    ))
}

async fn run_writer(
    stream: TcpStream,
    mut rx: mpsc::Receiver<WriterCommand>,
) -> Result<u64, ProtocolError> {
    let peer = stream.peer_addr().ok();
    let mut framed = FramedWrite::new(stream, MessageCodec::new());
    let mut written: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(msg) => {
                framed.feed(msg).await?;
                written += 1;

                // Flush once the queue is momentarily empty.
                if rx.is_empty() {
                    framed.flush().await?;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }

    framed.flush().await?;
    framed.close().await?;

    info!(peer = ?peer, messages = written, "transport writer stopped");

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_connect_timeout_when_nothing_listens() {
        // Bind then drop to get a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let err = connect_with_retry(&addr, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, ConnectError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        let placeholder = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = placeholder.local_addr().expect("addr");
        drop(placeholder);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            TcpListener::bind(addr).await.expect("rebind")
        });

        let stream = connect_with_retry(
            &addr.to_string(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect("connects after retry");
        let listener = late.await.expect("join");
        let (_accepted, _) = listener.accept().await.expect("accept");
        drop(stream);
    }

    #[tokio::test]
    async fn test_writer_drains_queue_before_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut frames = FramedRead::new(socket, MessageCodec::new());
            let mut got = Vec::new();
            while let Some(item) = frames.next().await {
                got.push(item.expect("io").expect("valid frame"));
            }
            got
        });

        let stream = connect_with_retry(&addr, Duration::from_secs(2), Duration::from_millis(10))
            .await
            .expect("connect");
        let client = TransportClient::spawn(stream, 2);

        client.send(Message::TransmissionBegin(1.0)).await.expect("send");
        for i in 0..10 {
            client
                .send(Message::TransmissionEnd(f64::from(i)))
                .await
                .expect("send");
        }
        let written = client.shutdown().await.expect("clean shutdown");
        assert_eq!(written, 11);

        let got = reader.await.expect("join");
        assert_eq!(got.len(), 11);
        assert_eq!(got[0], Message::TransmissionBegin(1.0));
        assert_eq!(got[10], Message::TransmissionEnd(9.0));
    }
}
