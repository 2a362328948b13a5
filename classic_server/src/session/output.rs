//! Queued packet output for one connection.
//!
//! Packets are encoded by the caller and handed to a writer task through a
//! bounded queue, so nothing but that task ever touches the socket. The
//! session's own sends wait for queue space up to a stall timeout.
//! Broadcasts never wait: a full queue means the client stopped reading and
//! the connection is dropped.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use classic_shared::net::ServerPacket;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Writes buffered per connection before broadcasts give up on it.
pub const QUEUE_CAPACITY: usize = 1024;

/// How long a session's own send may wait for queue space.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long closing waits for queued packets to reach the socket.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Outbound {
    Data(Bytes),
    Close,
}

/// Write side of a connection. Each queued item is written whole and in
/// queue order, so packets from the session, the login timer, world
/// switches and broadcasts never interleave.
pub struct PacketWriter {
    tx: mpsc::Sender<Outbound>,
    stall_timeout: Duration,
    /// Cancelled to drop the connection without draining the queue.
    abort: CancellationToken,
    /// Cancelled when the writer task exits.
    finished: CancellationToken,
}

impl PacketWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_limits(writer, QUEUE_CAPACITY, STALL_TIMEOUT)
    }

    /// Spawns the writer task, so this must run inside a tokio runtime.
    pub fn with_limits<W>(writer: W, capacity: usize, stall_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        let finished = CancellationToken::new();
        tokio::spawn(drain(writer, rx, abort.clone(), finished.clone()));
        Self {
            tx,
            stall_timeout,
            abort,
            finished,
        }
    }

    pub async fn send(&self, packet: &ServerPacket) -> io::Result<()> {
        self.enqueue(packet.encode()).await
    }

    /// Queues several packets as a single write.
    pub async fn send_all(&self, packets: &[ServerPacket]) -> io::Result<()> {
        let mut buf = BytesMut::new();
        for packet in packets {
            buf.extend_from_slice(&packet.encode());
        }
        self.enqueue(buf.freeze()).await
    }

    async fn enqueue(&self, data: Bytes) -> io::Result<()> {
        let queued = tokio::time::timeout(self.stall_timeout, self.tx.send(Outbound::Data(data)));
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(closed()),
            queued = queued => match queued {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(closed()),
                Err(_) => {
                    self.abort.cancel();
                    Err(io::Error::new(io::ErrorKind::TimedOut, "client stopped reading"))
                }
            },
        }
    }

    /// Queues a packet without waiting. Returns false if the packet was not
    /// queued; a full queue also drops the connection.
    pub fn push(&self, packet: &ServerPacket) -> bool {
        match self.tx.try_send(Outbound::Data(packet.encode())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Output queue full, dropping connection");
                self.abort.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.abort.is_cancelled() || self.finished.is_cancelled()
    }

    /// Resolves once nothing more can be written.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.finished.cancelled()
    }

    /// Writes out what is queued and shuts the connection down. After
    /// `grace` the rest is discarded.
    pub async fn close(&self, grace: Duration) {
        let drained = async {
            if self.tx.send(Outbound::Close).await.is_ok() {
                self.finished.cancelled().await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            debug!("Output did not drain in time, dropping connection");
            self.abort.cancel();
            self.finished.cancelled().await;
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection output closed")
}

async fn drain<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    abort: CancellationToken,
    finished: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let _finished = finished.drop_guard();
    let result = tokio::select! {
        biased;
        _ = abort.cancelled() => Ok(()),
        result = write_queued(&mut writer, &mut rx) => result,
    };
    if let Err(e) = result {
        debug!(error = %e, "Connection write failed");
    }
}

async fn write_queued<W>(writer: &mut W, rx: &mut mpsc::Receiver<Outbound>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Data(data) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
            }
            Outbound::Close => break,
        }
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn packets_arrive_whole_and_in_order() {
        let (mut client, server) = tokio::io::duplex(8 * 1024);
        let writer = PacketWriter::new(server);
        writer.send(&ServerPacket::Ping).await.unwrap();
        writer
            .send_all(&[
                ServerPacket::LevelInitialize,
                ServerPacket::Kick {
                    reason: "bye".into(),
                },
            ])
            .await
            .unwrap();
        assert!(writer.push(&ServerPacket::Ping));
        writer.close(CLOSE_GRACE).await;
        assert!(writer.is_closed());

        assert_eq!(ServerPacket::read(&mut client).await.unwrap(), ServerPacket::Ping);
        assert_eq!(
            ServerPacket::read(&mut client).await.unwrap(),
            ServerPacket::LevelInitialize
        );
        assert_eq!(
            ServerPacket::read(&mut client).await.unwrap(),
            ServerPacket::Kick {
                reason: "bye".into()
            }
        );
        assert_eq!(ServerPacket::read(&mut client).await.unwrap(), ServerPacket::Ping);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn push_to_stalled_client_drops_it_without_waiting() {
        let (_unread, server) = tokio::io::duplex(16);
        let writer = PacketWriter::with_limits(server, 4, STALL_TIMEOUT);

        let mut queued = 0;
        while writer.push(&ServerPacket::Ping) {
            queued += 1;
            assert!(queued < 100, "queue never filled");
        }
        assert!(writer.is_closed());
        tokio::time::timeout(Duration::from_secs(1), writer.closed())
            .await
            .unwrap();
        assert!(writer.send(&ServerPacket::Ping).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn own_send_gives_up_after_stall_timeout() {
        let (_unread, server) = tokio::io::duplex(16);
        let writer = PacketWriter::with_limits(server, 1, Duration::from_secs(2));
        let kick = ServerPacket::Kick {
            reason: "x".repeat(60),
        };

        let mut result = Ok(());
        for _ in 0..8 {
            result = writer.send(&kick).await;
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert!(writer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_on_stalled_client() {
        let (_unread, server) = tokio::io::duplex(16);
        let writer = PacketWriter::new(server);
        writer
            .send(&ServerPacket::Kick {
                reason: "stopping".into(),
            })
            .await
            .unwrap();
        writer.close(Duration::from_secs(1)).await;
        assert!(writer.is_closed());
    }
}
