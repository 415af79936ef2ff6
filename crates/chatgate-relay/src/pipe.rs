//! Bidirectional byte relay
//!
//! One reader task per side pulls bytes off its connection into a pooled
//! buffer and hands a copy to the coordinator over a single-slot channel. The
//! coordinator writes each chunk verbatim to the opposite side. The first
//! end-of-stream sentinel from either side ends the relay; both connections
//! are then closed and both reader tasks joined before `relay` returns.
//!
//! Write failures are not reported to either peer. They end the relay and
//! show up in [`RelayStats::ended_by`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chatgate_pool::BufferPool;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Reader output; `None` is the end-of-stream sentinel, sent at most once
type Chunk = Option<Bytes>;

/// Upper bound on flushing close notifications to a peer that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// What ended a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client side hit end-of-stream or a read error
    ClientClosed,
    /// Upstream side hit end-of-stream or a read error
    UpstreamClosed,
    /// Writing a chunk to one side failed
    WriteFailed,
    /// The relay was cancelled from outside
    Shutdown,
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub ended_by: RelayEnd,
}

/// Relay bytes between `client` and `upstream` until either terminates or
/// `shutdown` is cancelled. Both connections are closed on return.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    buffers: &Arc<BufferPool>,
    shutdown: &CancellationToken,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = shutdown.child_token();

    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Single slot: a slow writer stalls the opposite reader, which stops
    // reading its socket and lets transport flow control push back
    let (client_tx, mut client_rx) = mpsc::channel::<Chunk>(1);
    let (upstream_tx, mut upstream_rx) = mpsc::channel::<Chunk>(1);

    let client_reader = spawn_reader(
        "client",
        client_read,
        buffers.clone(),
        client_tx,
        cancel.clone(),
    );
    let upstream_reader = spawn_reader(
        "upstream",
        upstream_read,
        buffers.clone(),
        upstream_tx,
        cancel.clone(),
    );

    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    let ended_by = loop {
        tokio::select! {
            _ = cancel.cancelled() => break RelayEnd::Shutdown,
            chunk = client_rx.recv() => {
                let Some(bytes) = chunk.flatten() else {
                    break RelayEnd::ClientClosed;
                };
                if let Err(end) = forward(&mut upstream_write, &bytes, &cancel, "upstream").await {
                    break end;
                }
                client_to_upstream += bytes.len() as u64;
            }
            chunk = upstream_rx.recv() => {
                let Some(bytes) = chunk.flatten() else {
                    break RelayEnd::UpstreamClosed;
                };
                if let Err(end) = forward(&mut client_write, &bytes, &cancel, "client").await {
                    break end;
                }
                upstream_to_client += bytes.len() as u64;
            }
        }
    };

    cancel.cancel();
    let _ = tokio::join!(client_reader, upstream_reader);

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = client_write.shutdown().await;
        let _ = upstream_write.shutdown().await;
    })
    .await;

    trace!(
        ?ended_by,
        client_to_upstream,
        upstream_to_client,
        "Relay finished"
    );

    RelayStats {
        client_to_upstream,
        upstream_to_client,
        ended_by,
    }
}

async fn forward<W>(
    writer: &mut W,
    chunk: &[u8],
    cancel: &CancellationToken,
    side: &'static str,
) -> Result<(), RelayEnd>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayEnd::Shutdown),
        written = async {
            writer.write_all(chunk).await?;
            writer.flush().await
        } => written.map_err(|e| {
            debug!("Write to {} failed: {}", side, e);
            RelayEnd::WriteFailed
        }),
    }
}

fn spawn_reader<R>(
    side: &'static str,
    mut reader: R,
    buffers: Arc<BufferPool>,
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = buffers.get();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = reader.read(&mut buf[..]) => read,
            };

            let n = match read {
                Ok(0) => {
                    trace!("{} reached end of stream", side);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Read from {} failed: {}", side, e);
                    break;
                }
            };

            // The buffer is reused by the next read, so the chunk gets its own copy
            let chunk = Bytes::copy_from_slice(&buf[..n]);

            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(Some(chunk)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tx.send(None) => {}
        }
    })
}
