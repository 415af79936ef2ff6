//! Control stream readers
//!
//! Each control connection gets one reader task that turns frames into pooled
//! [`RuleEvent`]s. The task delivers `None` once when the stream ends, fails,
//! or carries a frame that does not decode, and then stops.

use std::sync::{Arc, OnceLock};

use chatgate_pool::{BufferPool, Pool, Pooled};
use chatgate_proto::{FrameCodec, RuleEvent, RuleKind, WireMessage};
use chatgate_transport::Endpoint;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dispatcher::DispatcherConfig;

/// How rule kinds are carried on a control stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleWire {
    /// Every frame is a full `RuleEvent` with its own kind
    Tagged,
    /// Frames are `RuleSpec`s; every event on the stream has this kind
    Implied(RuleKind),
}

/// Where control streams come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSource {
    /// One stream of tagged events
    Single(Endpoint),
    /// Separate insertion and deletion streams
    Split { inserts: Endpoint, deletes: Endpoint },
}

/// Pools and codec shared by every control stream of a dispatcher
#[derive(Debug, Clone)]
pub struct ControlResources {
    pub codec: FrameCodec,
    pub buffers: Arc<BufferPool>,
    pub events: Arc<Pool<RuleEvent>>,
}

impl ControlResources {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.max_rule_frame),
            buffers: Arc::new(BufferPool::new(config.buffer_size)),
            events: Arc::new(Pool::default()),
        }
    }
}

/// Records the first control stream of a dispatcher to end.
///
/// Readers trip it before queueing their end sentinel, so the dispatcher can
/// refuse events from a sibling stream that are still queued behind it.
#[derive(Debug, Clone, Default)]
pub struct EndSignal(Arc<OnceLock<&'static str>>);

impl EndSignal {
    /// Mark `stream` as ended; only the first call wins
    pub fn trip(&self, stream: &'static str) {
        let _ = self.0.set(stream);
    }

    /// Name of the first stream that ended, if any
    pub fn ended(&self) -> Option<&'static str> {
        self.0.get().copied()
    }
}

/// Decoded events from one control connection; `None` ends the stream
pub struct ControlStream {
    name: &'static str,
    events: mpsc::Receiver<Option<Pooled<RuleEvent>>>,
    task: JoinHandle<()>,
}

impl ControlStream {
    pub fn spawn<R>(
        name: &'static str,
        mut reader: R,
        wire: RuleWire,
        resources: &ControlResources,
        ended: EndSignal,
        cancel: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, events) = mpsc::channel(1);
        let ControlResources {
            codec,
            buffers,
            events: pool,
        } = resources.clone();

        let task = tokio::spawn(async move {
            let mut buf = buffers.get();

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = codec.read_frame(&mut reader, &mut buf[..]) => frame,
                };

                let n = match frame {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        debug!("Control stream {} closed by peer", name);
                        break;
                    }
                    Err(e) => {
                        warn!("Control stream {} failed: {}", name, e);
                        break;
                    }
                };

                let mut event = pool.get();
                let decoded = match wire {
                    RuleWire::Tagged => event.decode_into(&buf[..n]),
                    RuleWire::Implied(kind) => event.decode_spec_into(&buf[..n], kind),
                };
                if let Err(e) = decoded {
                    warn!("Control stream {} sent an undecodable rule: {}", name, e);
                    break;
                }
                trace!(
                    stream = name,
                    kind = %event.kind,
                    port = event.port,
                    ip = %event.ip,
                    "Rule event decoded"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(Some(event)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            ended.trip(name);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.send(None) => {}
            }
        });

        Self { name, events, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Next event, or `None` once the stream has ended for any reason
    pub async fn next(&mut self) -> Option<Pooled<RuleEvent>> {
        self.events.recv().await.flatten()
    }

    /// Wait for the reader task to exit (after it has been cancelled)
    pub(crate) async fn join(self) {
        drop(self.events);
        if let Err(e) = self.task.await {
            warn!("Control stream {} reader failed: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_proto::RuleSpec;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_tagged_stream_yields_events_then_sentinel() {
        let resources = ControlResources::new(&DispatcherConfig::default());
        let (reader, mut writer) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let ended = EndSignal::default();
        let mut stream = ControlStream::spawn(
            "control",
            reader,
            RuleWire::Tagged,
            &resources,
            ended.clone(),
            cancel,
        );

        resources
            .codec
            .write_frame(&mut writer, &RuleEvent::insert(80, ip("1.2.3.4")))
            .await
            .unwrap();
        drop(writer);

        let event = stream.next().await.unwrap();
        assert_eq!(*event, RuleEvent::insert(80, ip("1.2.3.4")));
        drop(event);

        assert!(stream.next().await.is_none());
        assert_eq!(ended.ended(), Some("control"));
        stream.join().await;
        assert_eq!(resources.events.idle(), 1);
    }

    #[tokio::test]
    async fn test_implied_stream_forces_kind() {
        let resources = ControlResources::new(&DispatcherConfig::default());
        let (reader, mut writer) = tokio::io::duplex(1024);
        let mut stream = ControlStream::spawn(
            "delete",
            reader,
            RuleWire::Implied(RuleKind::Delete),
            &resources,
            EndSignal::default(),
            CancellationToken::new(),
        );

        let spec = RuleSpec {
            port: 443,
            ip: ip("5.6.7.8"),
        };
        resources.codec.write_frame(&mut writer, &spec).await.unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(*event, RuleEvent::delete(443, ip("5.6.7.8")));
    }

    #[tokio::test]
    async fn test_undecodable_frame_ends_stream() {
        let resources = ControlResources::new(&DispatcherConfig::default());
        let (reader, mut writer) = tokio::io::duplex(1024);
        let mut stream = ControlStream::spawn(
            "control",
            reader,
            RuleWire::Tagged,
            &resources,
            EndSignal::default(),
            CancellationToken::new(),
        );

        let mut frame = 2u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xde, 0xad]);
        tokio::io::AsyncWriteExt::write_all(&mut writer, &frame)
            .await
            .unwrap();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_reader() {
        let resources = ControlResources::new(&DispatcherConfig::default());
        let (reader, _writer) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let ended = EndSignal::default();
        let stream = ControlStream::spawn(
            "control",
            reader,
            RuleWire::Tagged,
            &resources,
            ended.clone(),
            cancel.clone(),
        );

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), stream.join())
            .await
            .expect("reader task did not stop");

        // Cancellation is not the stream ending
        assert_eq!(ended.ended(), None);
    }
}
