//! Rule dispatch loop
//!
//! Waits on every control stream at once and applies each event to the
//! firewall as it arrives. The first stream to end takes the whole dispatcher
//! down with it: half of a rule-synchronization feed is never applied on its
//! own.

use chatgate_proto::{RuleKind, MAX_RULE_FRAME};
use chatgate_transport::{dial_tls, TlsClientConfig, TransportError};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlResources, ControlSource, ControlStream, EndSignal, RuleWire};
use crate::firewall::Firewall;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to connect control stream {stream}: {source}")]
    Dial {
        stream: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Size of the pooled read buffers
    pub buffer_size: usize,

    /// Largest rule payload accepted
    pub max_rule_frame: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            max_rule_frame: MAX_RULE_FRAME,
        }
    }
}

/// Why a dispatcher stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEnd {
    /// The named control stream ended, failed, or sent a bad frame
    StreamEnded(&'static str),
    /// Cancelled from outside
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Firewall calls made
    pub applied: u64,
    pub ended_by: DispatchEnd,
}

pub struct RuleDispatcher {
    primary: ControlStream,
    secondary: Option<ControlStream>,
    ended: EndSignal,
    cancel: CancellationToken,
}

impl RuleDispatcher {
    /// Canonical topology: one stream of tagged events
    pub fn single<R>(
        reader: R,
        resources: &ControlResources,
        shutdown: &CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let cancel = shutdown.child_token();
        let ended = EndSignal::default();
        let primary = ControlStream::spawn(
            "control",
            reader,
            RuleWire::Tagged,
            resources,
            ended.clone(),
            cancel.clone(),
        );

        Self {
            primary,
            secondary: None,
            ended,
            cancel,
        }
    }

    /// Split topology: kinds are implied by the stream each rule arrives on
    pub fn split<I, D>(
        inserts: I,
        deletes: D,
        resources: &ControlResources,
        shutdown: &CancellationToken,
    ) -> Self
    where
        I: AsyncRead + Send + Unpin + 'static,
        D: AsyncRead + Send + Unpin + 'static,
    {
        let cancel = shutdown.child_token();
        let ended = EndSignal::default();
        let primary = ControlStream::spawn(
            "insert",
            inserts,
            RuleWire::Implied(RuleKind::Insert),
            resources,
            ended.clone(),
            cancel.clone(),
        );
        let secondary = ControlStream::spawn(
            "delete",
            deletes,
            RuleWire::Implied(RuleKind::Delete),
            resources,
            ended.clone(),
            cancel.clone(),
        );

        Self {
            primary,
            secondary: Some(secondary),
            ended,
            cancel,
        }
    }

    /// Dial every stream of `source` over TLS and start reading them.
    ///
    /// All dials must succeed before any stream is read.
    pub async fn connect(
        source: &ControlSource,
        tls: &TlsClientConfig,
        resources: &ControlResources,
        shutdown: &CancellationToken,
    ) -> Result<Self, DispatchError> {
        let connector = tls.build_connector().map_err(|source| DispatchError::Dial {
            stream: "control",
            source,
        })?;

        match source {
            ControlSource::Single(endpoint) => {
                let stream = dial_tls(&connector, endpoint)
                    .await
                    .map_err(|source| DispatchError::Dial {
                        stream: "control",
                        source,
                    })?;
                info!("Control stream connected to {}", endpoint);
                Ok(Self::single(stream, resources, shutdown))
            }
            ControlSource::Split { inserts, deletes } => {
                let insert_stream = dial_tls(&connector, inserts).await.map_err(|source| {
                    DispatchError::Dial {
                        stream: "insert",
                        source,
                    }
                })?;
                let delete_stream = dial_tls(&connector, deletes).await.map_err(|source| {
                    DispatchError::Dial {
                        stream: "delete",
                        source,
                    }
                })?;
                info!(
                    "Control streams connected (insert: {}, delete: {})",
                    inserts, deletes
                );
                Ok(Self::split(insert_stream, delete_stream, resources, shutdown))
            }
        }
    }

    /// Token that tears this dispatcher down when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply events until a stream ends or the dispatcher is cancelled.
    ///
    /// Every reader task has exited by the time this returns, so no firewall
    /// call can happen afterwards.
    pub async fn run<F>(self, firewall: &F) -> DispatchOutcome
    where
        F: Firewall + ?Sized,
    {
        let RuleDispatcher {
            mut primary,
            mut secondary,
            ended,
            cancel,
        } = self;
        let primary_name = primary.name();
        let secondary_name = secondary.as_ref().map_or("", |s| s.name());
        let mut applied = 0u64;

        let ended_by = loop {
            let (event, from) = tokio::select! {
                _ = cancel.cancelled() => break DispatchEnd::Shutdown,
                event = primary.next() => (event, primary_name),
                event = next_optional(&mut secondary) => (event, secondary_name),
            };

            let Some(event) = event else {
                break DispatchEnd::StreamEnded(from);
            };

            // Events queued on one stream before its own end are still applied;
            // once a sibling has ended, nothing more is
            match ended.ended() {
                Some(stream) if stream != from => break DispatchEnd::StreamEnded(stream),
                _ => {}
            }

            debug!(stream = from, kind = %event.kind, port = event.port, ip = %event.ip, "Applying rule");
            match event.kind {
                RuleKind::Insert => firewall.insert(event.port, event.ip).await,
                RuleKind::Delete => firewall.delete(event.port, event.ip).await,
            }
            applied += 1;
        };

        cancel.cancel();
        primary.join().await;
        if let Some(secondary) = secondary {
            secondary.join().await;
        }

        match ended_by {
            DispatchEnd::StreamEnded(stream) => {
                warn!(
                    "Control stream {} ended, dispatcher stopped after {} rule(s)",
                    stream, applied
                );
            }
            DispatchEnd::Shutdown => {
                info!("Dispatcher shut down after {} rule(s)", applied);
            }
        }

        DispatchOutcome { applied, ended_by }
    }
}

async fn next_optional(
    stream: &mut Option<ControlStream>,
) -> Option<chatgate_pool::Pooled<chatgate_proto::RuleEvent>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
