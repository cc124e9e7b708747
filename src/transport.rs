//! Transport seam between the protocol engine and the wireless stack.
//!
//! The engine only ever sees a resolved [`EndpointSet`] plus three operations:
//! write, subscribe and a merged notification stream. [`crate::ble`] provides the
//! btleplug implementation; tests drive the engine through a scripted fake.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::{
    error::{BipError, Result},
    types::{Endpoint, RetryPolicy, SyncEvent, WriteCapabilities, WriteMode},
};

/// One notification as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Endpoint the value arrived on
    pub endpoint: Endpoint,
    /// Notified value
    pub value: Bytes,
}

impl Notification {
    /// Create a notification
    pub fn new(endpoint: Endpoint, value: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            value: value.into(),
        }
    }
}

/// Endpoints resolved on the connected watch and their write capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: HashMap<Endpoint, WriteCapabilities>,
}

impl EndpointSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint (builder style)
    #[must_use]
    pub fn with(mut self, endpoint: Endpoint, capabilities: WriteCapabilities) -> Self {
        self.insert(endpoint, capabilities);
        self
    }

    /// Add or replace an endpoint
    pub fn insert(&mut self, endpoint: Endpoint, capabilities: WriteCapabilities) {
        self.endpoints.insert(endpoint, capabilities);
    }

    /// Check whether an endpoint was resolved
    #[must_use]
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.endpoints.contains_key(&endpoint)
    }

    /// Capabilities of an endpoint, if resolved
    #[must_use]
    pub fn capabilities(&self, endpoint: Endpoint) -> Option<WriteCapabilities> {
        self.endpoints.get(&endpoint).copied()
    }

    /// Capabilities of an endpoint that must be present
    ///
    /// # Errors
    ///
    /// Returns [`BipError::MissingEndpoint`] if the endpoint was not resolved.
    pub fn require(&self, endpoint: Endpoint) -> Result<WriteCapabilities> {
        self.capabilities(endpoint)
            .ok_or(BipError::MissingEndpoint { endpoint })
    }
}

/// Merged stream of notifications from every subscribed endpoint
pub type NotificationStream = BoxStream<'static, Notification>;

/// Contract the protocol engine needs from the wireless transport
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Endpoints resolved on this connection
    fn endpoints(&self) -> &EndpointSet;

    /// Write `data` to an endpoint using the given mode
    async fn write(&self, endpoint: Endpoint, data: &[u8], mode: WriteMode) -> Result<()>;

    /// Enable notifications on an endpoint
    async fn subscribe(&self, endpoint: Endpoint) -> Result<()>;

    /// Disable notifications on an endpoint
    async fn unsubscribe(&self, endpoint: Endpoint) -> Result<()>;

    /// Open a stream of notifications from all subscribed endpoints
    ///
    /// Only notifications arriving after the call are delivered.
    async fn notifications(&self) -> Result<NotificationStream>;
}

/// Optional channel for progress and completion events
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<SyncEvent>>);

impl EventSink {
    /// Sink that drops every event
    #[must_use]
    pub const fn disabled() -> Self {
        Self(None)
    }

    /// Create a sink and the receiver for its events
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    /// Deliver an event; a closed receiver is ignored
    pub fn emit(&self, event: SyncEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event);
        }
    }
}

/// Serialized command writer shared by the handshake and the fetch session
///
/// Only one write is in flight at a time: a second caller waits on the gate
/// instead of racing the first one on the GATT queue.
pub struct CommandWriter {
    transport: Arc<dyn FrameTransport>,
    gate: Mutex<()>,
    policy: RetryPolicy,
}

impl CommandWriter {
    /// Create a writer over a transport
    #[must_use]
    pub fn new(transport: Arc<dyn FrameTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            gate: Mutex::new(()),
            policy,
        }
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }

    /// Preferred write mode for an endpoint
    ///
    /// Acknowledged writes go first where supported. Unacknowledged writes
    /// are the fallback.
    const fn primary_mode(capabilities: WriteCapabilities) -> Option<WriteMode> {
        if capabilities.with_response {
            Some(WriteMode::WithResponse)
        } else if capabilities.without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }

    fn writable(&self, endpoint: Endpoint) -> Result<WriteCapabilities> {
        let capabilities = self.transport.endpoints().require(endpoint)?;
        if !capabilities.is_writable() {
            return Err(BipError::Configuration(format!(
                "endpoint {endpoint} does not accept writes"
            )));
        }
        Ok(capabilities)
    }

    /// Write once, without retries
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint is missing or read-only,
    /// or the transport error of the single attempt.
    pub async fn write_once(&self, endpoint: Endpoint, data: &[u8], mode: WriteMode) -> Result<()> {
        let capabilities = self.writable(endpoint)?;
        let mode = if capabilities.supports(mode) {
            mode
        } else {
            mode.alternate()
        };

        let _guard = self.gate.lock().await;
        debug!("Writing {:02X?} to {} ({:?})", data, endpoint, mode);
        self.transport.write(endpoint, data, mode).await
    }

    /// Write with retries, escalating back-off and write-mode fallback
    ///
    /// Each attempt is preceded by a short settling pause. After a failed
    /// attempt the writer backs off and, when the endpoint supports both
    /// modes, immediately tries the alternate mode before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint is missing or read-only,
    /// or [`BipError::WriteFailed`] once every attempt is exhausted.
    pub async fn send(&self, endpoint: Endpoint, data: &[u8], label: &str) -> Result<()> {
        let capabilities = self.writable(endpoint)?;
        let Some(primary) = Self::primary_mode(capabilities) else {
            return Err(BipError::Configuration(format!(
                "endpoint {endpoint} does not accept writes"
            )));
        };
        let fallback = primary.alternate();
        let can_fall_back = capabilities.supports(fallback);
        let max_attempts = self.policy.max_attempts.max(1);

        let _guard = self.gate.lock().await;

        for attempt in 1..=max_attempts {
            tokio::time::sleep(Duration::from_millis(self.policy.settle_ms)).await;
            debug!(
                "Sync [{}] -> {} ({:?}) attempt {}/{}: {:02X?}",
                label, endpoint, primary, attempt, max_attempts, data
            );

            let err = match self.transport.write(endpoint, data, primary).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt == max_attempts {
                warn!("[{}] final attempt failed: {}", label, err);
                break;
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                "[{}] write to {} busy ({}), retrying in {}ms",
                label,
                endpoint,
                err,
                backoff.as_millis()
            );
            tokio::time::sleep(backoff).await;

            if can_fall_back {
                debug!("[{}] trying alternate write mode {:?}", label, fallback);
                match self.transport.write(endpoint, data, fallback).await {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!("[{}] alternate mode failed: {}", label, e),
                }
            }
        }

        error!("[{}] gave up after {} attempts", label, max_attempts);
        Err(BipError::WriteFailed {
            endpoint,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use futures::StreamExt;
    use std::{collections::VecDeque, sync::Mutex as StdMutex};
    use tokio::{sync::broadcast, time::Instant};

    type Responder = Box<dyn FnMut(Endpoint, &[u8]) -> Vec<Notification> + Send>;

    /// One recorded write attempt
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct WriteRecord {
        pub endpoint: Endpoint,
        pub data: Vec<u8>,
        pub mode: WriteMode,
        pub succeeded: bool,
        pub at: Instant,
    }

    /// Scripted in-memory transport
    pub(crate) struct MockTransport {
        endpoints: EndpointSet,
        notify_tx: broadcast::Sender<Notification>,
        writes: StdMutex<Vec<WriteRecord>>,
        failures: StdMutex<VecDeque<bool>>,
        responder: StdMutex<Option<Responder>>,
        subscriptions: StdMutex<Vec<Endpoint>>,
        refused: StdMutex<Vec<Endpoint>>,
    }

    impl MockTransport {
        pub(crate) fn new(endpoints: EndpointSet) -> Self {
            let (notify_tx, _) = broadcast::channel(4096);
            Self {
                endpoints,
                notify_tx,
                writes: StdMutex::new(Vec::new()),
                failures: StdMutex::new(VecDeque::new()),
                responder: StdMutex::new(None),
                subscriptions: StdMutex::new(Vec::new()),
                refused: StdMutex::new(Vec::new()),
            }
        }

        /// Watch exposing all four endpoints
        pub(crate) fn watch() -> Self {
            Self::new(
                EndpointSet::new()
                    .with(Endpoint::Auth, WriteCapabilities::BOTH)
                    .with(Endpoint::Control, WriteCapabilities::BOTH)
                    .with(Endpoint::Data, WriteCapabilities::NOTIFY_ONLY)
                    .with(Endpoint::Time, WriteCapabilities::ACKNOWLEDGED),
            )
        }

        /// Answer every successful write through `responder`
        pub(crate) fn respond_with(
            &self,
            responder: impl FnMut(Endpoint, &[u8]) -> Vec<Notification> + Send + 'static,
        ) {
            *self.responder.lock().unwrap() = Some(Box::new(responder));
        }

        /// Fail the next `count` writes
        pub(crate) fn fail_next_writes(&self, count: usize) {
            self.failures.lock().unwrap().extend(std::iter::repeat_n(true, count));
        }

        /// Reject every subscription to `endpoint`
        pub(crate) fn refuse_subscription(&self, endpoint: Endpoint) {
            self.refused.lock().unwrap().push(endpoint);
        }

        /// Push an unsolicited notification
        pub(crate) fn emit(&self, notification: Notification) {
            let _ = self.notify_tx.send(notification);
        }

        pub(crate) fn writes(&self) -> Vec<WriteRecord> {
            self.writes.lock().unwrap().clone()
        }

        /// Successful writes to one endpoint
        pub(crate) fn written_to(&self, endpoint: Endpoint) -> Vec<Vec<u8>> {
            self.writes()
                .into_iter()
                .filter(|w| w.endpoint == endpoint && w.succeeded)
                .map(|w| w.data)
                .collect()
        }

        pub(crate) fn subscriptions(&self) -> Vec<Endpoint> {
            self.subscriptions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameTransport for MockTransport {
        fn endpoints(&self) -> &EndpointSet {
            &self.endpoints
        }

        async fn write(&self, endpoint: Endpoint, data: &[u8], mode: WriteMode) -> Result<()> {
            let fail = self.failures.lock().unwrap().pop_front().unwrap_or(false);
            self.writes.lock().unwrap().push(WriteRecord {
                endpoint,
                data: data.to_vec(),
                mode,
                succeeded: !fail,
                at: Instant::now(),
            });
            if fail {
                return Err(BipError::Transport("GATT operation already in progress".into()));
            }

            let replies = self
                .responder
                .lock()
                .unwrap()
                .as_mut()
                .map(|respond| respond(endpoint, data))
                .unwrap_or_default();
            for reply in replies {
                let _ = self.notify_tx.send(reply);
            }
            Ok(())
        }

        async fn subscribe(&self, endpoint: Endpoint) -> Result<()> {
            if self.refused.lock().unwrap().contains(&endpoint) {
                return Err(BipError::Transport(format!("CCCD write to {endpoint} rejected")));
            }
            self.subscriptions.lock().unwrap().push(endpoint);
            Ok(())
        }

        async fn unsubscribe(&self, endpoint: Endpoint) -> Result<()> {
            self.subscriptions.lock().unwrap().retain(|e| *e != endpoint);
            Ok(())
        }

        async fn notifications(&self) -> Result<NotificationStream> {
            let rx = self.notify_tx.subscribe();
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(notification) => return Some((notification, rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        }
    }
}
