use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::events::ExecEvent;

/// How long a subscriber may wait without receiving any event before it
/// deregisters itself.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Capacity of each subscriber's event queue. A subscriber that falls this
/// far behind is treated as a broken transport and dropped.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Why a subscriber left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The stream finished normally (terminal event, session closed, or the
    /// transport hung up).
    Completed,
    /// No event arrived within the idle timeout.
    TimedOut,
    /// The transport reported an error or could not keep up.
    TransportError,
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<ExecEvent>,
}

struct RegistryInner {
    slots: RwLock<HashMap<String, Slot>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
    buffer: usize,
}

/// Concurrent map from session identifier to its single live subscriber.
///
/// The registry only holds the sending half of each subscriber's queue, so a
/// session never owns its viewer and a viewer never keeps a session alive.
/// Sends are non-blocking: an event that cannot be queued is dropped and the
/// subscriber is deregistered.
#[derive(Clone)]
pub struct EventChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for EventChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannelRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_IDLE_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_limits(idle_timeout: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                idle_timeout,
                buffer: buffer.max(1),
            }),
        }
    }

    /// Attach a new subscriber to `session_id`, replacing any previous one.
    ///
    /// The subscriber's queue already holds the `start` event when this
    /// returns. A replaced subscriber drains whatever it had queued and then
    /// ends.
    pub fn attach(&self, session_id: &str) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Fresh queue with capacity >= 1, so this cannot fail.
        let _ = tx.try_send(ExecEvent::start(session_id));

        let previous = self
            .inner
            .slots
            .write()
            .insert(session_id.to_string(), Slot { id, tx });
        if previous.is_some() {
            tracing::debug!(session = %session_id, "replaced existing subscriber");
        }
        tracing::debug!(session = %session_id, subscriber = id, "subscriber attached");

        Subscriber {
            session_id: session_id.to_string(),
            id,
            rx,
            idle_timeout: self.inner.idle_timeout,
            registry: self.clone(),
            finished: false,
            saw_terminal: false,
        }
    }

    /// Deliver `event` to the session's subscriber, if one is attached.
    ///
    /// Returns whether the event was queued. Delivery failures are logged and
    /// deregister the subscriber; they are never reported as errors.
    pub fn emit(&self, session_id: &str, event: ExecEvent) -> bool {
        let failed = {
            let slots = self.inner.slots.read();
            let Some(slot) = slots.get(session_id) else {
                return false;
            };
            match slot.tx.try_send(event) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    tracing::error!(
                        session = %session_id,
                        event = ev.name(),
                        "subscriber queue full, dropping event and subscriber"
                    );
                    slot.id
                }
                Err(mpsc::error::TrySendError::Closed(ev)) => {
                    tracing::debug!(
                        session = %session_id,
                        event = ev.name(),
                        "subscriber gone, dropping event"
                    );
                    slot.id
                }
            }
        };
        self.deregister(session_id, failed);
        false
    }

    /// Remove the subscriber `subscriber_id` from `session_id`.
    ///
    /// A no-op if that subscriber has already been removed or replaced.
    /// Returns whether anything was removed.
    pub fn deregister(&self, session_id: &str, subscriber_id: u64) -> bool {
        let mut slots = self.inner.slots.write();
        match slots.get(session_id) {
            Some(slot) if slot.id == subscriber_id => {
                slots.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Close whatever subscriber is attached to `session_id`. Events already
    /// queued are still delivered before its stream ends.
    pub fn close(&self, session_id: &str) -> bool {
        self.inner.slots.write().remove(session_id).is_some()
    }

    /// Close every subscriber.
    pub fn close_all(&self) {
        self.inner.slots.write().clear();
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.inner.slots.read().contains_key(session_id)
    }

    /// Number of sessions with a live subscriber.
    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of one session's event stream.
///
/// Dropping the subscriber deregisters it. It also deregisters itself after
/// the idle timeout, after a terminal event, or when [`Subscriber::fail`] is
/// called by the transport.
pub struct Subscriber {
    session_id: String,
    id: u64,
    rx: mpsc::Receiver<ExecEvent>,
    idle_timeout: Duration,
    registry: EventChannelRegistry,
    finished: bool,
    saw_terminal: bool,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the subscriber has left the registry.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the stream is over: after a terminal event, when
    /// the session closes the channel, or when nothing arrives within the
    /// idle timeout.
    pub async fn recv(&mut self) -> Option<ExecEvent> {
        if self.finished {
            return None;
        }
        if self.saw_terminal {
            self.finish(DetachReason::Completed);
            return None;
        }
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                self.saw_terminal = event.is_terminal();
                Some(event)
            }
            Ok(None) => {
                self.finish(DetachReason::Completed);
                None
            }
            Err(_) => {
                self.finish(DetachReason::TimedOut);
                None
            }
        }
    }

    /// Take the next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ExecEvent> {
        if self.finished || self.saw_terminal {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => {
                self.saw_terminal = event.is_terminal();
                Some(event)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finish(DetachReason::Completed);
                None
            }
        }
    }

    /// Report a transport failure. The subscriber is deregistered and no
    /// further events are delivered to it.
    pub fn fail(mut self, error: impl std::fmt::Display) {
        tracing::error!(session = %self.session_id, %error, "subscriber transport error");
        self.finish(DetachReason::TransportError);
    }

    /// Deregister with an explicit reason. Idempotent.
    pub fn finish(&mut self, reason: DetachReason) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rx.close();
        self.registry.deregister(&self.session_id, self.id);
        match reason {
            DetachReason::Completed => {
                tracing::debug!(session = %self.session_id, "subscriber completed")
            }
            DetachReason::TimedOut => {
                tracing::warn!(session = %self.session_id, "subscriber idle timeout")
            }
            DetachReason::TransportError => {
                tracing::debug!(session = %self.session_id, "subscriber deregistered after transport error")
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.finish(DetachReason::Completed);
    }
}
