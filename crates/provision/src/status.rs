//! Per-session progress event logs.
//!
//! Each session owns one append-only log. Sequence numbers are assigned under
//! the log lock, start at 1 and have no gaps. Appends wake subscribers through
//! a `watch` channel carrying the latest sequence; subscribers then read
//! everything after their cursor, so a burst of appends between two wakeups
//! is never lost.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::StatusError;
use crate::session::{SessionId, SessionState};

/// Severity of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Info,
    Success,
    Error,
    Warning,
}

impl EventKind {
    /// `success` and `error` end a session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// One progress record. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: SessionId,
    pub sequence: u64,
    pub message: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// State the session entered with this event.
    pub state: SessionState,
    /// Error tag, only on `error` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Default)]
struct LogInner {
    events: Vec<StatusEvent>,
    removed: bool,
}

struct EventLog {
    session_id: SessionId,
    inner: RwLock<LogInner>,
    notify: watch::Sender<u64>,
}

impl EventLog {
    fn new(session_id: SessionId) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            session_id,
            inner: RwLock::new(LogInner::default()),
            notify,
        }
    }

    /// Events after `after`, and whether nothing more can follow them.
    ///
    /// The log is finished once it is removed or its last event is terminal.
    async fn since(&self, after: u64) -> (Vec<StatusEvent>, bool) {
        let inner = self.inner.read().await;
        // sequence n lives at index n - 1
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(inner.events.len());
        let finished = inner.removed || inner.events.last().is_some_and(|e| e.kind.is_terminal());
        (inner.events[start..].to_vec(), finished)
    }
}

/// Registry of per-session event logs.
#[derive(Default)]
pub struct StatusBus {
    logs: RwLock<HashMap<SessionId, Arc<EventLog>>>,
}

impl StatusBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the log for a session and return its only publisher.
    pub async fn open(&self, session_id: SessionId) -> Result<EventPublisher, StatusError> {
        let mut logs = self.logs.write().await;
        if logs.contains_key(&session_id) {
            return Err(StatusError::AlreadyOpen(session_id));
        }
        let log = Arc::new(EventLog::new(session_id));
        logs.insert(session_id, Arc::clone(&log));
        Ok(EventPublisher { log })
    }

    async fn log(&self, session_id: SessionId) -> Result<Arc<EventLog>, StatusError> {
        self.logs
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(StatusError::SessionNotFound(session_id))
    }

    /// Ordered events with `sequence > after_sequence`. Never waits.
    pub async fn read_since(
        &self,
        session_id: SessionId,
        after_sequence: u64,
    ) -> Result<Vec<StatusEvent>, StatusError> {
        let log = self.log(session_id).await?;
        Ok(log.since(after_sequence).await.0)
    }

    /// The most recent event, if any.
    pub async fn latest(&self, session_id: SessionId) -> Result<Option<StatusEvent>, StatusError> {
        let log = self.log(session_id).await?;
        let inner = log.inner.read().await;
        Ok(inner.events.last().cloned())
    }

    /// Number of events recorded so far.
    pub async fn len(&self, session_id: SessionId) -> Result<usize, StatusError> {
        let log = self.log(session_id).await?;
        let inner = log.inner.read().await;
        Ok(inner.events.len())
    }

    /// Live feed of every event for the session, from the first one.
    pub async fn subscribe(&self, session_id: SessionId) -> Result<Subscription, StatusError> {
        self.subscribe_after(session_id, 0).await
    }

    /// Live feed resuming after `after_sequence`.
    pub async fn subscribe_after(
        &self,
        session_id: SessionId,
        after_sequence: u64,
    ) -> Result<Subscription, StatusError> {
        let log = self.log(session_id).await?;
        let changes = log.notify.subscribe();
        Ok(Subscription {
            log,
            changes,
            cursor: after_sequence,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Drop a session's log. Live subscriptions end after draining.
    pub async fn remove(&self, session_id: SessionId) -> bool {
        let removed = self.logs.write().await.remove(&session_id);
        match removed {
            Some(log) => {
                log.inner.write().await.removed = true;
                log.notify.send_modify(|_| {});
                true
            }
            None => false,
        }
    }
}

/// Sole writer for one session's log. Deliberately not `Clone`.
pub struct EventPublisher {
    log: Arc<EventLog>,
}

impl EventPublisher {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.log.session_id
    }

    /// The most recent event written through this publisher.
    pub async fn latest(&self) -> Option<StatusEvent> {
        self.log.inner.read().await.events.last().cloned()
    }

    /// Append a non-error event.
    pub async fn append(
        &self,
        message: impl Into<String>,
        kind: EventKind,
        state: SessionState,
    ) -> Result<StatusEvent, StatusError> {
        self.push(message.into(), kind, state, None).await
    }

    /// Append the terminal error event for a failure.
    pub async fn fail(
        &self,
        message: impl Into<String>,
        state: SessionState,
        error_kind: &str,
    ) -> Result<StatusEvent, StatusError> {
        self.push(message.into(), EventKind::Error, state, Some(error_kind.to_string()))
            .await
    }

    async fn push(
        &self,
        message: String,
        kind: EventKind,
        state: SessionState,
        error_kind: Option<String>,
    ) -> Result<StatusEvent, StatusError> {
        let event = {
            let mut inner = self.log.inner.write().await;
            if inner.events.last().is_some_and(|e| e.kind.is_terminal()) {
                return Err(StatusError::Closed(self.log.session_id));
            }
            let event = StatusEvent {
                session_id: self.log.session_id,
                sequence: inner.events.len() as u64 + 1,
                message,
                kind,
                occurred_at: Utc::now(),
                state,
                error_kind,
            };
            inner.events.push(event.clone());
            event
        };
        self.log.notify.send_replace(event.sequence);

        match event.kind {
            EventKind::Error => error!(
                session_id = %event.session_id,
                sequence = event.sequence,
                state = %event.state,
                "{}",
                event.message
            ),
            EventKind::Warning => warn!(
                session_id = %event.session_id,
                sequence = event.sequence,
                state = %event.state,
                "{}",
                event.message
            ),
            EventKind::Info | EventKind::Success => info!(
                session_id = %event.session_id,
                sequence = event.sequence,
                state = %event.state,
                "{}",
                event.message
            ),
        }
        Ok(event)
    }
}

/// In-order live feed of one session's events.
///
/// Ends after yielding the terminal event, or once the log is removed and
/// drained. Dropping it cancels the subscription.
pub struct Subscription {
    log: Arc<EventLog>,
    changes: watch::Receiver<u64>,
    cursor: u64,
    pending: VecDeque<StatusEvent>,
    done: bool,
}

impl Subscription {
    /// Sequence of the last event handed out.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next event, waiting for one to be appended if necessary.
    pub async fn next(&mut self) -> Option<StatusEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.cursor = event.sequence;
                if event.kind.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                }
                return Some(event);
            }
            if self.done {
                return None;
            }

            // Mark the current version seen before reading, so an append
            // racing with the read still wakes the `changed()` below.
            drop(self.changes.borrow_and_update());
            let (fresh, finished) = self.log.since(self.cursor).await;
            if !fresh.is_empty() {
                self.pending.extend(fresh);
                continue;
            }
            // resumed at or past the terminal event
            if finished || self.changes.changed().await.is_err() {
                self.done = true;
            }
        }
    }

    /// Like [`Subscription::next`], but returns `None` once `cancel` fires.
    pub async fn next_or_cancelled(&mut self, cancel: &CancellationToken) -> Option<StatusEvent> {
        tokio::select! {
            () = cancel.cancelled() => None,
            event = self.next() => event,
        }
    }

    /// Adapt into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }
}
