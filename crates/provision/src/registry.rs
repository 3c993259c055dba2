//! Session registry.
//!
//! Owns session records (through an injected [`SessionStore`]), their event
//! logs on the [`StatusBus`] and their cancellation tokens. Records are only
//! removed by explicit deletion or age-based eviction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::mac::HardwareAddress;
use crate::session::{
    Credentials, NetworkParams, Session, SessionId, SessionSnapshot, TimelineEntry,
};
use crate::status::{EventPublisher, StatusBus};

/// Storage for session records.
///
/// Implementations must make each call atomic with respect to others; the
/// registry never holds a store lock across a collaborator call.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new record; fails if the id already exists.
    async fn insert(&self, session: Session) -> Result<(), RegistryError>;

    /// Load a record.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, RegistryError>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<Session>, RegistryError>;

    /// Remove a record, returning it if present.
    async fn remove(&self, id: SessionId) -> Result<Option<Session>, RegistryError>;

    /// Remove every record created strictly before `cutoff`.
    async fn remove_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, RegistryError>;
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(RegistryError::Store(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, RegistryError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, RegistryError> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn remove(&self, id: SessionId) -> Result<Option<Session>, RegistryError> {
        Ok(self.sessions.write().await.remove(&id))
    }

    async fn remove_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }
}

/// Everything the orchestrator needs to run a freshly created session.
pub struct NewSession {
    pub session: Session,
    pub publisher: EventPublisher,
    pub cancel: CancellationToken,
}

impl NewSession {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id
    }
}

/// Which sessions to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionFilter {
    #[default]
    All,
    Active,
    Completed,
}

/// Live and recently finished provisioning sessions.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    bus: Arc<StatusBus>,
    cancellations: RwLock<HashMap<SessionId, CancellationToken>>,
}

impl SessionRegistry {
    /// Registry backed by an in-memory store.
    #[must_use]
    pub fn in_memory(bus: Arc<StatusBus>) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), bus)
    }

    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, bus: Arc<StatusBus>) -> Self {
        Self {
            store,
            bus,
            cancellations: RwLock::new(HashMap::new()),
        }
    }

    /// The bus holding this registry's event logs.
    #[must_use]
    pub fn bus(&self) -> &Arc<StatusBus> {
        &self.bus
    }

    /// Register a new session and open its event log.
    pub async fn create(
        &self,
        hardware_address: HardwareAddress,
        credentials: Credentials,
        network_params: NetworkParams,
    ) -> Result<NewSession, RegistryError> {
        let session = Session::new(hardware_address, credentials, network_params);
        let id = session.id;

        self.store.insert(session.clone()).await?;
        let publisher = match self.bus.open(id).await {
            Ok(publisher) => publisher,
            Err(e) => {
                self.store.remove(id).await?;
                return Err(e.into());
            }
        };
        let cancel = CancellationToken::new();
        self.cancellations.write().await.insert(id, cancel.clone());

        info!(
            session_id = %id,
            hardware_address = %hardware_address,
            "Created provisioning session"
        );

        Ok(NewSession {
            session,
            publisher,
            cancel,
        })
    }

    async fn session(&self, id: SessionId) -> Result<Session, RegistryError> {
        self.store
            .get(id)
            .await?
            .ok_or(RegistryError::SessionNotFound(id))
    }

    /// Current snapshot of one session.
    pub async fn get(&self, id: SessionId) -> Result<SessionSnapshot, RegistryError> {
        let session = self.session(id).await?;
        let events = self.bus.read_since(id, 0).await?;
        Ok(SessionSnapshot::from_events(&session, &events))
    }

    /// Every event of a session with its offset from creation.
    pub async fn timeline(&self, id: SessionId) -> Result<Vec<TimelineEntry>, RegistryError> {
        let session = self.session(id).await?;
        let events = self.bus.read_since(id, 0).await?;
        Ok(TimelineEntry::build(&session, events))
    }

    /// Snapshots for diagnostics, oldest first.
    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionSnapshot>, RegistryError> {
        let mut snapshots = Vec::new();
        for session in self.store.list().await? {
            // a concurrent eviction may have dropped the log already
            let Ok(events) = self.bus.read_since(session.id, 0).await else {
                continue;
            };
            let snapshot = SessionSnapshot::from_events(&session, &events);
            let keep = match filter {
                SessionFilter::All => true,
                SessionFilter::Active => !snapshot.is_complete,
                SessionFilter::Completed => snapshot.is_complete,
            };
            if keep {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Sessions without a terminal event.
    pub async fn list_active(&self) -> Result<Vec<SessionSnapshot>, RegistryError> {
        self.list(SessionFilter::Active).await
    }

    /// Sessions that reached a terminal event.
    pub async fn list_completed(&self) -> Result<Vec<SessionSnapshot>, RegistryError> {
        self.list(SessionFilter::Completed).await
    }

    /// Request cancellation; `Ok(false)` if the session already finished.
    pub async fn cancel(&self, id: SessionId) -> Result<bool, RegistryError> {
        let snapshot = self.get(id).await?;
        if snapshot.is_complete {
            return Ok(false);
        }
        if let Some(token) = self.cancellations.read().await.get(&id) {
            token.cancel();
        }
        info!(session_id = %id, "Cancellation requested");
        Ok(true)
    }

    /// Remove a session, its cancellation token and its event log.
    pub async fn delete(&self, id: SessionId) -> Result<(), RegistryError> {
        if self.store.remove(id).await?.is_none() {
            return Err(RegistryError::SessionNotFound(id));
        }
        self.forget(id).await;
        info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Evict sessions created more than `max_age` ago.
    pub async fn evict_older_than(&self, max_age: Duration) -> Result<usize, RegistryError> {
        self.evict_older_than_at(Utc::now(), max_age).await
    }

    /// Evict sessions with `now - created_at > max_age`.
    pub async fn evict_older_than_at(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<usize, RegistryError> {
        let expired = self.store.remove_created_before(now - max_age).await?;
        for id in &expired {
            self.forget(*id).await;
            debug!(session_id = %id, "Evicted session");
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Evicted old sessions");
        }
        Ok(expired.len())
    }

    // Store record is already gone; drop the rest and stop any in-flight run.
    async fn forget(&self, id: SessionId) {
        if let Some(token) = self.cancellations.write().await.remove(&id) {
            token.cancel();
        }
        self.bus.remove(id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::status::EventKind;

    fn mac() -> HardwareAddress {
        HardwareAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::in_memory(Arc::new(StatusBus::new()))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry();
        let new = registry
            .create(mac(), Credentials::empty(), NetworkParams::default())
            .await
            .unwrap();

        let snapshot = registry.get(new.id()).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Created);
        assert_eq!(snapshot.hardware_address, mac());
        assert_eq!(snapshot.total_updates, 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let registry = registry();
        let id = SessionId::new();
        assert_eq!(
            registry.get(id).await.unwrap_err(),
            RegistryError::SessionNotFound(id)
        );
        assert_eq!(
            registry.delete(id).await.unwrap_err(),
            RegistryError::SessionNotFound(id)
        );
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_unique_ids() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .create(mac(), Credentials::empty(), NetworkParams::default())
                    .await
                    .unwrap()
                    .id()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.list(SessionFilter::All).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_eviction_respects_retention_window() {
        let registry = registry();
        let new = registry
            .create(mac(), Credentials::empty(), NetworkParams::default())
            .await
            .unwrap();
        let id = new.id();
        let created_at = new.session.created_at;
        let window = Duration::hours(24);
        let epsilon = Duration::seconds(1);

        let evicted = registry
            .evict_older_than_at(created_at + window - epsilon, window)
            .await
            .unwrap();
        assert_eq!(evicted, 0);
        assert!(registry.get(id).await.is_ok());

        let evicted = registry
            .evict_older_than_at(created_at + window + epsilon, window)
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(
            registry.get(id).await.unwrap_err(),
            RegistryError::SessionNotFound(id)
        );
        assert!(registry.bus().read_since(id, 0).await.is_err());
        assert!(new.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_filters_and_cancel() {
        let registry = registry();
        let running = registry
            .create(mac(), Credentials::empty(), NetworkParams::default())
            .await
            .unwrap();
        let finished = registry
            .create(mac(), Credentials::empty(), NetworkParams::default())
            .await
            .unwrap();
        finished
            .publisher
            .append("done", EventKind::Success, SessionState::Completed)
            .await
            .unwrap();

        let active = registry.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, running.id());
        let completed = registry.list_completed().await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].session_id, finished.id());

        assert!(registry.cancel(running.id()).await.unwrap());
        assert!(running.cancel.is_cancelled());
        assert!(!registry.cancel(finished.id()).await.unwrap());
        assert!(!finished.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_delete_removes_log_and_record() {
        let registry = registry();
        let new = registry
            .create(mac(), Credentials::empty(), NetworkParams::default())
            .await
            .unwrap();
        registry.delete(new.id()).await.unwrap();
        assert!(registry.get(new.id()).await.is_err());
        assert!(registry.bus().latest(new.id()).await.is_err());
        assert!(registry.list(SessionFilter::All).await.unwrap().is_empty());
    }
}
