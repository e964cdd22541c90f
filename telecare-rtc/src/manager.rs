//! Session directory
//!
//! Process-wide map from `(session, participant)` to its coordinator, so at
//! most one live session exists per pair. Ended coordinators are swept out
//! in the background.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::coordinator::SessionCoordinator;
use crate::state::SessionPhase;
use crate::types::SessionIdentity;

pub struct SessionDirectory {
    sessions: DashMap<SessionIdentity, SessionCoordinator>,
}

impl SessionDirectory {
    /// Create the directory and start its cleanup task.
    /// Must be called inside a tokio runtime.
    pub fn new(cleanup_interval: Duration) -> Arc<Self> {
        let directory = Arc::new(Self {
            sessions: DashMap::new(),
        });

        tokio::spawn(Self::cleanup_task(
            Arc::downgrade(&directory),
            cleanup_interval,
        ));

        directory
    }

    /// Coordinator for `identity`, created with `make` when there is none
    /// or the existing one has already left
    pub fn get_or_create<F>(&self, identity: SessionIdentity, make: F) -> SessionCoordinator
    where
        F: FnOnce() -> SessionCoordinator,
    {
        match self.sessions.entry(identity) {
            Entry::Occupied(mut entry) => {
                if entry.get().phase() == SessionPhase::Left {
                    debug!(identity = %entry.key(), "Replacing ended session");
                    entry.insert(make());
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                info!(identity = %entry.key(), "Created session coordinator");
                entry.insert(make()).value().clone()
            }
        }
    }

    #[must_use]
    pub fn get(&self, identity: &SessionIdentity) -> Option<SessionCoordinator> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, identity: &SessionIdentity) -> Option<SessionCoordinator> {
        self.sessions.remove(identity).map(|(_, coordinator)| coordinator)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop coordinators that reached `Left`; returns how many went
    pub fn cleanup_ended(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, coordinator| coordinator.phase() != SessionPhase::Left);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, remaining = self.sessions.len(), "Removed ended sessions");
        }
        removed
    }

    /// Leave every session, e.g. on shutdown
    pub async fn leave_all(&self) {
        let coordinators: Vec<SessionCoordinator> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        join_all(coordinators.iter().map(SessionCoordinator::leave)).await;
        self.cleanup_ended();
    }

    async fn cleanup_task(directory: Weak<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.tick().await;
        info!(interval = ?every, "Starting session cleanup task");

        loop {
            ticker.tick().await;
            let Some(directory) = directory.upgrade() else {
                debug!("Session directory dropped, cleanup task exiting");
                return;
            };
            directory.cleanup_ended();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::Capabilities;
    use crate::loopback::{LoopbackDevices, LoopbackNetwork, LoopbackTransport, MemoryPresenceStore};

    fn coordinator() -> SessionCoordinator {
        SessionCoordinator::new(
            CoordinatorConfig::default(),
            Capabilities {
                transport: Arc::new(LoopbackTransport::new(LoopbackNetwork::new())),
                devices: Arc::new(LoopbackDevices::new()),
                presence: Arc::new(MemoryPresenceStore::new()),
            },
        )
    }

    fn identity() -> SessionIdentity {
        SessionIdentity::new("appt-42".into(), "doc-1".into())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_coordinator() {
        let directory = SessionDirectory::new(Duration::from_secs(60));
        let first = directory.get_or_create(identity(), coordinator);
        first
            .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
            .await
            .unwrap();

        let second = directory.get_or_create(identity(), || panic!("must reuse"));
        assert_eq!(second.phase(), SessionPhase::Joined);
        assert_eq!(directory.session_count(), 1);
    }

    #[tokio::test]
    async fn test_left_session_is_replaced() {
        let directory = SessionDirectory::new(Duration::from_secs(60));
        let first = directory.get_or_create(identity(), coordinator);
        first
            .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
            .await
            .unwrap();
        first.leave().await;

        let second = directory.get_or_create(identity(), coordinator);
        assert_eq!(second.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_cleanup_and_remove() {
        let directory = SessionDirectory::new(Duration::from_secs(60));
        let other = SessionIdentity::new("appt-42".into(), "pat-2".into());
        directory.get_or_create(identity(), coordinator);
        directory.get_or_create(other.clone(), coordinator);

        assert_eq!(directory.cleanup_ended(), 0);
        assert!(directory.remove(&other).is_some());
        assert!(directory.get(&other).is_none());

        directory.leave_all().await;
        assert_eq!(directory.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let directory = SessionDirectory::new(Duration::from_secs(1));
        let session = directory.get_or_create(identity(), coordinator);
        session
            .join("appt-42".into(), "doc-1".into(), "Dr. Silva")
            .await
            .unwrap();
        session.leave().await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(directory.session_count(), 0);
    }
}
