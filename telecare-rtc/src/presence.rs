//! Presence synchronization
//!
//! Writes this participant's presence record on join and deletes it on
//! leave, and mirrors the session's presence feed into the registry so
//! remote entries get display names. Every failure here is logged and
//! swallowed: media keeps working without the metadata store.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PresenceSettings;
use crate::error::{bounded, MediaError};
use crate::registry::RemoteTrackRegistry;
use crate::store::PresenceStore;
use crate::types::SessionIdentity;
use telecare_core::models::{PresenceKey, PresenceRecord};

/// Why a single watch run returned
enum WatchExit {
    /// The feed was open and then ended
    Ended,
    /// The feed could not be opened
    OpenFailed(MediaError),
    /// Cancelled, or the registry went away
    Stopped,
}

pub struct PresenceSynchronizer {
    store: Arc<dyn PresenceStore>,
    settings: PresenceSettings,
    identity: SessionIdentity,
    registry: RemoteTrackRegistry,
    cancel: CancellationToken,
    announce: Option<JoinHandle<()>>,
    watch: Option<JoinHandle<()>>,
}

impl PresenceSynchronizer {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        settings: PresenceSettings,
        identity: SessionIdentity,
        registry: RemoteTrackRegistry,
    ) -> Self {
        Self {
            store,
            settings,
            identity,
            registry,
            cancel: CancellationToken::new(),
            announce: None,
            watch: None,
        }
    }

    fn key(&self) -> PresenceKey {
        PresenceKey::new(
            self.identity.session.clone(),
            self.identity.participant.clone(),
        )
    }

    /// Name actually written for `display_name`
    #[must_use]
    pub fn effective_name(&self, display_name: &str) -> String {
        let trimmed = display_name.trim();
        if trimmed.is_empty() {
            self.settings.default_display_name.clone()
        } else {
            trimmed.to_string()
        }
    }

    /// Write the presence record in the background. Returns immediately.
    pub fn announce(&mut self, display_name: &str) {
        let record = PresenceRecord::new(
            self.identity.session.clone(),
            self.identity.participant.clone(),
            self.effective_name(display_name),
        );
        let store = Arc::clone(&self.store);
        let limit = self.settings.operation_timeout;

        let task = tokio::spawn(async move {
            let session = &record.session;
            if let Err(e) = bounded(limit, "room get-or-create", store.ensure_room(session)).await {
                warn!(session_id = %session, error = %e, "Room document unavailable");
            }

            let key = record.key();
            match bounded(limit, "presence put", store.put(&key, &record)).await {
                Ok(()) => info!(
                    path = %key.path(),
                    display_name = %record.display_name,
                    "Presence record written"
                ),
                Err(e) => warn!(path = %key.path(), error = %e, "Writing presence record failed"),
            }
        });

        if let Some(previous) = self.announce.replace(task) {
            previous.abort();
        }
    }

    /// Mirror the session's presence feed into the registry until retired.
    /// A dropped feed is reopened with exponential backoff.
    pub fn start_watch(&mut self) {
        if self.watch.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let settings = self.settings.clone();
        let identity = self.identity.clone();
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();

        self.watch = Some(tokio::spawn(async move {
            let mut backoff = watch_backoff(&settings);

            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match run_watch(&*store, &settings, &identity, &registry, &cancel).await {
                    WatchExit::Stopped => {
                        debug!(session_id = %identity.session, "Presence watch stopped");
                        return;
                    }
                    WatchExit::Ended => {
                        // The store was reachable; start over from the shortest delay
                        warn!(session_id = %identity.session, "Presence feed ended, reopening");
                        backoff = watch_backoff(&settings);
                    }
                    WatchExit::OpenFailed(e) => {
                        warn!(
                            session_id = %identity.session,
                            error = %e,
                            "Opening presence feed failed"
                        );
                    }
                }

                let Some(delay) = backoff.next() else {
                    error!(
                        session_id = %identity.session,
                        retries = settings.watch_max_retries,
                        "Presence feed abandoned, display names will not update"
                    );
                    return;
                };

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }));
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watch.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop watching and delete the presence record. Never fails.
    pub async fn retire(&mut self) {
        self.cancel.cancel();
        if let Some(watch) = self.watch.take() {
            let _ = watch.await;
        }

        // A late put must not resurrect the record after the delete
        if let Some(announce) = self.announce.take() {
            let _ = announce.await;
        }

        let key = self.key();
        match bounded(
            self.settings.operation_timeout,
            "presence delete",
            self.store.delete(&key),
        )
        .await
        {
            Ok(()) => debug!(path = %key.path(), "Presence record deleted"),
            Err(e) => warn!(path = %key.path(), error = %e, "Deleting presence record failed"),
        }
    }
}

impl Drop for PresenceSynchronizer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn watch_backoff(settings: &PresenceSettings) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(settings.watch_initial_backoff)
        .with_max_delay(settings.watch_max_backoff)
        .with_max_times(settings.watch_max_retries)
        .with_jitter()
        .build()
}

async fn run_watch(
    store: &dyn PresenceStore,
    settings: &PresenceSettings,
    identity: &SessionIdentity,
    registry: &RemoteTrackRegistry,
    cancel: &CancellationToken,
) -> WatchExit {
    let opened = tokio::select! {
        () = cancel.cancelled() => return WatchExit::Stopped,
        opened = bounded(
            settings.operation_timeout,
            "presence watch",
            store.watch(&identity.session),
        ) => opened,
    };
    let mut feed = match opened {
        Ok(feed) => feed,
        Err(e) => return WatchExit::OpenFailed(e),
    };

    debug!(
        scope = %PresenceKey::scope_prefix(&identity.session),
        "Presence feed open"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => return WatchExit::Stopped,
            change = feed.next() => match change {
                Some(change) => {
                    if registry.apply_presence(change).await.is_err() {
                        return WatchExit::Stopped;
                    }
                }
                None => return WatchExit::Ended,
            },
        }
    }
}
