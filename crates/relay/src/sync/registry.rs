use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{Session, SessionHandle, SessionOptions, SessionTeardown};
use crate::config::PersistConfig;
use crate::metrics;
use crate::persist::{self, ContentStore, PersistenceAdapter};

/// Options applied to every session the registry creates.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub session: SessionOptions,
    pub persist: PersistConfig,
}

struct RegistryEntry {
    session_id: u64,
    handle: SessionHandle,
}

/// Final state write of an evicted session; flips to `true` when done.
struct PendingWrite {
    session_id: u64,
    done: watch::Receiver<bool>,
}

/// Process-wide map from document name to its live session.
///
/// At most one session exists per name. A session is created on first
/// reference and evicted as soon as its last connection closes; a caller that
/// locks an already evicted session asks the registry again and gets a fresh
/// one. That fresh session binds stored state only after the evicted
/// session's final write has landed.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, RegistryEntry>>,
    // Lock order: `sessions` before `pending_writes`.
    pending_writes: Mutex<HashMap<String, PendingWrite>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    content_store: Option<Arc<dyn ContentStore>>,
    options: RegistryOptions,
    next_session_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            pending_writes: Mutex::new(HashMap::new()),
            persistence: None,
            content_store: None,
            options,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn with_persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    pub fn with_content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content_store = Some(store);
        self
    }

    /// Return the live session for `name`, creating it when absent.
    ///
    /// A newly created session is published locked; concurrent callers for the
    /// same name block on that lock until stored state has been bound.
    pub async fn get_or_create(self: &Arc<Self>, name: &str) -> Result<SessionHandle> {
        let (handle, mut session, pending) = {
            let mut sessions = self.lock_sessions()?;
            if let Some(entry) = sessions.get(name) {
                return Ok(Arc::clone(&entry.handle));
            }

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let mut session = Session::new(name, self.options.session)?.with_id(session_id);
            let registry = Arc::downgrade(self);
            session.on_empty(move |teardown| {
                if let Some(registry) = registry.upgrade() {
                    registry.retire(teardown);
                }
            });

            let handle = Arc::new(tokio::sync::Mutex::new(session));
            let guard = Arc::clone(&handle)
                .try_lock_owned()
                .map_err(|_| anyhow!("new session for `{name}` is already locked"))?;
            sessions.insert(
                name.to_string(),
                RegistryEntry { session_id, handle: Arc::clone(&handle) },
            );
            metrics::set_active_sessions(sessions.len());
            let pending = self.pending_write(name).unwrap_or_else(|error| {
                warn!(doc = name, ?error, "cannot check for a pending state write");
                None
            });
            (handle, guard, pending)
        };

        debug!(doc = name, session_id = session.id(), "created session");

        if let Some(mut done) = pending {
            debug!(doc = name, "waiting for previous session state to be stored");
            // A dropped sender means the write task is gone; bind what is stored.
            let _ = done.wait_for(|done| *done).await;
        }

        if let Some(adapter) = &self.persistence {
            let bound =
                persist::bind_state(Arc::clone(adapter), session.name_arc(), session.doc().clone())
                    .await;
            if let Err(error) = bound {
                warn!(doc = name, ?error, "failed to bind stored document state");
                metrics::record_persist_failure("bind_state");
            }
            // Loaded state reaches clients through the sync handshake.
            session.flush_document_updates();
        }

        if let Some(store) = &self.content_store {
            session.set_content_saver(persist::content_saver(
                Arc::clone(&handle),
                Arc::clone(store),
                &self.options.persist,
            ));
        }

        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<SessionHandle> {
        let sessions = self.lock_sessions().ok()?;
        sessions.get(name).map(|entry| Arc::clone(&entry.handle))
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Names of all live sessions, sorted.
    pub fn document_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_sessions()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Write the state of every live session and wait for the final writes
    /// of evicted ones. Used at shutdown.
    pub async fn flush_all(&self) {
        let Some(adapter) = &self.persistence else {
            return;
        };
        let handles: Vec<SessionHandle> = match self.lock_sessions() {
            Ok(sessions) => sessions.values().map(|entry| Arc::clone(&entry.handle)).collect(),
            Err(error) => {
                warn!(?error, "cannot flush sessions");
                return;
            }
        };

        for handle in handles {
            let session = handle.lock().await;
            if session.is_evicted() {
                continue;
            }
            let name = session.name_arc();
            let written =
                persist::write_state(Arc::clone(adapter), Arc::clone(&name), session.doc().clone())
                    .await;
            match written {
                Ok(()) => debug!(doc = %name, "flushed document state"),
                Err(error) => {
                    warn!(doc = %name, ?error, "failed to flush document state");
                    metrics::record_persist_failure("write_state");
                }
            }
        }

        let pending: Vec<watch::Receiver<bool>> = match self.lock_pending_writes() {
            Ok(pending) => pending.values().map(|write| write.done.clone()).collect(),
            Err(_) => Vec::new(),
        };
        for mut done in pending {
            let _ = done.wait_for(|done| *done).await;
        }
    }

    /// Evict a session that lost its last connection and write its final
    /// state. The document is released once the write completes.
    fn retire(self: &Arc<Self>, teardown: SessionTeardown) {
        let SessionTeardown { name, session_id, doc } = teardown;

        let mut sessions = match self.lock_sessions() {
            Ok(sessions) => sessions,
            Err(error) => {
                warn!(doc = %name, ?error, "failed to evict session");
                return;
            }
        };
        let current = sessions.get(&*name).map(|entry| entry.session_id);
        if current == Some(session_id) {
            sessions.remove(&*name);
        }
        metrics::set_active_sessions(sessions.len());

        let Some(adapter) = self.persistence.clone() else {
            debug!(doc = %name, "evicted session");
            return;
        };

        // Recorded while `sessions` is still held.
        let (done_tx, done_rx) = watch::channel(false);
        match self.lock_pending_writes() {
            Ok(mut pending) => {
                pending.insert(name.to_string(), PendingWrite { session_id, done: done_rx });
            }
            Err(error) => warn!(doc = %name, ?error, "failed to record pending state write"),
        }
        drop(sessions);

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            match persist::write_state(adapter, Arc::clone(&name), doc).await {
                Ok(()) => info!(doc = %name, "evicted session and stored document state"),
                Err(error) => {
                    warn!(doc = %name, ?error, "failed to store document state");
                    metrics::record_persist_failure("write_state");
                }
            }
            let _ = done_tx.send(true);
            if let Some(registry) = registry.upgrade() {
                registry.clear_pending_write(&name, session_id);
            }
        });
    }

    fn pending_write(&self, name: &str) -> Result<Option<watch::Receiver<bool>>> {
        let pending = self.lock_pending_writes()?;
        Ok(pending.get(name).map(|write| write.done.clone()))
    }

    fn clear_pending_write(&self, name: &str, session_id: u64) {
        if let Ok(mut pending) = self.lock_pending_writes() {
            if pending.get(name).is_some_and(|write| write.session_id == session_id) {
                pending.remove(name);
            }
        }
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, HashMap<String, RegistryEntry>>> {
        self.sessions.lock().map_err(|_| anyhow!("session registry lock poisoned"))
    }

    fn lock_pending_writes(&self) -> Result<MutexGuard<'_, HashMap<String, PendingWrite>>> {
        self.pending_writes.lock().map_err(|_| anyhow!("pending write lock poisoned"))
    }
}
