// Document persistence.
//
// Two seams: a `PersistenceAdapter` that owns the binary CRDT state of a
// document (loaded when a session is created, written when it empties), and a
// `ContentStore` that receives a debounced plain-text projection of the
// document while it is being edited.

pub mod debounce;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::PersistConfig;
use crate::metrics;
use crate::sync::SessionHandle;

pub use debounce::{DebounceWindow, Debounced};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable storage for the binary state of documents.
///
/// Implementations are synchronous; the relay calls them from blocking
/// tasks.
pub trait PersistenceAdapter: Send + Sync + 'static {
    /// Apply any previously stored state for `name` to a fresh document.
    fn bind_state(&self, name: &str, doc: &Doc) -> Result<()>;

    /// Store the full state of `doc` after its last connection closed.
    fn write_state(&self, name: &str, doc: &Doc) -> Result<()>;
}

/// Sink for the plain-text projection of a document.
pub trait ContentStore: Send + Sync + 'static {
    fn upsert_content(&self, name: &str, content: &str) -> Result<()>;
}

/// Encode the whole document as a single v1 update.
pub fn encode_doc_state(doc: &Doc) -> Vec<u8> {
    doc.transact().encode_state_as_update_v1(&StateVector::default())
}

/// Merge a stored v1 update into `doc`.
pub fn apply_stored_state(doc: &Doc, state: &[u8]) -> Result<()> {
    if state.is_empty() {
        return Ok(());
    }
    let update = Update::decode_v1(state).context("failed to decode stored document state")?;
    doc.transact_mut().apply_update(update).context("failed to apply stored document state")?;
    Ok(())
}

pub(crate) async fn bind_state(
    adapter: Arc<dyn PersistenceAdapter>,
    name: Arc<str>,
    doc: Doc,
) -> Result<()> {
    tokio::task::spawn_blocking(move || adapter.bind_state(&name, &doc))
        .await
        .context("bind_state task failed")?
}

pub(crate) async fn write_state(
    adapter: Arc<dyn PersistenceAdapter>,
    name: Arc<str>,
    doc: Doc,
) -> Result<()> {
    tokio::task::spawn_blocking(move || adapter.write_state(&name, &doc))
        .await
        .context("write_state task failed")?
}

/// Spawn the debounced content saver for a session.
///
/// Each call of the returned handle's `trigger` (re)schedules a save of the
/// session's `content_field` text into `store`.
pub fn content_saver(
    session: SessionHandle,
    store: Arc<dyn ContentStore>,
    config: &PersistConfig,
) -> Debounced {
    let field: Arc<str> = Arc::from(config.content_field.as_str());
    let window = DebounceWindow::new(config.wait, config.max_wait);

    Debounced::spawn(window, move || {
        let session = Arc::clone(&session);
        let store = Arc::clone(&store);
        let field = Arc::clone(&field);
        async move { save_content(&session, store, &field).await }
    })
}

async fn save_content(session: &SessionHandle, store: Arc<dyn ContentStore>, field: &str) {
    let (name, content) = {
        let session = session.lock().await;
        (session.name_arc(), session.content_projection(field))
    };

    let Some(content) = content else {
        debug!(doc = %name, field, "document has no text root to save");
        return;
    };

    let doc = Arc::clone(&name);
    match tokio::task::spawn_blocking(move || store.upsert_content(&name, &content)).await {
        Ok(Ok(())) => {
            debug!(doc = %doc, "saved document content");
            metrics::record_content_saved();
        }
        Ok(Err(error)) => {
            warn!(doc = %doc, ?error, "failed to save document content");
            metrics::record_persist_failure("save_content");
        }
        Err(error) => {
            warn!(doc = %doc, ?error, "content save task failed");
            metrics::record_persist_failure("save_content");
        }
    }
}
