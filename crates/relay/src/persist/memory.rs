use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use yrs::Doc;

use super::{apply_stored_state, encode_doc_state, ContentStore, PersistenceAdapter};

/// In-process document store.
///
/// For embedders without a database and for tests, which read back the
/// stored values and call counts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    states: HashMap<String, Vec<u8>>,
    contents: HashMap<String, String>,
    state_writes: HashMap<String, usize>,
    content_writes: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self, name: &str) -> Option<String> {
        self.lock().ok()?.contents.get(name).cloned()
    }

    /// Number of `write_state` calls recorded for `name`.
    pub fn state_writes(&self, name: &str) -> usize {
        self.lock().map(|inner| inner.state_writes.get(name).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Number of `upsert_content` calls recorded for `name`.
    pub fn content_writes(&self, name: &str) -> usize {
        self.lock().map(|inner| inner.content_writes.get(name).copied().unwrap_or(0)).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl PersistenceAdapter for MemoryStore {
    fn bind_state(&self, name: &str, doc: &Doc) -> Result<()> {
        let stored = self.lock()?.states.get(name).cloned();
        match stored {
            Some(state) => apply_stored_state(doc, &state),
            None => Ok(()),
        }
    }

    fn write_state(&self, name: &str, doc: &Doc) -> Result<()> {
        let state = encode_doc_state(doc);
        let mut inner = self.lock()?;
        inner.states.insert(name.to_string(), state);
        *inner.state_writes.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

impl ContentStore for MemoryStore {
    fn upsert_content(&self, name: &str, content: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.contents.insert(name.to_string(), content.to_string());
        *inner.content_writes.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use yrs::{Doc, GetString, Text, Transact};

    use super::MemoryStore;
    use crate::persist::{ContentStore, PersistenceAdapter};

    #[test]
    fn write_then_bind_restores_state_and_counts_writes() {
        let store = MemoryStore::new();
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        text.insert(&mut doc.transact_mut(), 0, "kept");

        store.write_state("doc-A", &doc).expect("write should succeed");
        assert_eq!(store.state_writes("doc-A"), 1);
        assert_eq!(store.state_writes("doc-B"), 0);

        let fresh = Doc::new();
        store.bind_state("doc-A", &fresh).expect("bind should succeed");
        let text = fresh.get_or_insert_text("content");
        assert_eq!(text.get_string(&fresh.transact()), "kept");
    }

    #[test]
    fn content_upserts_are_recorded() {
        let store = MemoryStore::new();
        store.upsert_content("doc-A", "one").expect("upsert");
        store.upsert_content("doc-A", "two").expect("upsert");

        assert_eq!(store.content("doc-A").as_deref(), Some("two"));
        assert_eq!(store.content_writes("doc-A"), 2);
    }
}
