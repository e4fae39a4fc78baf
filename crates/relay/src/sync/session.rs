use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cosync_common::protocol::ws::{encode_awareness, encode_sync_step1, encode_sync_update};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use yrs::sync::{Awareness, AwarenessUpdate, DefaultProtocol, Message, Protocol, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Options, ReadTxn, Subscription, Transact, Update};

use super::awareness::{self, AwarenessChange};
use crate::persist::Debounced;

/// Identifies one live connection within a session.
pub type ConnectionId = u64;

/// Frames queued for delivery to a connection's transport.
pub type Outbound = mpsc::Sender<Vec<u8>>;

/// Frames a connection may have queued before it is closed as too slow.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// A session shared between its connections and the registry.
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Garbage-collect deleted content in the document.
    pub gc: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { gc: true }
    }
}

/// Handed to the teardown hook when the last connection leaves.
pub struct SessionTeardown {
    pub name: Arc<str>,
    pub session_id: u64,
    pub doc: Doc,
}

type TeardownHook = Box<dyn FnOnce(SessionTeardown) + Send>;

struct ConnectionEntry {
    outbound: Outbound,
    controlled_clients: HashSet<u64>,
}

/// Live state of one collaborative document.
///
/// Owns the CRDT document (through its awareness), the set of connections
/// and, per connection, the awareness client IDs that connection published.
/// Every document update is fanned out to all connections, the originating
/// one included.
pub struct Session {
    id: u64,
    name: Arc<str>,
    awareness: Awareness,
    protocol: DefaultProtocol,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    doc_updates: mpsc::UnboundedReceiver<Vec<u8>>,
    doc_subscription: Option<Subscription>,
    content_saver: Option<Debounced>,
    on_empty: Option<TeardownHook>,
    evicted: bool,
}

impl Session {
    pub fn new(name: impl Into<Arc<str>>, options: SessionOptions) -> Result<Self> {
        let doc = Doc::with_options(Options { skip_gc: !options.gc, ..Default::default() });

        let (updates_tx, doc_updates) = mpsc::unbounded_channel();
        let doc_subscription = doc
            .observe_update_v1(move |_, event| {
                let _ = updates_tx.send(event.update.clone());
            })
            .map_err(|error| anyhow!("failed to observe document updates: {error:?}"))?;

        let awareness = Awareness::new(doc);
        awareness.clean_local_state();

        Ok(Self {
            id: 0,
            name: name.into(),
            awareness,
            protocol: DefaultProtocol,
            connections: HashMap::new(),
            doc_updates,
            doc_subscription: Some(doc_subscription),
            content_saver: None,
            on_empty: None,
            evicted: false,
        })
    }

    pub(crate) fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Register the hook run once when the connection count drops to zero.
    pub fn on_empty(&mut self, hook: impl FnOnce(SessionTeardown) + Send + 'static) {
        self.on_empty = Some(Box::new(hook));
    }

    pub(crate) fn set_content_saver(&mut self, saver: Debounced) {
        self.content_saver = Some(saver);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn doc(&self) -> &Doc {
        self.awareness.doc()
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn has_connection(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Awareness client IDs published through `connection_id`, sorted.
    pub fn controlled_clients(&self, connection_id: ConnectionId) -> Vec<u64> {
        let mut clients: Vec<u64> = self
            .connections
            .get(&connection_id)
            .map(|entry| entry.controlled_clients.iter().copied().collect())
            .unwrap_or_default();
        clients.sort_unstable();
        clients
    }

    /// Set once the session has lost its last connection. An evicted session
    /// never accepts connections again.
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Text of the root type `field`, or `None` when the document has none.
    pub fn content_projection(&self, field: &str) -> Option<String> {
        let txn = self.doc().transact();
        txn.get_text(field).map(|text| text.get_string(&txn))
    }

    /// Attach a connection and queue its handshake: a sync step 1 carrying the
    /// document's state vector, then an awareness snapshot when any client is
    /// present.
    pub fn add_connection(&mut self, connection_id: ConnectionId, outbound: Outbound) {
        self.connections.insert(
            connection_id,
            ConnectionEntry { outbound, controlled_clients: HashSet::new() },
        );

        let state_vector = self.doc().transact().state_vector();
        self.send_to(connection_id, encode_sync_step1(state_vector));

        match awareness::snapshot(&self.awareness) {
            Ok(Some(update)) => self.send_to(connection_id, encode_awareness(update)),
            Ok(None) => {}
            Err(error) => warn!(doc = %self.name, ?error, "failed to build awareness snapshot"),
        }
    }

    /// Apply a sync message from a connection and return the reply, if any,
    /// for that connection alone.
    pub fn handle_sync_message(&mut self, message: SyncMessage) -> Result<Option<Message>> {
        let reply = self.apply_sync_message(message);
        self.flush_document_updates();
        reply
    }

    fn apply_sync_message(&self, message: SyncMessage) -> Result<Option<Message>> {
        match message {
            SyncMessage::SyncStep1(state_vector) => self
                .protocol
                .handle_sync_step1(&self.awareness, state_vector)
                .context("failed to process sync step 1"),
            SyncMessage::SyncStep2(update) => {
                let update =
                    Update::decode_v1(&update).context("failed to decode sync step 2 update")?;
                self.protocol
                    .handle_sync_step2(&self.awareness, update)
                    .context("failed to process sync step 2")
            }
            SyncMessage::Update(update) => {
                let update =
                    Update::decode_v1(&update).context("failed to decode incremental update")?;
                self.protocol
                    .handle_update(&self.awareness, update)
                    .context("failed to process incremental update")
            }
        }
    }

    /// Apply an awareness update received from `origin` and rebroadcast the
    /// changed client states.
    pub fn handle_awareness_update(
        &mut self,
        origin: Option<ConnectionId>,
        update: AwarenessUpdate,
    ) -> Result<()> {
        let change = awareness::apply_update(&self.awareness, update)?;
        self.publish_awareness_change(change, origin);
        Ok(())
    }

    fn publish_awareness_change(&mut self, change: AwarenessChange, origin: Option<ConnectionId>) {
        if change.is_empty() {
            return;
        }

        if let Some(entry) = origin.and_then(|id| self.connections.get_mut(&id)) {
            entry.controlled_clients.extend(change.added.iter().copied());
            for client_id in &change.removed {
                entry.controlled_clients.remove(client_id);
            }
        }

        match self.awareness.update_with_clients(change.all_changes()) {
            Ok(update) => self.broadcast(&encode_awareness(update), None),
            Err(error) => warn!(doc = %self.name, ?error, "dropping awareness broadcast"),
        }
    }

    /// Broadcast every document update produced since the last flush and
    /// reschedule the content save.
    pub fn flush_document_updates(&mut self) {
        while let Ok(update) = self.doc_updates.try_recv() {
            let frame = encode_sync_update(update);
            self.broadcast(&frame, None);
            if let Some(saver) = &self.content_saver {
                saver.trigger();
            }
        }
    }

    /// Queue `frame` on every connection except `exclude`. A connection whose
    /// queue is full or gone is closed.
    pub fn broadcast(&mut self, frame: &[u8], exclude: Option<ConnectionId>) {
        let failed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(connection_id, _)| Some(**connection_id) != exclude)
            .filter(|(connection_id, entry)| {
                !enqueue(&self.name, **connection_id, &entry.outbound, frame.to_vec())
            })
            .map(|(connection_id, _)| *connection_id)
            .collect();

        for connection_id in failed {
            self.remove_connection(connection_id);
        }
    }

    /// Queue `frame` for one connection, closing it when the queue is full or
    /// gone.
    pub fn send_to(&mut self, connection_id: ConnectionId, frame: Vec<u8>) {
        let failed = match self.connections.get(&connection_id) {
            Some(entry) => !enqueue(&self.name, connection_id, &entry.outbound, frame),
            None => false,
        };
        if failed {
            self.remove_connection(connection_id);
        }
    }

    /// Detach a connection and drop the awareness states it controlled.
    ///
    /// Returns `false` when the connection was already gone. Removing the last
    /// connection tears the session down.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(&connection_id) else {
            return false;
        };

        let change = awareness::remove_clients(&self.awareness, entry.controlled_clients);
        self.publish_awareness_change(change, None);

        if self.connections.is_empty() {
            self.teardown();
        }
        true
    }

    fn teardown(&mut self) {
        if self.evicted {
            return;
        }
        self.evicted = true;
        self.doc_subscription = None;
        self.content_saver = None;

        debug!(doc = %self.name, session_id = self.id, "session has no connections left");
        if let Some(hook) = self.on_empty.take() {
            hook(SessionTeardown {
                name: Arc::clone(&self.name),
                session_id: self.id,
                doc: self.doc().clone(),
            });
        }
    }
}

fn enqueue(doc: &str, connection_id: ConnectionId, outbound: &Outbound, frame: Vec<u8>) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(doc, connection_id, "outbound queue full, closing slow connection");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(doc, connection_id, "closing connection after failed send");
            false
        }
    }
}
