use anyhow::{Context, Result};
use yrs::sync::{Awareness, AwarenessUpdate};

/// Client IDs whose awareness state changed in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn removed(removed: Vec<u64>) -> Self {
        Self { removed, ..Default::default() }
    }

    /// Every changed client, in added, updated, removed order.
    pub fn all_changes(&self) -> Vec<u64> {
        self.added.iter().chain(&self.updated).chain(&self.removed).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Apply a remote awareness update and report what changed.
///
/// Stale entries (clock not newer than the known one) produce no change.
pub fn apply_update(awareness: &Awareness, update: AwarenessUpdate) -> Result<AwarenessChange> {
    let Some(summary) =
        awareness.apply_update_summary(update).context("failed to apply awareness update")?
    else {
        return Ok(AwarenessChange::default());
    };

    Ok(AwarenessChange { added: summary.added, updated: summary.updated, removed: summary.removed })
}

/// Clients that currently publish a non-null state, sorted.
pub fn present_clients(awareness: &Awareness) -> Vec<u64> {
    let mut clients: Vec<u64> = awareness
        .iter()
        .filter_map(|(client_id, state)| state.data.as_ref().map(|_| client_id))
        .collect();
    clients.sort_unstable();
    clients
}

/// Snapshot of every present client, or `None` when nobody is present.
pub fn snapshot(awareness: &Awareness) -> Result<Option<AwarenessUpdate>> {
    let clients = present_clients(awareness);
    if clients.is_empty() {
        return Ok(None);
    }
    let update = awareness
        .update_with_clients(clients)
        .context("failed to encode awareness snapshot")?;
    Ok(Some(update))
}

/// Remove the states of `clients`, skipping those with no present state.
pub fn remove_clients(
    awareness: &Awareness,
    clients: impl IntoIterator<Item = u64>,
) -> AwarenessChange {
    let present = present_clients(awareness);
    let mut removed: Vec<u64> =
        clients.into_iter().filter(|client_id| present.binary_search(client_id).is_ok()).collect();
    removed.sort_unstable();
    removed.dedup();

    for client_id in &removed {
        awareness.remove_state(*client_id);
    }
    AwarenessChange::removed(removed)
}
