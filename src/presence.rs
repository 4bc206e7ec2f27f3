//! Who else is editing a record.
//!
//! Presence is advisory: entries live inside the record document, are
//! refreshed by a heartbeat and are pruned by any reader once they are older
//! than the TTL. Concurrent presence writes race like any other write.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::error::StoreError;
use crate::record::{ActiveEditors, EditorId, PresenceEntry, Record, RecordId, Timestamp};
use crate::store::RecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
    Absent,
    Active,
}

/// An entry of the "currently editing" list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEditor {
    pub editor_id: EditorId,
    pub name: String,
    pub last_active: Timestamp,
}

pub fn is_expired(entry: &PresenceEntry, now: Timestamp, ttl: Duration) -> bool {
    now.elapsed_since(entry.last_active) > ttl
}

pub fn state_of(
    editors: &ActiveEditors,
    editor: &EditorId,
    now: Timestamp,
    ttl: Duration,
) -> PresenceState {
    match editors.get(editor) {
        Some(entry) if !is_expired(entry, now, ttl) => PresenceState::Active,
        _ => PresenceState::Absent,
    }
}

/// Insert or refresh `editor` (open and heartbeat are the same transition).
pub fn join(editors: &mut ActiveEditors, editor: &EditorId, name: &str, now: Timestamp) {
    editors.insert(
        editor.clone(),
        PresenceEntry {
            name: name.to_string(),
            last_active: now,
        },
    );
}

pub fn leave(editors: &mut ActiveEditors, editor: &EditorId) -> bool {
    editors.remove(editor).is_some()
}

/// Drop expired entries, returning who was removed.
pub fn prune(editors: &mut ActiveEditors, now: Timestamp, ttl: Duration) -> Vec<EditorId> {
    let expired: Vec<EditorId> = editors
        .iter()
        .filter(|(_, entry)| is_expired(entry, now, ttl))
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        editors.remove(id);
    }
    expired
}

/// Live entries, most recently active first.
pub fn active(editors: &ActiveEditors, now: Timestamp, ttl: Duration) -> Vec<ActiveEditor> {
    let mut list: Vec<ActiveEditor> = editors
        .iter()
        .filter(|(_, entry)| !is_expired(entry, now, ttl))
        .map(|(id, entry)| ActiveEditor {
            editor_id: id.clone(),
            name: entry.name.clone(),
            last_active: entry.last_active,
        })
        .collect();
    list.sort_by(|a, b| b.last_active.cmp(&a.last_active));
    list
}

/// Result of one presence read-modify-write.
#[derive(Debug)]
pub struct PresenceWrite {
    /// The record as read before the write.
    pub read: Record,
    /// The presence map that was written.
    pub editors: ActiveEditors,
    pub committed: Timestamp,
}

/// One editor's presence on whatever record its session has open.
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    editor: EditorId,
    name: String,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(editor: EditorId, name: impl Into<String>, ttl: Duration) -> Self {
        PresenceTracker {
            editor,
            name: name.into(),
            ttl,
        }
    }

    pub fn editor(&self) -> &EditorId {
        &self.editor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `absent -> active`, or `active -> active` on a heartbeat.
    pub async fn announce(
        &self,
        store: &dyn RecordStore,
        id: &RecordId,
    ) -> Result<PresenceWrite, StoreError> {
        self.read_modify_write(store, id, |editors, now| {
            join(editors, &self.editor, &self.name, now)
        })
        .await
    }

    /// `active -> absent` on close.
    pub async fn withdraw(
        &self,
        store: &dyn RecordStore,
        id: &RecordId,
    ) -> Result<PresenceWrite, StoreError> {
        self.read_modify_write(store, id, |editors, _| {
            leave(editors, &self.editor);
        })
        .await
    }

    async fn read_modify_write<F>(
        &self,
        store: &dyn RecordStore,
        id: &RecordId,
        change: F,
    ) -> Result<PresenceWrite, StoreError>
    where
        F: FnOnce(&mut ActiveEditors, Timestamp) + Send,
    {
        let snapshot = store.get(id).await?;
        let now = Timestamp::now();

        let mut editors = snapshot.document.active_editors();
        let pruned = prune(&mut editors, now, self.ttl);
        if !pruned.is_empty() {
            info!("pruned {} stale editors from karte {id}", pruned.len());
        }
        change(&mut editors, now);

        // Only the presence map changes; the stored grid is written back as read.
        let document = snapshot
            .document
            .clone()
            .with_presence(editors.clone(), self.editor.clone())
            .map_err(|e| StoreError::Encoding(format!("karte {id}: {e}")))?;
        let read = snapshot.into_record();

        let committed = store.put(id, document).await?;
        debug!("presence of {} on karte {id} written at {committed}", self.editor);
        Ok(PresenceWrite {
            read,
            editors,
            committed,
        })
    }
}
