//! Record store adapter: get / put / delete / list / subscribe against one
//! document per record.
//!
//! Writes are last-writer-wins at whole-document granularity. The store
//! stamps every write with a timestamp that is strictly greater than any it
//! handed out before, so timestamp order is commit order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::record::{RecordId, Snapshot, StoredDocument, Timestamp};

const CHANNEL_CAPACITY: usize = 64;

/// Change notification for one record.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Changed(Snapshot),
    Deleted(RecordId),
}

/// Live change feed for one record. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: RecordId,
    receiver: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    pub fn new(id: RecordId, receiver: broadcast::Receiver<StoreEvent>) -> Self {
        Subscription { id, receiver }
    }

    pub fn record_id(&self) -> &RecordId {
        &self.id
    }

    /// Next event, or `None` once the store has gone away.
    ///
    /// A subscriber that falls behind skips the versions it missed; the
    /// newest ones are still delivered.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("subscription to {} skipped {skipped} stale events", self.id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        debug!("unsubscribed from {}", self.id);
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name of the collection the records live in.
    fn collection(&self) -> &str;

    async fn get(&self, id: &RecordId) -> Result<Snapshot, StoreError>;

    /// Replace the whole document; returns the committed timestamp.
    async fn put(&self, id: &RecordId, document: StoredDocument) -> Result<Timestamp, StoreError>;

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError>;

    /// Most recently updated records first.
    async fn list(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError>;

    /// Observe every later write to `id`, including the subscriber's own.
    fn subscribe(&self, id: &RecordId) -> Result<Subscription, StoreError>;
}

#[derive(Default)]
struct Inner {
    records: HashMap<RecordId, Snapshot>,
    channels: HashMap<RecordId, broadcast::Sender<StoreEvent>>,
    clock: Timestamp,
}

impl Inner {
    fn publish(&mut self, id: &RecordId, event: StoreEvent) {
        if let Some(tx) = self.channels.get(id) {
            if tx.send(event).is_err() {
                // Every subscriber is gone.
                self.channels.remove(id);
            }
        }
    }
}

/// In-process document store shared by every session of a server.
pub struct MemoryStore {
    collection: String,
    inner: Mutex<Inner>,
    online: AtomicBool,
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self::with_snapshots(collection, Vec::new())
    }

    pub fn with_snapshots(collection: impl Into<String>, snapshots: Vec<Snapshot>) -> Self {
        let mut inner = Inner::default();
        for snapshot in snapshots {
            inner.clock = inner.clock.max(snapshot.last_updated);
            inner.records.insert(snapshot.id.clone(), snapshot);
        }
        MemoryStore {
            collection: collection.into(),
            inner: Mutex::new(inner),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the backend.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Write `document`, committing it only once `durable` has accepted the
    /// resulting contents. Subscribers hear about committed writes only; on
    /// failure the previous version stays in place and the clock is unchanged.
    pub fn put_with<F>(
        &self,
        id: &RecordId,
        document: StoredDocument,
        durable: F,
    ) -> Result<Timestamp, StoreError>
    where
        F: FnOnce(&HashMap<RecordId, Snapshot>) -> Result<(), StoreError>,
    {
        let mut inner = self.lock()?;
        let committed = inner.clock.next_after(Timestamp::now());

        let snapshot = Snapshot {
            id: id.clone(),
            last_updated: committed,
            document,
        };
        let previous = inner.records.insert(id.clone(), snapshot.clone());
        if let Err(err) = durable(&inner.records) {
            match previous {
                Some(previous) => inner.records.insert(id.clone(), previous),
                None => inner.records.remove(id),
            };
            warn!("{}/{id} not written: {err}", self.collection);
            return Err(err);
        }

        inner.clock = committed;
        inner.publish(id, StoreEvent::Changed(snapshot));
        debug!("{}/{id} written at {committed}", self.collection);
        Ok(committed)
    }

    /// Delete `id` once `durable` has accepted the remaining contents.
    pub fn delete_with<F>(&self, id: &RecordId, durable: F) -> Result<(), StoreError>
    where
        F: FnOnce(&HashMap<RecordId, Snapshot>) -> Result<(), StoreError>,
    {
        let mut inner = self.lock()?;
        let Some(previous) = inner.records.remove(id) else {
            return Err(StoreError::NotFound(id.clone()));
        };
        if let Err(err) = durable(&inner.records) {
            inner.records.insert(id.clone(), previous);
            warn!("{}/{id} not deleted: {err}", self.collection);
            return Err(err);
        }

        inner.publish(id, StoreEvent::Deleted(id.clone()));
        debug!("{}/{id} deleted", self.collection);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "collection `{}` is offline",
                self.collection
            )));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn get(&self, id: &RecordId) -> Result<Snapshot, StoreError> {
        self.lock()?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn put(&self, id: &RecordId, document: StoredDocument) -> Result<Timestamp, StoreError> {
        self.put_with(id, document, |_| Ok(()))
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.delete_with(id, |_| Ok(()))
    }

    async fn list(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.lock()?;
        let mut snapshots: Vec<Snapshot> = inner.records.values().cloned().collect();
        snapshots.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    fn subscribe(&self, id: &RecordId) -> Result<Subscription, StoreError> {
        let mut inner = self.lock()?;
        let receiver = inner
            .channels
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Subscription::new(id.clone(), receiver))
    }
}
