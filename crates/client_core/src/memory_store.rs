use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{CounterField, CounterRecord, SubscriptionId, UserId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::Result,
    store::{Canceller, CounterStore, Subscription},
};

/// In-process counter store. Every mutation fans out to subscribers before it returns.
#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<UserId, CounterRecord>,
    record_watchers: HashMap<SubscriptionId, RecordWatcher>,
    collection_watchers: HashMap<SubscriptionId, CollectionWatcher>,
    next_subscription_id: i64,
}

struct RecordWatcher {
    user_id: UserId,
    sink: mpsc::UnboundedSender<Option<CounterRecord>>,
}

struct CollectionWatcher {
    order_by: CounterField,
    sink: mpsc::UnboundedSender<Vec<CounterRecord>>,
}

struct MemoryCanceller {
    state: Weak<Mutex<MemoryState>>,
}

impl Canceller for MemoryCanceller {
    fn cancel(&self, id: SubscriptionId) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        state.record_watchers.remove(&id);
        state.collection_watchers.remove(&id);
        debug!(subscription_id = id.0, "memory subscription cancelled");
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records ordered by `field` descending, ties broken by user id.
pub fn order_records<'a>(
    records: impl IntoIterator<Item = &'a CounterRecord>,
    field: &CounterField,
) -> Vec<CounterRecord> {
    let mut ordered: Vec<CounterRecord> = records.into_iter().cloned().collect();
    ordered.sort_by(|a, b| {
        b.value(field)
            .cmp(&a.value(field))
            .then(a.user_id.cmp(&b.user_id))
    });
    ordered
}

impl MemoryState {
    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_subscription_id += 1;
        SubscriptionId(self.next_subscription_id)
    }

    fn collection_snapshot(&self, order_by: &CounterField) -> Vec<CounterRecord> {
        order_records(self.records.values(), order_by)
    }

    /// Pushes fresh snapshots to everything watching `user_id`, dropping dead watchers.
    fn notify(&mut self, user_id: UserId) {
        let record = self.records.get(&user_id).cloned();
        self.record_watchers.retain(|_, watcher| {
            watcher.user_id != user_id || watcher.sink.send(record.clone()).is_ok()
        });

        let records = &self.records;
        self.collection_watchers.retain(|_, watcher| {
            let snapshot = order_records(records.values(), &watcher.order_by);
            watcher.sink.send(snapshot).is_ok()
        });
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a whole record, as another client or an operator would.
    pub fn put_record(&self, record: CounterRecord) {
        let mut state = lock(&self.state);
        let user_id = record.user_id;
        state.records.insert(user_id, record);
        state.notify(user_id);
    }

    pub fn remove_record(&self, user_id: UserId) -> Option<CounterRecord> {
        let mut state = lock(&self.state);
        let removed = state.records.remove(&user_id);
        if removed.is_some() {
            state.notify(user_id);
        }
        removed
    }

    pub fn record(&self, user_id: UserId) -> Option<CounterRecord> {
        lock(&self.state).records.get(&user_id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        let state = lock(&self.state);
        state.record_watchers.len() + state.collection_watchers.len()
    }

    fn canceller(&self) -> Arc<dyn Canceller> {
        Arc::new(MemoryCanceller {
            state: Arc::downgrade(&self.state),
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn subscribe_record(
        &self,
        user_id: UserId,
    ) -> Result<Subscription<Option<CounterRecord>>> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            let id = state.allocate_id();
            // The receiver is alive, so the initial snapshot cannot fail to send.
            let _ = sink.send(state.records.get(&user_id).cloned());
            state
                .record_watchers
                .insert(id, RecordWatcher { user_id, sink });
            id
        };
        Ok(Subscription::from_receiver(id, receiver, self.canceller()))
    }

    async fn subscribe_collection(
        &self,
        order_by: &CounterField,
    ) -> Result<Subscription<Vec<CounterRecord>>> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            let id = state.allocate_id();
            let _ = sink.send(state.collection_snapshot(order_by));
            state.collection_watchers.insert(
                id,
                CollectionWatcher {
                    order_by: order_by.clone(),
                    sink,
                },
            );
            id
        };
        Ok(Subscription::from_receiver(id, receiver, self.canceller()))
    }

    async fn atomic_increment(
        &self,
        user_id: UserId,
        field: &CounterField,
        delta: i64,
    ) -> Result<i64> {
        let mut state = lock(&self.state);
        let record = state
            .records
            .entry(user_id)
            .or_insert_with(|| CounterRecord::empty(user_id));
        let value = record.values.entry(field.clone()).or_insert(0);
        *value = value.saturating_add(delta);
        let value = *value;
        record.updated_at = Utc::now();
        state.notify(user_id);
        Ok(value)
    }
}

#[cfg(test)]
#[path = "tests/memory_store_tests.rs"]
mod tests;
