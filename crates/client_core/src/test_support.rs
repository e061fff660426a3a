//! Store fixtures shared by the engine and dashboard tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use shared::domain::{CounterField, CounterRecord, UserId};
use tokio::sync::Notify;

use crate::{
    error::{ClientError, Result},
    memory_store::MemoryCounterStore,
    store::{CounterStore, Subscription},
};

pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CAROL: UserId = UserId(3);

pub fn record(user_id: UserId, values: &[(CounterField, i64)]) -> CounterRecord {
    let mut record = CounterRecord::empty(user_id);
    record.values.extend(values.iter().cloned());
    record
}

/// Wraps a memory store, counting mutations and optionally holding or failing them.
pub struct TestStore {
    pub memory: MemoryCounterStore,
    increments: AtomicUsize,
    failures_left: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl TestStore {
    pub fn new(memory: MemoryCounterStore) -> Self {
        Self {
            memory,
            increments: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Every increment waits for one `notify_one` on the returned handle.
    pub fn gated(memory: MemoryCounterStore) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut store = Self::new(memory);
        store.gate = Some(Arc::clone(&gate));
        (store, gate)
    }

    /// The next `failures` increments fail without touching the store.
    pub fn flaky(memory: MemoryCounterStore, failures: usize) -> Self {
        let store = Self::new(memory);
        store.failures_left.store(failures, Ordering::SeqCst);
        store
    }

    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for TestStore {
    async fn subscribe_record(
        &self,
        user_id: UserId,
    ) -> Result<Subscription<Option<CounterRecord>>> {
        self.memory.subscribe_record(user_id).await
    }

    async fn subscribe_collection(
        &self,
        order_by: &CounterField,
    ) -> Result<Subscription<Vec<CounterRecord>>> {
        self.memory.subscribe_collection(order_by).await
    }

    async fn atomic_increment(
        &self,
        user_id: UserId,
        field: &CounterField,
        delta: i64,
    ) -> Result<i64> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::Unavailable("connection reset".to_string()));
        }
        self.memory.atomic_increment(user_id, field, delta).await
    }
}
