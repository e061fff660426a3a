use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::{sum_field, CounterField, CounterRecord, UserId};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{
    error::{ClientError, Result},
    store::{CounterStore, Subscription},
};

/// Which counters a dashboard tracks and which one orders the collection subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    fields: Vec<CounterField>,
    order_by: CounterField,
}

impl DashboardConfig {
    /// Duplicate fields are dropped. `order_by` defaults to the first field.
    pub fn new(
        fields: impl IntoIterator<Item = CounterField>,
        order_by: Option<CounterField>,
    ) -> Result<Self> {
        let mut tracked: Vec<CounterField> = Vec::new();
        for field in fields {
            if !tracked.contains(&field) {
                tracked.push(field);
            }
        }
        let first = tracked.first().cloned().ok_or(ClientError::NoTrackedFields)?;
        Ok(Self {
            fields: tracked,
            order_by: order_by.unwrap_or(first),
        })
    }

    /// A single `count` per user.
    pub fn tally() -> Self {
        Self {
            fields: vec![CounterField::count()],
            order_by: CounterField::count(),
        }
    }

    /// Prompts written and prompts graded, ordered by prompts written.
    pub fn grading() -> Self {
        Self {
            fields: vec![CounterField::prompt_count(), CounterField::graded_count()],
            order_by: CounterField::prompt_count(),
        }
    }

    pub fn fields(&self) -> &[CounterField] {
        &self.fields
    }

    pub fn order_by(&self) -> &CounterField {
        &self.order_by
    }

    pub fn tracks(&self, field: &CounterField) -> bool {
        self.fields.contains(field)
    }
}

/// The signed-in user's value for every tracked field. Absent records and fields read as 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwnCounters {
    values: BTreeMap<CounterField, i64>,
}

impl OwnCounters {
    pub fn from_record(config: &DashboardConfig, record: Option<&CounterRecord>) -> Self {
        let values = config
            .fields()
            .iter()
            .map(|field| {
                let value = record.map_or(0, |record| record.value(field));
                (field.clone(), value)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, field: &CounterField) -> i64 {
        self.values.get(field).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CounterField, i64)> {
        self.values.iter().map(|(field, value)| (field, *value))
    }
}

/// Totals over every user's record, recomputed from a complete snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateCounters {
    totals: BTreeMap<CounterField, i64>,
    contributors: usize,
}

impl AggregateCounters {
    pub fn from_snapshot(config: &DashboardConfig, records: &[CounterRecord]) -> Self {
        let totals = config
            .fields()
            .iter()
            .map(|field| (field.clone(), sum_field(records, field)))
            .collect();
        Self {
            totals,
            contributors: records.len(),
        }
    }

    pub fn get(&self, field: &CounterField) -> i64 {
        self.totals.get(field).copied().unwrap_or(0)
    }

    /// Number of records in the snapshot the totals came from.
    pub fn contributors(&self) -> usize {
        self.contributors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A mutation for the same user and field is still waiting on the store.
    InFlight,
    /// The locally known value is already zero or below.
    AtFloor,
    UntrackedField,
    /// The dashboard was stopped or its session ended.
    Stopped,
}

/// What became of an increment or decrement. Failures never propagate past the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The store acknowledged; `value` is what it stored. Displayed state still waits for
    /// the subscription.
    Applied { value: i64 },
    Skipped(SkipReason),
    Failed { message: String },
}

pub type PendingKey = (UserId, CounterField);

/// Removes its key from the pending set when dropped, on every exit path.
struct PendingGuard {
    pending: Arc<watch::Sender<HashSet<PendingKey>>>,
    key: PendingKey,
}

impl PendingGuard {
    fn acquire(pending: &Arc<watch::Sender<HashSet<PendingKey>>>, key: PendingKey) -> Option<Self> {
        let inserted = pending.send_if_modified(|set| set.insert(key.clone()));
        inserted.then(|| Self {
            pending: Arc::clone(pending),
            key,
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.send_if_modified(|set| set.remove(&self.key));
    }
}

/// Keeps a user's own counters and the all-user totals current through store
/// subscriptions, and issues guarded mutations against the user's own record.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn CounterStore>,
    config: Arc<DashboardConfig>,
    pending: Arc<watch::Sender<HashSet<PendingKey>>>,
    known_own: Arc<Mutex<HashMap<UserId, OwnCounters>>>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn CounterStore>, config: DashboardConfig) -> Self {
        let (pending, _) = watch::channel(HashSet::new());
        Self {
            store,
            config: Arc::new(config),
            pending: Arc::new(pending),
            known_own: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Own counters for `user_id`, one item per store notification. Also updates the
    /// value the decrement floor is checked against.
    pub async fn subscribe_self(&self, user_id: UserId) -> Result<Subscription<OwnCounters>> {
        let config = Arc::clone(&self.config);
        let known_own = Arc::clone(&self.known_own);
        let records = self.store.subscribe_record(user_id).await?;
        Ok(records.map(move |record| {
            let own = OwnCounters::from_record(&config, record.as_ref());
            lock(&known_own).insert(user_id, own.clone());
            own
        }))
    }

    /// Totals over the whole collection, recomputed from every snapshot.
    pub async fn subscribe_aggregate(&self) -> Result<Subscription<AggregateCounters>> {
        let config = Arc::clone(&self.config);
        let snapshots = self.store.subscribe_collection(self.config.order_by()).await?;
        Ok(snapshots.map(move |records| AggregateCounters::from_snapshot(&config, &records)))
    }

    pub async fn increment(&self, user_id: UserId, field: &CounterField) -> MutationOutcome {
        if !self.config.tracks(field) {
            return MutationOutcome::Skipped(SkipReason::UntrackedField);
        }
        self.mutate(user_id, field, 1).await
    }

    pub async fn decrement(&self, user_id: UserId, field: &CounterField) -> MutationOutcome {
        if !self.config.tracks(field) {
            return MutationOutcome::Skipped(SkipReason::UntrackedField);
        }
        if self.is_pending(user_id, field) {
            return MutationOutcome::Skipped(SkipReason::InFlight);
        }
        if self.known_value(user_id, field) <= 0 {
            debug!(user_id = user_id.0, %field, "decrement skipped at zero");
            return MutationOutcome::Skipped(SkipReason::AtFloor);
        }
        self.mutate(user_id, field, -1).await
    }

    async fn mutate(&self, user_id: UserId, field: &CounterField, delta: i64) -> MutationOutcome {
        let Some(_guard) = PendingGuard::acquire(&self.pending, (user_id, field.clone())) else {
            debug!(user_id = user_id.0, %field, delta, "mutation dropped while one is in flight");
            return MutationOutcome::Skipped(SkipReason::InFlight);
        };

        match self.store.atomic_increment(user_id, field, delta).await {
            Ok(value) => {
                debug!(user_id = user_id.0, %field, delta, value, "mutation acknowledged");
                MutationOutcome::Applied { value }
            }
            Err(err) => {
                error!(user_id = user_id.0, %field, delta, error = %err, "counter mutation failed");
                MutationOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Watches the set of (user, field) pairs with a mutation in flight.
    pub fn pending(&self) -> watch::Receiver<HashSet<PendingKey>> {
        self.pending.subscribe()
    }

    pub fn is_pending(&self, user_id: UserId, field: &CounterField) -> bool {
        self.pending.borrow().contains(&(user_id, field.clone()))
    }

    /// Last own value delivered by `subscribe_self`, 0 before anything arrived.
    pub fn known_value(&self, user_id: UserId, field: &CounterField) -> i64 {
        lock(&self.known_own)
            .get(&user_id)
            .map_or(0, |own| own.get(field))
    }

    /// Drops what the engine remembers about `user_id`.
    pub fn forget(&self, user_id: UserId) {
        lock(&self.known_own).remove(&user_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
