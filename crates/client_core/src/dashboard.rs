use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use shared::domain::{CounterField, SessionUser, UserId};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    engine::{
        AggregateCounters, AggregationEngine, DashboardConfig, MutationOutcome, OwnCounters,
        PendingKey, SkipReason,
    },
    error::{ClientError, Result},
    session::SessionProvider,
    store::{Subscription, SubscriptionHandle},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldState {
    pub field: CounterField,
    pub own: i64,
    pub aggregate: i64,
    /// A mutation for this field is waiting on the store.
    pub loading: bool,
}

/// Everything the dashboard screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardState {
    pub user: SessionUser,
    pub fields: Vec<FieldState>,
    pub contributors: usize,
    /// At least one own-record snapshot has arrived.
    pub own_synced: bool,
    /// At least one collection snapshot has arrived.
    pub aggregate_synced: bool,
}

impl DashboardState {
    fn initial(user: SessionUser, config: &DashboardConfig) -> Self {
        Self {
            user,
            fields: config
                .fields()
                .iter()
                .map(|field| FieldState {
                    field: field.clone(),
                    own: 0,
                    aggregate: 0,
                    loading: false,
                })
                .collect(),
            contributors: 0,
            own_synced: false,
            aggregate_synced: false,
        }
    }

    pub fn field(&self, field: &CounterField) -> Option<&FieldState> {
        self.fields.iter().find(|state| &state.field == field)
    }

    pub fn can_increment(&self, field: &CounterField) -> bool {
        self.field(field).is_some_and(|state| !state.loading)
    }

    pub fn can_decrement(&self, field: &CounterField) -> bool {
        self.field(field)
            .is_some_and(|state| !state.loading && state.own > 0)
    }

    /// Both subscriptions have delivered and nothing is in flight.
    pub fn is_settled(&self) -> bool {
        self.own_synced && self.aggregate_synced && self.fields.iter().all(|f| !f.loading)
    }

    fn apply_own(&mut self, own: &OwnCounters) {
        for state in &mut self.fields {
            state.own = own.get(&state.field);
        }
        self.own_synced = true;
    }

    fn apply_aggregate(&mut self, aggregate: &AggregateCounters) {
        for state in &mut self.fields {
            state.aggregate = aggregate.get(&state.field);
        }
        self.contributors = aggregate.contributors();
        self.aggregate_synced = true;
    }

    fn apply_pending(&mut self, user_id: UserId, pending: &HashSet<PendingKey>) {
        for state in &mut self.fields {
            state.loading = pending.contains(&(user_id, state.field.clone()));
        }
    }
}

/// Published dashboard state. Once closed, no update gets through.
struct StateCell {
    sender: watch::Sender<DashboardState>,
    live: AtomicBool,
}

impl StateCell {
    fn update(&self, apply: impl FnOnce(&mut DashboardState)) {
        self.sender.send_if_modified(|state| {
            if !self.live.load(Ordering::Acquire) {
                return false;
            }
            let before = state.clone();
            apply(state);
            *state != before
        });
    }

    fn close(&self) {
        // Under the channel's write lock, so an update racing with this one either lands
        // first or sees the flag.
        self.sender.send_if_modified(|_| {
            self.live.store(false, Ordering::Release);
            false
        });
    }
}

/// One signed-in user's live view of their own counters and the all-user totals.
pub struct Dashboard {
    engine: AggregationEngine,
    session: Arc<dyn SessionProvider>,
    user: SessionUser,
    cell: Arc<StateCell>,
    handles: Vec<SubscriptionHandle>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl Dashboard {
    pub async fn start(
        engine: AggregationEngine,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let user = session.current_user().await.ok_or(ClientError::NotSignedIn)?;
        let user_id = user.user_id;

        let (own, own_handle) = engine.subscribe_self(user_id).await?.into_parts();
        let (aggregate, aggregate_handle) = engine.subscribe_aggregate().await?.into_parts();

        let (sender, _) = watch::channel(DashboardState::initial(user.clone(), engine.config()));
        let cell = Arc::new(StateCell {
            sender,
            live: AtomicBool::new(true),
        });

        let tasks = vec![
            tokio::spawn(follow_own(own, Arc::clone(&cell))),
            tokio::spawn(follow_aggregate(aggregate, Arc::clone(&cell))),
            tokio::spawn(follow_pending(engine.pending(), user_id, Arc::clone(&cell))),
        ];
        info!(user_id = user_id.0, fields = engine.config().fields().len(), "dashboard started");

        Ok(Self {
            engine,
            session,
            user,
            cell,
            handles: vec![own_handle, aggregate_handle],
            tasks,
            stopped: false,
        })
    }

    pub fn user(&self) -> &SessionUser {
        &self.user
    }

    pub fn config(&self) -> &DashboardConfig {
        self.engine.config()
    }

    pub fn state(&self) -> watch::Receiver<DashboardState> {
        self.cell.sender.subscribe()
    }

    pub fn snapshot(&self) -> DashboardState {
        self.cell.sender.borrow().clone()
    }

    /// Waits until both subscriptions have delivered and no mutation is pending.
    pub async fn settled(&self) -> DashboardState {
        let mut state = self.state();
        let settled = match state.wait_for(DashboardState::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    /// [`Dashboard::settled`] with a time limit; `None` if the view never settles in time.
    pub async fn settled_within(&self, limit: Duration) -> Option<DashboardState> {
        tokio::time::timeout(limit, self.settled()).await.ok()
    }

    /// Skipped with [`SkipReason::Stopped`] once the dashboard has stopped.
    pub async fn increment(&self, field: &CounterField) -> MutationOutcome {
        if self.stopped {
            return MutationOutcome::Skipped(SkipReason::Stopped);
        }
        self.engine.increment(self.user.user_id, field).await
    }

    pub async fn decrement(&self, field: &CounterField) -> MutationOutcome {
        if self.stopped {
            return MutationOutcome::Skipped(SkipReason::Stopped);
        }
        self.engine.decrement(self.user.user_id, field).await
    }

    /// Cancels both subscriptions and stops publishing state. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for handle in &self.handles {
            handle.cancel();
        }
        for task in &self.tasks {
            task.abort();
        }
        self.cell.close();
        self.engine.forget(self.user.user_id);
        info!(user_id = self.user.user_id.0, "dashboard stopped");
    }

    /// Stops the dashboard, then ends the session. A failed sign-out is logged and
    /// reported as `false`.
    pub async fn sign_out(&mut self) -> bool {
        self.stop();
        match self.session.sign_out().await {
            Ok(()) => true,
            Err(err) => {
                warn!(user_id = self.user.user_id.0, error = %err, "sign out failed");
                false
            }
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow_own(mut own: Subscription<OwnCounters>, cell: Arc<StateCell>) {
    while let Some(counters) = own.next().await {
        cell.update(|state| state.apply_own(&counters));
    }
}

async fn follow_aggregate(mut aggregate: Subscription<AggregateCounters>, cell: Arc<StateCell>) {
    while let Some(totals) = aggregate.next().await {
        cell.update(|state| state.apply_aggregate(&totals));
    }
}

async fn follow_pending(
    mut pending: watch::Receiver<HashSet<PendingKey>>,
    user_id: UserId,
    cell: Arc<StateCell>,
) {
    loop {
        let current = pending.borrow_and_update().clone();
        cell.update(|state| state.apply_pending(user_id, &current));
        if pending.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/dashboard_tests.rs"]
mod tests;
