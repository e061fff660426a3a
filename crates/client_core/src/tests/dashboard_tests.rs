use super::*;
use crate::{
    memory_store::MemoryCounterStore,
    session::LocalSession,
    test_support::{record, TestStore, ALICE, BOB},
};
use std::time::Duration;

fn alice() -> SessionUser {
    SessionUser {
        user_id: ALICE,
        display_name: Some("Alice".to_string()),
        email: None,
    }
}

async fn start(store: Arc<TestStore>, config: DashboardConfig) -> Dashboard {
    let engine = AggregationEngine::new(store, config);
    Dashboard::start(engine, Arc::new(LocalSession::signed_in(alice())))
        .await
        .expect("dashboard")
}

async fn wait_for_state(
    dashboard: &Dashboard,
    ready: impl FnMut(&DashboardState) -> bool,
) -> DashboardState {
    let mut state = dashboard.state();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), state.wait_for(ready))
        .await
        .expect("state before timeout")
        .expect("state channel open")
        .clone();
    snapshot
}

fn own_and_total(state: &DashboardState, field: &CounterField) -> (i64, i64) {
    let field = state.field(field).expect("tracked field");
    (field.own, field.aggregate)
}

#[tokio::test]
async fn start_requires_a_signed_in_user() {
    let engine = AggregationEngine::new(
        Arc::new(TestStore::new(MemoryCounterStore::new())),
        DashboardConfig::tally(),
    );
    let result = Dashboard::start(engine, Arc::new(LocalSession::signed_out())).await;
    assert!(matches!(result, Err(ClientError::NotSignedIn)));
}

#[tokio::test]
async fn state_follows_subscriptions_not_mutation_results() {
    let memory = MemoryCounterStore::new();
    memory.put_record(record(BOB, &[(CounterField::count(), 4)]));
    let dashboard = start(
        Arc::new(TestStore::new(memory)),
        DashboardConfig::tally(),
    )
    .await;
    let count = CounterField::count();

    let settled = dashboard.settled().await;
    assert_eq!(own_and_total(&settled, &count), (0, 4));
    assert_eq!(settled.user.greeting_name(), "Alice");
    assert!(settled.can_increment(&count));
    assert!(!settled.can_decrement(&count));

    assert_eq!(
        dashboard.increment(&count).await,
        MutationOutcome::Applied { value: 1 }
    );
    let state = wait_for_state(&dashboard, |s| own_and_total(s, &count) == (1, 5)).await;
    assert_eq!(state.contributors, 2);
    assert!(state.can_decrement(&count));
}

#[tokio::test]
async fn loading_disables_both_controls_until_acknowledged() {
    let (store, gate) = TestStore::gated(MemoryCounterStore::new());
    let store = Arc::new(store);
    let dashboard = Arc::new(start(Arc::clone(&store), DashboardConfig::tally()).await);
    let count = CounterField::count();
    dashboard.settled().await;

    let pending = tokio::spawn({
        let dashboard = Arc::clone(&dashboard);
        let count = count.clone();
        async move { dashboard.increment(&count).await }
    });
    let state = wait_for_state(&dashboard, |s| {
        s.field(&count).is_some_and(|f| f.loading)
    })
    .await;
    assert!(!state.can_increment(&count));
    assert!(!state.can_decrement(&count));

    gate.notify_one();
    assert!(matches!(
        pending.await.expect("join"),
        MutationOutcome::Applied { .. }
    ));
    let state = wait_for_state(&dashboard, |s| {
        s.is_settled() && s.field(&count).is_some_and(|f| f.own == 1)
    })
    .await;
    assert!(state.can_increment(&count));
    assert_eq!(store.increments(), 1);
}

#[tokio::test]
async fn settled_within_gives_up_while_a_mutation_hangs() {
    let (store, gate) = TestStore::gated(MemoryCounterStore::new());
    let dashboard = Arc::new(start(Arc::new(store), DashboardConfig::tally()).await);
    let count = CounterField::count();
    assert!(dashboard
        .settled_within(Duration::from_secs(5))
        .await
        .is_some());

    let pending = tokio::spawn({
        let dashboard = Arc::clone(&dashboard);
        let count = count.clone();
        async move { dashboard.increment(&count).await }
    });
    wait_for_state(&dashboard, |s| s.field(&count).is_some_and(|f| f.loading)).await;
    assert!(dashboard
        .settled_within(Duration::from_millis(50))
        .await
        .is_none());

    gate.notify_one();
    pending.await.expect("join");
    assert!(dashboard
        .settled_within(Duration::from_secs(5))
        .await
        .is_some());
}

#[tokio::test]
async fn grading_dashboard_tracks_both_fields() {
    let memory = MemoryCounterStore::new();
    memory.put_record(record(
        ALICE,
        &[(CounterField::prompt_count(), 2)],
    ));
    memory.put_record(record(
        BOB,
        &[
            (CounterField::prompt_count(), 3),
            (CounterField::graded_count(), 7),
        ],
    ));
    let dashboard = start(
        Arc::new(TestStore::new(memory)),
        DashboardConfig::grading(),
    )
    .await;

    let state = dashboard.settled().await;
    assert_eq!(own_and_total(&state, &CounterField::prompt_count()), (2, 5));
    assert_eq!(own_and_total(&state, &CounterField::graded_count()), (0, 7));
    assert!(state.can_decrement(&CounterField::prompt_count()));
    assert!(!state.can_decrement(&CounterField::graded_count()));
    assert!(state.field(&CounterField::count()).is_none());
}

#[tokio::test]
async fn stopped_dashboard_publishes_nothing_more() {
    let memory = MemoryCounterStore::new();
    let mut dashboard = start(
        Arc::new(TestStore::new(memory.clone())),
        DashboardConfig::tally(),
    )
    .await;
    let before = dashboard.settled().await;
    let mut state = dashboard.state();
    state.borrow_and_update();

    dashboard.stop();
    dashboard.stop();
    assert_eq!(memory.subscriber_count(), 0);

    memory.put_record(record(ALICE, &[(CounterField::count(), 3)]));
    memory.put_record(record(BOB, &[(CounterField::count(), 8)]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!state.has_changed().expect("sender alive"));
    assert_eq!(dashboard.snapshot(), before);
}

#[tokio::test]
async fn sign_out_stops_first_and_swallows_failure() {
    let memory = MemoryCounterStore::new();
    let session = Arc::new(LocalSession::signed_in(alice()));
    let engine = AggregationEngine::new(
        Arc::new(TestStore::new(memory.clone())),
        DashboardConfig::tally(),
    );
    let mut dashboard = Dashboard::start(engine, session.clone())
        .await
        .expect("dashboard");
    dashboard.settled().await;

    assert!(dashboard.sign_out().await);
    assert_eq!(memory.subscriber_count(), 0);
    assert!(session.current_user().await.is_none());

    // Already signed out: the failure is logged, not raised.
    assert!(!dashboard.sign_out().await);
}

#[tokio::test]
async fn mutations_after_sign_out_never_reach_the_store() {
    let memory = MemoryCounterStore::new();
    memory.put_record(record(ALICE, &[(CounterField::count(), 2)]));
    let store = Arc::new(TestStore::new(memory));
    let mut dashboard = start(Arc::clone(&store), DashboardConfig::tally()).await;
    let count = CounterField::count();
    dashboard.settled().await;

    assert!(dashboard.sign_out().await);
    assert_eq!(
        dashboard.increment(&count).await,
        MutationOutcome::Skipped(SkipReason::Stopped)
    );
    assert_eq!(
        dashboard.decrement(&count).await,
        MutationOutcome::Skipped(SkipReason::Stopped)
    );
    assert_eq!(store.increments(), 0);
    assert_eq!(
        store.memory.record(ALICE).map(|r| r.value(&count)),
        Some(2)
    );
}
