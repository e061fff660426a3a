pub mod dashboard;
pub mod engine;
pub mod error;
pub mod memory_store;
pub mod remote_store;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

pub use dashboard::{Dashboard, DashboardState, FieldState};
pub use engine::{
    AggregateCounters, AggregationEngine, DashboardConfig, MutationOutcome, OwnCounters,
    SkipReason,
};
pub use error::{ClientError, Result};
pub use memory_store::MemoryCounterStore;
pub use remote_store::{ReconnectPolicy, RemoteCounterStore};
pub use session::{HttpSession, LocalSession, SessionProvider};
pub use store::{CounterStore, Subscription, SubscriptionHandle};
