use crate::api::ApiContext;
use shared::domain::UserId;
use tokio::sync::broadcast;

/// Published after every successful mutation of a user's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordChanged {
    pub(crate) user_id: UserId,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) changes: broadcast::Sender<RecordChanged>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, event_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(event_buffer.max(1));
        Self { api, changes }
    }
}
