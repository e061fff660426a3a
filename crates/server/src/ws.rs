use std::{collections::BTreeMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::{CounterField, SubscriptionId, UserId},
    error::ApiError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    api,
    app_state::{AppState, RecordChanged},
};

type WsSender = SplitSink<WebSocket, Message>;

/// What a single client-side subscription is watching.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Watch {
    Record(UserId),
    Collection(CounterField),
}

impl Watch {
    fn is_affected_by(&self, change: RecordChanged) -> bool {
        match self {
            Self::Record(user_id) => *user_id == change.user_id,
            Self::Collection(_) => true,
        }
    }
}

pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.changes.subscribe();
    let mut watches: BTreeMap<SubscriptionId, Watch> = BTreeMap::new();
    info!(user_id = user_id.0, "subscriber connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        warn!(user_id = user_id.0, %error, "websocket receive failed");
                        break;
                    }
                };
                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => request,
                    Err(error) => {
                        let event = ServerEvent::Error(ApiError::validation(format!(
                            "invalid client request: {error}"
                        )));
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if handle_request(&state, &mut sender, &mut watches, request)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            change = changes.recv() => {
                let result = match change {
                    Ok(change) => {
                        push_snapshots(&state, &mut sender, &watches, |watch| {
                            watch.is_affected_by(change)
                        })
                        .await
                    }
                    // Snapshots are full state, so resending all of them covers whatever was skipped.
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id = user_id.0, skipped, "change feed lagged; resnapshotting");
                        push_snapshots(&state, &mut sender, &watches, |_| true).await
                    }
                    Err(RecvError::Closed) => break,
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        user_id = user_id.0,
        subscriptions = watches.len(),
        "subscriber disconnected"
    );
}

async fn handle_request(
    state: &AppState,
    sender: &mut WsSender,
    watches: &mut BTreeMap<SubscriptionId, Watch>,
    request: ClientRequest,
) -> Result<(), axum::Error> {
    let (subscription_id, watch) = match request {
        ClientRequest::SubscribeRecord {
            subscription_id,
            user_id,
        } => (subscription_id, Watch::Record(user_id)),
        ClientRequest::SubscribeCollection {
            subscription_id,
            order_by,
        } => (subscription_id, Watch::Collection(order_by)),
        ClientRequest::Unsubscribe { subscription_id } => {
            watches.remove(&subscription_id);
            debug!(subscription_id = subscription_id.0, "unsubscribed");
            return Ok(());
        }
    };

    debug!(subscription_id = subscription_id.0, ?watch, "subscribed");
    let event = snapshot_event(state, subscription_id, &watch).await;
    watches.insert(subscription_id, watch);
    send_event(sender, &event).await
}

async fn push_snapshots(
    state: &AppState,
    sender: &mut WsSender,
    watches: &BTreeMap<SubscriptionId, Watch>,
    affected: impl Fn(&Watch) -> bool,
) -> Result<(), axum::Error> {
    for (subscription_id, watch) in watches {
        if !affected(watch) {
            continue;
        }
        let event = snapshot_event(state, *subscription_id, watch).await;
        send_event(sender, &event).await?;
    }
    Ok(())
}

async fn snapshot_event(
    state: &AppState,
    subscription_id: SubscriptionId,
    watch: &Watch,
) -> ServerEvent {
    let storage = &state.api.storage;
    match watch {
        Watch::Record(user_id) => match storage.load_record(*user_id).await {
            Ok(record) => ServerEvent::RecordSnapshot {
                subscription_id,
                record,
            },
            Err(error) => ServerEvent::Error(ApiError::internal(error.to_string())),
        },
        Watch::Collection(order_by) => match api::list_records(&state.api, order_by).await {
            Ok(records) => ServerEvent::CollectionSnapshot {
                subscription_id,
                records,
            },
            Err(error) => ServerEvent::Error(error),
        },
    }
}

async fn send_event(sender: &mut WsSender, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to encode server event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}
