use serde::{Deserialize, Serialize};

use crate::{
    domain::{CounterField, CounterRecord, SessionUser, SubscriptionId, UserId},
    error::ApiError,
};

/// Messages a client sends over the `/ws` socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SubscribeRecord {
        subscription_id: SubscriptionId,
        user_id: UserId,
    },
    SubscribeCollection {
        subscription_id: SubscriptionId,
        order_by: CounterField,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
}

impl ClientRequest {
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            Self::SubscribeRecord {
                subscription_id, ..
            }
            | Self::SubscribeCollection {
                subscription_id, ..
            }
            | Self::Unsubscribe { subscription_id } => *subscription_id,
        }
    }
}

/// Messages the server pushes over the `/ws` socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    RecordSnapshot {
        subscription_id: SubscriptionId,
        #[serde(default)]
        record: Option<CounterRecord>,
    },
    CollectionSnapshot {
        subscription_id: SubscriptionId,
        records: Vec<CounterRecord>,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: SessionUser,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IncrementRequest {
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementResponse {
    pub user_id: UserId,
    pub field: CounterField,
    pub value: i64,
}
