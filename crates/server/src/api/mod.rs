use shared::{
    domain::{CounterField, CounterRecord, SessionUser, UserId},
    error::{ApiError, ErrorCode},
    protocol::{IncrementResponse, LoginRequest},
};
use storage::{Storage, StorageError};

pub const DEFAULT_ORDER_FIELD: &str = "count";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn login(ctx: &ApiContext, req: &LoginRequest) -> Result<SessionUser, ApiError> {
    let display_name = non_blank(req.display_name.as_deref());
    let email = non_blank(req.email.as_deref());
    let user_id = ctx
        .storage
        .create_user(&req.username, display_name, email)
        .await
        .map_err(storage_error)?;
    ctx.storage
        .load_user(user_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::internal("user vanished after login"))
}

pub async fn load_record(ctx: &ApiContext, user_id: UserId) -> Result<CounterRecord, ApiError> {
    ctx.storage
        .load_record(user_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found("record not found"))
}

pub async fn list_records(
    ctx: &ApiContext,
    order_by: &CounterField,
) -> Result<Vec<CounterRecord>, ApiError> {
    ctx.storage
        .list_records(order_by)
        .await
        .map_err(storage_error)
}

/// Applies `delta` to `owner`'s counter. Only the owner may mutate their own record.
pub async fn increment_counter(
    ctx: &ApiContext,
    actor: UserId,
    owner: UserId,
    field: &str,
    delta: i64,
) -> Result<IncrementResponse, ApiError> {
    if actor != owner {
        return Err(ApiError::forbidden(
            "records may only be modified by their owner",
        ));
    }
    let field = CounterField::parse(field)?;
    if delta == 0 {
        return Err(ApiError::validation("delta must be non-zero"));
    }

    let value = ctx
        .storage
        .atomic_increment(owner, &field, delta)
        .await
        .map_err(storage_error)?;
    Ok(IncrementResponse {
        user_id: owner,
        field,
        value,
    })
}

pub fn parse_order_field(raw: Option<&str>) -> Result<CounterField, ApiError> {
    Ok(CounterField::parse(raw.unwrap_or(DEFAULT_ORDER_FIELD))?)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::UnknownUser(_) => ApiError::new(ErrorCode::NotFound, err.to_string()),
        StorageError::EmptyUsername => ApiError::new(ErrorCode::Validation, err.to_string()),
        other => ApiError::new(ErrorCode::Internal, other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
