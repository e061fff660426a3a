use shared::error::ApiError;
use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("server rejected request: {0}")]
    Server(ApiError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("dashboard must track at least one counter field")]
    NoTrackedFields,
}

/// Passes successful responses through; turns anything else into a `ClientError`,
/// preferring the server's own `ApiError` body when it sent one.
pub(crate) async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(error) => Err(ClientError::Server(error)),
        Err(_) => Err(ClientError::Unavailable(format!(
            "server responded with {status}"
        ))),
    }
}
