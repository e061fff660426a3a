use async_trait::async_trait;
use shared::{
    domain::SessionUser,
    protocol::{LoginRequest, LoginResponse},
};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{check_response, ClientError, Result};

/// Who is signed in, and the ability to end that.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_user(&self) -> Option<SessionUser>;
    async fn sign_out(&self) -> Result<()>;
}

/// A session that already knows its user. Used by tools and tests.
#[derive(Debug, Default)]
pub struct LocalSession {
    user: RwLock<Option<SessionUser>>,
}

impl LocalSession {
    pub fn signed_in(user: SessionUser) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionProvider for LocalSession {
    async fn current_user(&self) -> Option<SessionUser> {
        self.user.read().await.clone()
    }

    async fn sign_out(&self) -> Result<()> {
        self.user
            .write()
            .await
            .take()
            .map(|_| ())
            .ok_or(ClientError::NotSignedIn)
    }
}

/// A session obtained from the server's `/login` endpoint.
#[derive(Debug)]
pub struct HttpSession {
    server_url: String,
    user: RwLock<Option<SessionUser>>,
}

impl HttpSession {
    pub async fn sign_in(
        server_url: &str,
        username: &str,
        display_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Self> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let response = reqwest::Client::new()
            .post(format!("{server_url}/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                display_name: display_name.map(str::to_string),
                email: email.map(str::to_string),
            })
            .send()
            .await?;
        let body: LoginResponse = check_response(response).await?.json().await?;
        info!(user_id = body.user.user_id.0, %server_url, "signed in");

        Ok(Self {
            server_url,
            user: RwLock::new(Some(body.user)),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl SessionProvider for HttpSession {
    async fn current_user(&self) -> Option<SessionUser> {
        self.user.read().await.clone()
    }

    async fn sign_out(&self) -> Result<()> {
        let user = self.user.write().await.take().ok_or(ClientError::NotSignedIn)?;
        info!(user_id = user.user_id.0, "signed out");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
