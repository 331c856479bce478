//! Room authorization against the external Authentication Service.

use async_trait::async_trait;
use shared::AuthLookupResponse;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication service request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fetch the rooms a user may enter.
    async fn lookup(&self, user_id: &str) -> Result<AuthLookupResponse, AuthError>;
}

/// `GET {base_url}/authenticate?email={user_id}` → `{ success, rooms }`.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthenticator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/authenticate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn lookup(&self, user_id: &str) -> Result<AuthLookupResponse, AuthError> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[("email", user_id)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<AuthLookupResponse>().await?)
    }
}

/// Fail-closed membership check: any transport error or `success=false`
/// denies the room.
pub async fn is_authorized(auth: &dyn Authenticator, user_id: &str, room_id: &str) -> bool {
    match auth.lookup(user_id).await {
        Ok(resp) if resp.success => {
            let allowed = resp.rooms.iter().any(|room| room == room_id);
            debug!(user_id, room_id, allowed, rooms = ?resp.rooms, "room authorization");
            allowed
        }
        Ok(_) => {
            warn!(user_id, room_id, "authentication service returned unsuccessful response");
            false
        }
        Err(e) => {
            warn!(user_id, room_id, error = %e, "authentication lookup failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAuth(Option<AuthLookupResponse>);

    #[async_trait]
    impl Authenticator for FixedAuth {
        async fn lookup(&self, _user_id: &str) -> Result<AuthLookupResponse, AuthError> {
            match &self.0 {
                Some(resp) => Ok(resp.clone()),
                None => Err(unreachable_service().await),
            }
        }
    }

    async fn unreachable_service() -> AuthError {
        // Port 9 (discard) on localhost is expected to refuse the connection.
        let auth = HttpAuthenticator::new("http://127.0.0.1:9", Duration::from_millis(200))
            .expect("client");
        auth.lookup("nobody").await.expect_err("no service on port 9")
    }

    fn rooms(success: bool, rooms: &[&str]) -> AuthLookupResponse {
        AuthLookupResponse {
            success,
            rooms: rooms.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_room_in_list_is_authorized() {
        let auth = FixedAuth(Some(rooms(true, &["r1", "r2"])));
        assert!(is_authorized(&auth, "alice", "r2").await);
        assert!(!is_authorized(&auth, "alice", "r3").await);
    }

    #[tokio::test]
    async fn test_unsuccessful_response_denies() {
        let auth = FixedAuth(Some(rooms(false, &["r1"])));
        assert!(!is_authorized(&auth, "alice", "r1").await);
    }

    #[tokio::test]
    async fn test_transport_failure_denies() {
        let auth = FixedAuth(None);
        assert!(!is_authorized(&auth, "alice", "r1").await);
    }

    #[test]
    fn test_endpoint_tolerates_trailing_slash() {
        let auth = HttpAuthenticator::new("http://auth.local/", Duration::from_secs(1)).expect("client");
        assert_eq!(auth.endpoint(), "http://auth.local/authenticate");
    }
}
