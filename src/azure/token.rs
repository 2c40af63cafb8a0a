use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::types::TokenResponse;

/// Refresh this many seconds before Azure AD says the token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + REFRESH_MARGIN_SECS < self.expires_at
    }
}

/// Client-credentials token cache shared by all scrapes.
///
/// The lock is held for the whole check-then-fetch sequence, so overlapping
/// scrapes that find an expired token wait for a single refresh instead of
/// each requesting their own.
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    resource: String,
    current: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(
        http: reqwest::Client,
        authority_url: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        resource: &str,
    ) -> Self {
        Self {
            http,
            token_url: format!("{}/{}/oauth2/token", authority_url.trim_end_matches('/'), tenant_id),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            resource: resource.to_string(),
            current: Mutex::new(None),
        }
    }

    /// Returns a valid bearer token, fetching a new one if needed.
    pub async fn bearer(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        let now = Utc::now().timestamp();

        if let Some(token) = current.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *current = Some(token);

        Ok(value)
    }

    async fn fetch(&self) -> Result<AccessToken> {
        debug!(url = %self.token_url, "requesting access token");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("resource", self.resource.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .context("requesting access token")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from token endpoint: {body}");
        }

        let resp: TokenResponse = response
            .json()
            .await
            .context("decoding token response")?;

        let expires_at = resp
            .expires_on
            .as_i64()
            .with_context(|| format!("parsing token expiry {:?}", resp.expires_on))?;

        info!(expires_at, "acquired access token");

        Ok(AccessToken {
            value: resp.access_token,
            expires_at,
        })
    }
}
