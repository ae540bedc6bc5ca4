//! Outbound authentication.
//!
//! Applies the integration's auth scheme to a request. OAuth2 uses the
//! client-credentials grant; tokens are cached in memory and persisted back to
//! the integration record so restarts and other workers can reuse them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

use super::ActionError;
use crate::engine::storage::RemediationStore;
use crate::models::{AuthType, Id, Integration};

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// A token is usable when it has an expiry more than a minute away.
fn is_fresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(expiry) if expiry - now > Duration::minutes(1))
}

pub struct Authenticator {
    client: Client,
    store: Arc<dyn RemediationStore>,
    tokens: DashMap<Id, CachedToken>,
}

impl Authenticator {
    pub fn new(client: Client, store: Arc<dyn RemediationStore>) -> Self {
        Self {
            client,
            store,
            tokens: DashMap::new(),
        }
    }

    /// Attach credentials for `integration` to `request`.
    pub async fn apply(&self, request: RequestBuilder, integration: &Integration) -> Result<RequestBuilder, ActionError> {
        let creds = &integration.credentials;
        let scheme = integration.auth_type.as_str();

        Ok(match integration.auth_type {
            AuthType::None => request,
            AuthType::Basic => request.basic_auth(
                creds.require(scheme, "username")?,
                Some(creds.require(scheme, "password")?),
            ),
            AuthType::Bearer => request.bearer_auth(creds.require(scheme, "token")?),
            AuthType::ApiKey => {
                let header = creds.get("header_name").unwrap_or(DEFAULT_API_KEY_HEADER);
                request.header(header, creds.require(scheme, "api_key")?)
            }
            AuthType::OAuth2 => request.bearer_auth(self.oauth_token(integration).await?),
        })
    }

    async fn oauth_token(&self, integration: &Integration) -> Result<String, ActionError> {
        let now = Utc::now();

        if let Some(cached) = self.tokens.get(&integration.id) {
            if is_fresh(cached.expires_at, now) {
                return Ok(cached.access_token.clone());
            }
        }

        if let Some(token) = integration.oauth_token.as_deref().filter(|t| !t.is_empty()) {
            if is_fresh(integration.oauth_token_expires_at, now) {
                self.tokens.insert(
                    integration.id,
                    CachedToken {
                        access_token: token.to_string(),
                        expires_at: integration.oauth_token_expires_at,
                    },
                );
                return Ok(token.to_string());
            }
        }

        self.refresh(integration).await
    }

    async fn refresh(&self, integration: &Integration) -> Result<String, ActionError> {
        let creds = &integration.credentials;
        let endpoint = integration
            .token_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ActionError::Configuration(format!("integration {} has no token endpoint", integration.name)))?;

        debug!("Refreshing OAuth2 token for {}", integration.name);

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", creds.require("oauth2", "client_id")?),
            ("client_secret", creds.require("oauth2", "client_secret")?),
        ];
        if let Some(scope) = creds.get("scope") {
            form.push(("scope", scope));
        }

        let response = self
            .client
            .post(endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| ActionError::TokenRefresh(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ActionError::TokenRefresh(format!(
                "auth server returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ActionError::TokenRefresh(format!("invalid token response: {}", e)))?;

        let lifetime = token.expires_in.filter(|s| *s > 0).unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Utc::now() + Duration::seconds(lifetime);

        if let Err(e) = self
            .store
            .save_oauth_token(integration.id, &token.access_token, Some(expires_at))
            .await
        {
            warn!("Failed to persist OAuth2 token for {}: {}", integration.name, e);
        }

        self.tokens.insert(
            integration.id,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: Some(expires_at),
            },
        );

        Ok(token.access_token)
    }
}
