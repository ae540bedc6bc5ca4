// Action Executor
// Performs one remediation action against an integration

//! # Action Executor Module
//!
//! An action is one rendered request against one integration. The executor
//! owns everything that makes that request reliable:
//!
//! - **Circuit breaker** (`circuit`): read fresh from storage before any I/O
//! - **Rate limiting** (`rate_limit`): a per-integration token bucket awaited before every attempt
//! - **Authentication** (`auth`): basic, bearer, API key and OAuth2 client credentials
//! - **Templating** (`template`): minijinja rendering of paths and bodies
//! - **Protocols**: `rest`, `winrm` and `ssf` handlers, selected by [`ProtocolKind`]
//!
//! ## Retry policy
//!
//! An action gets `retry_count + 1` attempts with exponential backoff
//! (`base * 2^(n-1)` before retry `n`). A 401/403 stops retrying. Template,
//! credential and signing errors are returned immediately and never count
//! against the breaker. Exhausting every attempt counts one breaker failure.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait at the seam
//! The runner depends on [`ActionExecutor`], not on [`HttpActionExecutor`].
//! Tests substitute a scripted double without touching the network.
//!
//! ### Split `impl` blocks
//! Each protocol lives in its own file as a separate `impl HttpActionExecutor`
//! block. Child modules can read the parent's private fields, so the handlers
//! share the client, authenticator and renderer without extra plumbing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::engine::storage::RemediationStore;
use crate::models::{ActionDefinition, Integration, MissingCredential, ProtocolKind};
use crate::security::redact;

pub mod auth;
pub mod circuit;
pub mod rate_limit;
pub mod rest;
pub mod ssf;
pub mod template;
pub mod winrm;

pub use auth::Authenticator;
pub use circuit::CircuitBreaker;
pub use rate_limit::RateLimiterRegistry;
pub use template::{ssf_event_type, TemplateRenderer};

/// Failure of a single action execution.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("circuit open for integration {integration}")]
    CircuitOpen { integration: String },

    #[error("template error: {0}")]
    Template(String),

    #[error(transparent)]
    MissingCredential(#[from] MissingCredential),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The remote side ran the action and reported failure (WinRM exit code)
    #[error("remote execution failed: {0}")]
    Remote(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<ActionError> },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ActionError {
    /// HTTP status of the (last) failing response, if there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ActionError::Http { status, .. } => Some(*status),
            ActionError::Exhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// Response body of the (last) failing response, if there was one.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            ActionError::Http { body, .. } => Some(body),
            ActionError::Exhausted { last, .. } => last.response_body(),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status_code(), Some(401) | Some(403))
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_local() && !matches!(self, ActionError::Exhausted { .. }) && !self.is_auth_failure()
    }

    /// Errors raised before any request left the process.
    fn is_local(&self) -> bool {
        matches!(
            self,
            ActionError::Template(_)
                | ActionError::MissingCredential(_)
                | ActionError::Configuration(_)
                | ActionError::Signing(_)
                | ActionError::CircuitOpen { .. }
        )
    }
}

impl From<minijinja::Error> for ActionError {
    fn from(err: minijinja::Error) -> Self {
        ActionError::Template(err.to_string())
    }
}

/// Successful outcome of an action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionResponse {
    /// `None` for protocols without a status (WinRM)
    pub status_code: Option<u16>,
    pub body: String,
}

impl ActionResponse {
    /// Body pretty-printed with secrets masked when it is JSON, otherwise as received.
    pub fn pretty_body(&self) -> String {
        serde_json::from_str::<Value>(&self.body)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&redact(&value)).ok())
            .unwrap_or_else(|| self.body.clone())
    }
}

/// Executes one action against one integration with the given step context.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError>;
}

/// Delay before retry number `retry` (1-based).
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Production executor speaking REST, WinRM and SSF.
pub struct HttpActionExecutor {
    client: Client,
    auth: Authenticator,
    breaker: CircuitBreaker,
    limiters: RateLimiterRegistry,
    renderer: TemplateRenderer,
    config: ExecutorConfig,
}

impl HttpActionExecutor {
    pub fn new(store: Arc<dyn RemediationStore>, config: ExecutorConfig) -> crate::Result<Self> {
        let client = Client::builder().timeout(config.http_timeout()).build()?;
        Ok(Self {
            auth: Authenticator::new(client.clone(), store.clone()),
            breaker: CircuitBreaker::new(store, config.circuit_trip_threshold),
            limiters: RateLimiterRegistry::new(),
            renderer: TemplateRenderer::new(),
            client,
            config,
        })
    }

    fn render(&self, source: &str, context: &Map<String, Value>) -> Result<String, ActionError> {
        Ok(self.renderer.render(source, context)?)
    }

    fn log_payload(&self, integration: &Integration, target: &str, body: &str) {
        if !self.config.debug_payloads {
            return;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) => debug!(
                integration = %integration.name,
                "Rendered payload for {}: {}",
                target,
                redact(&value)
            ),
            Err(_) => debug!(
                integration = %integration.name,
                "Rendered non-JSON payload for {} ({} bytes)",
                target,
                body.len()
            ),
        }
    }

    async fn dispatch(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError> {
        match integration.protocol {
            ProtocolKind::Rest => self.execute_rest(integration, action, context).await,
            ProtocolKind::WinRm => self.execute_winrm(integration, action, context).await,
            ProtocolKind::Ssf => self.execute_ssf(integration, action, context).await,
        }
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError> {
        self.breaker.check(integration).await?;
        integration.validate_credentials()?;

        let attempts = action.attempts(self.config.default_retry_count);
        let mut made = 0;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(self.config.backoff_base(), attempt - 1)).await;
            }
            self.limiters.acquire(integration.id, integration.rate_limit).await;
            made = attempt;

            match self.dispatch(integration, action, context).await {
                Ok(response) => {
                    self.breaker.record_success(integration).await;
                    return Ok(response);
                }
                Err(err) if err.is_local() => return Err(err),
                Err(err) if !err.is_retryable() => {
                    warn!(
                        integration = %integration.name,
                        "Action '{}' rejected with {}, not retrying",
                        action.name,
                        err
                    );
                    last_error = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(
                        integration = %integration.name,
                        "Action '{}' attempt {}/{} failed: {}",
                        action.name,
                        attempt,
                        attempts,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        self.breaker.record_failure(integration).await;

        let last = last_error.unwrap_or_else(|| ActionError::Transport("no attempt was made".to_string()));
        Err(ActionError::Exhausted {
            attempts: made,
            last: Box::new(last),
        })
    }
}

#[cfg(test)]
mod tests;
