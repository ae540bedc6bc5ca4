//! Integrations: configured third-party endpoints.
//!
//! An integration is either a *poller* (an issue source, designated by a
//! marker in its name) or a remediation target. Both share the same record.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::Id;

/// Wire protocol used to talk to an integration.
///
/// Parsed once when the integration is loaded; an unknown protocol string is
/// a configuration error, not a call-time failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum ProtocolKind {
    Rest,
    WinRm,
    Ssf,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Rest => "REST",
            ProtocolKind::WinRm => "WINRM",
            ProtocolKind::Ssf => "SSF",
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "REST" | "HTTP" => Ok(ProtocolKind::Rest),
            "WINRM" => Ok(ProtocolKind::WinRm),
            "SSF" => Ok(ProtocolKind::Ssf),
            other => Err(format!("unknown protocol type '{}'", other)),
        }
    }
}

impl TryFrom<String> for ProtocolKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolKind> for &'static str {
    fn from(kind: ProtocolKind) -> Self {
        kind.as_str()
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication scheme applied to outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
    ApiKey,
    OAuth2,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Basic => "basic",
            AuthType::Bearer => "bearer",
            AuthType::ApiKey => "apikey",
            AuthType::OAuth2 => "oauth2",
        }
    }

    /// Credential keys that must be present for this scheme.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            AuthType::None => &[],
            AuthType::Basic => &["username", "password"],
            AuthType::Bearer => &["token"],
            AuthType::ApiKey => &["api_key"],
            AuthType::OAuth2 => &["client_id", "client_secret"],
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "basic" => Ok(AuthType::Basic),
            "bearer" => Ok(AuthType::Bearer),
            "apikey" | "api_key" => Ok(AuthType::ApiKey),
            "oauth2" => Ok(AuthType::OAuth2),
            other => Err(format!("unknown auth type '{}'", other)),
        }
    }
}

impl TryFrom<String> for AuthType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AuthType> for &'static str {
    fn from(kind: AuthType) -> Self {
        kind.as_str()
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A required credential key is absent or empty.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{scheme} credentials require '{key}'")]
pub struct MissingCredential {
    pub scheme: String,
    pub key: String,
}

/// Decrypted credential map.
///
/// The schema varies per auth type and protocol, so this stays a string map
/// at the boundary. Non-string JSON values are stringified on load so a
/// numeric `port` or boolean flag does not break deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a plaintext JSON credential blob. Blank input yields an empty map.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn require(&self, scheme: &str, key: &str) -> Result<&str, MissingCredential> {
        self.get(key).ok_or_else(|| MissingCredential {
            scheme: scheme.to_string(),
            key: key.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = HashMap::<String, Value>::deserialize(deserializer)?;
        let map = raw
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::Null => None,
                Value::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect();
        Ok(Credentials(map))
    }
}

/// Circuit breaker state as persisted on the integration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub consecutive_failures: i32,
    pub is_available: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            is_available: true,
        }
    }
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        !self.is_available
    }

    /// A success only needs to write back when something was recorded.
    pub fn needs_reset(&self) -> bool {
        self.consecutive_failures > 0 || !self.is_available
    }
}

/// A configured third-party endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Id,
    pub tenant_id: Id,
    pub name: String,
    pub protocol: ProtocolKind,
    pub base_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between polls; only meaningful for pollers
    #[serde(default)]
    pub polling_interval_secs: i64,
    /// Requests per second, 0 = unlimited
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub oauth_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: i32,
    #[serde(default = "default_true")]
    pub is_available: bool,
}

fn default_true() -> bool {
    true
}

impl Integration {
    /// Minimal enabled REST integration; fields are public for further tweaks.
    pub fn new(id: Id, tenant_id: Id, name: impl Into<String>, protocol: ProtocolKind, base_url: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            name: name.into(),
            protocol,
            base_url: base_url.into(),
            auth_type: AuthType::None,
            credentials: Credentials::default(),
            enabled: true,
            polling_interval_secs: 0,
            rate_limit: 0.0,
            token_endpoint: None,
            oauth_token: None,
            oauth_token_expires_at: None,
            consecutive_failures: 0,
            is_available: true,
        }
    }

    pub fn circuit(&self) -> CircuitState {
        CircuitState {
            consecutive_failures: self.consecutive_failures,
            is_available: self.is_available,
        }
    }

    /// Pollers are designated by a case-insensitive marker in the name.
    pub fn is_poller(&self, marker: &str) -> bool {
        self.name.to_lowercase().contains(&marker.to_lowercase())
    }

    pub fn poll_interval(&self, default: Duration) -> Duration {
        if self.polling_interval_secs > 0 {
            Duration::from_secs(self.polling_interval_secs as u64)
        } else {
            default
        }
    }

    /// Check that the credentials carry every key the protocol and auth scheme need.
    pub fn validate_credentials(&self) -> Result<(), MissingCredential> {
        for key in self.auth_type.required_keys() {
            self.credentials.require(self.auth_type.as_str(), key)?;
        }
        if self.auth_type == AuthType::OAuth2
            && self.token_endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err(MissingCredential {
                scheme: "oauth2".to_string(),
                key: "token_endpoint".to_string(),
            });
        }
        match self.protocol {
            ProtocolKind::WinRm => {
                self.credentials.require("winrm", "username")?;
                self.credentials.require("winrm", "password")?;
            }
            ProtocolKind::Ssf => {
                self.credentials.require("ssf", "private_key")?;
            }
            ProtocolKind::Rest => {}
        }
        Ok(())
    }
}
