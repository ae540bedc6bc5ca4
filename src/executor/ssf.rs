//! Shared Signals (SSF) push delivery.
//!
//! The action body renders to `{"subject": ..., "events": ...}`. That payload
//! is wrapped in a Security Event Token, signed RS256 with the integration's
//! private key and POSTed as `application/secevent+jwt`.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::rest::{join_url, parse_method};
use super::{ActionError, ActionResponse, HttpActionExecutor};
use crate::models::{ActionDefinition, Integration};

pub const SET_CONTENT_TYPE: &str = "application/secevent+jwt";
const SET_TYP: &str = "secevent+jwt";

/// Rendered action body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SsfPayload {
    #[serde(default)]
    pub subject: Option<Value>,
    #[serde(default)]
    pub events: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct SetClaims {
    iss: String,
    iat: i64,
    jti: String,
    events: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<Value>,
}

/// Accept PKCS#1 or PKCS#8 PEM, including keys stored with literal `\n`.
fn signing_key(pem: &str) -> Result<EncodingKey, ActionError> {
    let pem = pem.replace("\\n", "\n");
    let pem = pem.trim();

    let key = RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| ActionError::Signing(format!("unsupported private key: {}", e)))?;
    let der = key
        .to_pkcs1_der()
        .map_err(|e| ActionError::Signing(e.to_string()))?;
    Ok(EncodingKey::from_rsa_der(der.as_bytes()))
}

/// Build and sign a Security Event Token.
pub fn sign_set(
    payload: SsfPayload,
    issuer: &str,
    private_key_pem: &str,
    key_id: Option<&str>,
) -> Result<String, ActionError> {
    let key = signing_key(private_key_pem)?;

    let mut header = Header::new(Algorithm::RS256);
    header.typ = Some(SET_TYP.to_string());
    header.kid = key_id.filter(|k| !k.is_empty()).map(str::to_string);

    let claims = SetClaims {
        iss: issuer.to_string(),
        iat: chrono::Utc::now().timestamp(),
        jti: Uuid::new_v4().to_string(),
        events: payload.events,
        subject: payload.subject.filter(|s| !s.is_null()),
    };

    encode(&header, &claims, &key).map_err(|e| ActionError::Signing(e.to_string()))
}

impl HttpActionExecutor {
    pub(super) async fn execute_ssf(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError> {
        let rendered = self.render(&action.body_template, context)?;
        let payload: SsfPayload = serde_json::from_str(&rendered)
            .map_err(|e| ActionError::Template(format!("SSF payload is not valid JSON: {}", e)))?;

        let creds = &integration.credentials;
        let issuer = creds.get("issuer").unwrap_or(&integration.name);
        let token = sign_set(
            payload,
            issuer,
            creds.require("ssf", "private_key")?,
            creds.get("key_id"),
        )?;

        let path = self.render(&action.path_template, context)?;
        let url = join_url(&integration.base_url, &path);
        self.log_payload(integration, &url, &rendered);

        let request = self
            .client
            .request(parse_method(&action.method)?, &url)
            .header(CONTENT_TYPE, SET_CONTENT_TYPE)
            .header(ACCEPT, "application/json")
            .body(token);
        let request = self.auth.apply(request, integration).await?;

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;

        if status >= 400 {
            return Err(ActionError::Http { status, body });
        }
        Ok(ActionResponse {
            status_code: Some(status),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
    use mockito::{Matcher, Server};
    use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPublicKey;
    use serde_json::json;

    use super::*;
    use crate::config::ExecutorConfig;
    use crate::engine::storage::{InMemoryStore, RemediationStore};
    use crate::executor::ActionExecutor;
    use crate::models::{Credentials, ProtocolKind};

    fn keypair() -> (String, String) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let private_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().as_str().to_owned();
        let public_pem = RsaPublicKey::from(&key).to_pkcs1_pem(LineEnding::LF).unwrap();
        (private_pem, public_pem)
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation
    }

    #[test]
    fn signed_set_carries_claims_and_header() {
        let (private_pem, public_pem) = keypair();
        let payload: SsfPayload = serde_json::from_value(json!({
            "subject": {"format": "email", "email": "jdoe@corp.test"},
            "events": {"https://schemas.openid.net/secevent/caep/event-type/session-revoked": {}}
        }))
        .unwrap();

        let token = sign_set(payload, "https://engine.test", &private_pem, Some("key-1")).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some("secevent+jwt"));
        assert_eq!(header.kid.as_deref(), Some("key-1"));

        let decoded = decode::<Value>(
            &token,
            &DecodingKey::from_rsa_pem(public_pem.as_bytes()).unwrap(),
            &validation(),
        )
        .unwrap();
        let claims = decoded.claims;
        assert_eq!(claims["iss"], "https://engine.test");
        assert_eq!(claims["subject"]["email"], "jdoe@corp.test");
        assert!(claims["iat"].as_i64().unwrap() > 0);
        assert!(Uuid::parse_str(claims["jti"].as_str().unwrap()).is_ok());
        assert!(claims["events"]
            .get("https://schemas.openid.net/secevent/caep/event-type/session-revoked")
            .is_some());
    }

    #[test]
    fn escaped_newlines_in_keys_are_accepted() {
        let (private_pem, _) = keypair();
        let escaped = private_pem.replace('\n', "\\n");
        assert!(sign_set(SsfPayload::default(), "iss", &escaped, None).is_ok());
    }

    #[test]
    fn garbage_keys_are_signing_errors() {
        let err = sign_set(SsfPayload::default(), "iss", "not a key", None).unwrap_err();
        assert!(matches!(err, ActionError::Signing(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn set_is_pushed_with_secevent_content_type() {
        let (private_pem, _) = keypair();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/events")
            .match_header("content-type", SET_CONTENT_TYPE)
            .match_header("accept", "application/json")
            .match_body(Matcher::Regex(r"^eyJ[\w-]+\.[\w-]+\.[\w-]+$".to_string()))
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(InMemoryStore::new());
        let mut integration = Integration::new(0, 1, "Receiver", ProtocolKind::Ssf, server.url());
        integration.credentials = Credentials::new().with("private_key", private_pem);
        let integration = store.upsert_integration(integration).await.unwrap();

        let executor = HttpActionExecutor::new(store.clone(), ExecutorConfig::default()).unwrap();
        let action = ActionDefinition {
            id: 1,
            tenant_id: 1,
            integration_id: integration.id,
            name: "Revoke sessions".to_string(),
            method: "POST".to_string(),
            path_template: "/events".to_string(),
            body_template: r#"{"subject": {"format": "email", "email": "{{ UserEmail }}"},
                "events": {"{{ IssueType | ssf_event_type }}": {}}}"#
                .to_string(),
            retry_count: 0,
        };
        let context = match json!({"UserEmail": "jdoe@corp.test", "IssueType": "Compromised User"}) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let response = executor.execute(&integration, &action, &context).await.unwrap();
        assert_eq!(response.status_code, Some(202));
        mock.assert_async().await;
    }
}
