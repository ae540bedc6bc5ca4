//! Plain HTTP/JSON actions.

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::{Map, Value};

use super::{ActionError, ActionResponse, HttpActionExecutor};
use crate::models::{ActionDefinition, Integration};

/// Append a rendered path to a base URL without doubling the slash.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if path.is_empty() {
        return base_url.to_string();
    }
    match (base_url.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base_url, &path[1..]),
        (false, false) if !path.starts_with('?') => format!("{}/{}", base_url, path),
        _ => format!("{}{}", base_url, path),
    }
}

pub(crate) fn parse_method(method: &str) -> Result<Method, ActionError> {
    let method = if method.trim().is_empty() { "POST" } else { method.trim() };
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ActionError::Configuration(format!("invalid HTTP method '{}'", method)))
}

impl HttpActionExecutor {
    pub(super) async fn execute_rest(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError> {
        let path = self.render(&action.path_template, context)?;
        let body = self.render(&action.body_template, context)?;
        let url = join_url(&integration.base_url, &path);
        let method = parse_method(&action.method)?;

        self.log_payload(integration, &url, &body);

        let mut request = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json");
        if !body.is_empty() {
            request = request.body(body);
        }
        let request = self.auth.apply(request, integration).await?;

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Transport(e.to_string()))?;

        if status >= 400 {
            return Err(ActionError::Http { status, body: text });
        }

        Ok(ActionResponse {
            status_code: Some(status),
            body: text,
        })
    }
}
