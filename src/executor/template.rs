//! Payload templating.
//!
//! Action path and body templates are rendered with minijinja against the
//! step context. Besides plain `{{ Key }}` substitution the environment
//! registers a few helpers used by stock action bodies:
//!
//! | helper | usage | result |
//! |---|---|---|
//! | `default` | `{{ UserEmail \| default("n/a") }}` | fallback when the value is missing or empty |
//! | `jsonescape` | `"{{ IssueMessage \| jsonescape }}"` | value escaped for a JSON string literal |
//! | `marshal` | `{{ Details \| marshal }}` | full JSON encoding of the value |
//! | `truncate` | `{{ IssueMessage \| truncate(100) }}` | at most N characters, `...` suffix when cut |
//! | `ssf_event_type` | `{{ IssueType \| ssf_event_type }}` | canonical SET event-type URI |
//!
//! Missing keys render as empty strings.

use minijinja::{Environment, Error, ErrorKind, Value};
use serde_json::{Map, Value as JsonValue};

const RISC_PREFIX: &str = "https://schemas.openid.net/secevent/risc/event-type/";
const CAEP_PREFIX: &str = "https://schemas.openid.net/secevent/caep/event-type/";

/// Issue types (lowercase) mapped to a security event type, in lookup order.
const EVENT_TYPES: &[(&str, &str, &[&str])] = &[
    (
        RISC_PREFIX,
        "account-compromised",
        &[
            "compromised user",
            "compromised password",
            "suspected ad brute-force attack",
            "suspected identity brute-force attack",
            "suspected ad golden ticket attack",
            "suspected ad pass-the-ticket attack",
            "suspected directory/idp bot attack",
        ],
    ),
    (
        RISC_PREFIX,
        "credential-change-required",
        &[
            "weak password",
            "password hash length",
            "password salt",
            "md4 related issues",
            "md5 related issues",
            "sha-1 related issues",
        ],
    ),
    (
        RISC_PREFIX,
        "account-disabled",
        &["shadow access", "shadow identity systems", "unused identities"],
    ),
    (
        CAEP_PREFIX,
        "assurance-level-change",
        &["lack of mfa", "assets with no mfa configured"],
    ),
    (
        CAEP_PREFIX,
        "device-compliance-change",
        &[
            "exposed assets",
            "shadow assets",
            "repeated ad login attempts from invalid device",
        ],
    ),
];

const DEFAULT_EVENT: &str = "session-revoked";

/// Map a free-text issue type to a Shared Signals event-type URI.
pub fn ssf_event_type(issue_type: &str) -> String {
    let needle = issue_type.trim().to_lowercase();
    EVENT_TYPES
        .iter()
        .find(|(_, _, types)| types.contains(&needle.as_str()))
        .map(|(prefix, event, _)| format!("{}{}", prefix, event))
        .unwrap_or_else(|| format!("{}{}", CAEP_PREFIX, DEFAULT_EVENT))
}

fn is_blank(value: &Value) -> bool {
    value.is_undefined() || value.is_none() || value.as_str().map_or(false, str::is_empty)
}

fn default_filter(value: Value, fallback: Value) -> Value {
    if is_blank(&value) {
        fallback
    } else {
        value
    }
}

fn text_of(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None if is_blank(value) => String::new(),
        None => value.to_string(),
    }
}

fn jsonescape_filter(value: Value) -> Result<String, Error> {
    let encoded = serde_json::to_string(&text_of(&value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(encoded[1..encoded.len() - 1].to_string())
}

fn marshal_filter(value: Value) -> Result<String, Error> {
    if value.is_undefined() {
        return Ok("null".to_string());
    }
    serde_json::to_string(&value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn truncate_filter(value: Value, length: usize) -> String {
    let text = text_of(&value);
    if text.chars().count() <= length {
        return text;
    }
    if length > 3 {
        let kept: String = text.chars().take(length - 3).collect();
        format!("{}...", kept)
    } else {
        text.chars().take(length).collect()
    }
}

fn ssf_event_type_filter(value: Value) -> String {
    ssf_event_type(&text_of(&value))
}

/// Shared minijinja environment with the helper filters installed.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_filter("default", default_filter);
        env.add_filter("jsonescape", jsonescape_filter);
        env.add_filter("marshal", marshal_filter);
        env.add_filter("truncate", truncate_filter);
        env.add_filter("ssf_event_type", ssf_event_type_filter);
        env.add_function("ssf_event_type", ssf_event_type_filter);
        Self { env }
    }

    /// Render `source` against `context`. Empty templates render to an empty string.
    pub fn render(&self, source: &str, context: &Map<String, JsonValue>) -> Result<String, Error> {
        if source.is_empty() {
            return Ok(String::new());
        }
        self.env.render_str(source, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn substitutes_context_keys() {
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render(
                r#"{"user": "{{ UserEmail }}", "issue": {{ IssueID }}}"#,
                &ctx(json!({"UserEmail": "jdoe@corp.test", "IssueID": 999})),
            )
            .unwrap();
        assert_eq!(out, r#"{"user": "jdoe@corp.test", "issue": 999}"#);
    }

    #[test]
    fn missing_keys_render_empty() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.render("/users/{{ Nope }}", &Map::new()).unwrap(), "/users/");
    }

    #[test]
    fn default_applies_to_missing_and_empty_values() {
        let renderer = TemplateRenderer::new();
        let context = ctx(json!({"Empty": "", "Set": "value"}));
        let out = renderer
            .render(
                r#"{{ Empty | default("a") }}-{{ Missing | default("b") }}-{{ Set | default("c") }}"#,
                &context,
            )
            .unwrap();
        assert_eq!(out, "a-b-value");
    }

    #[test]
    fn jsonescape_and_marshal() {
        let renderer = TemplateRenderer::new();
        let context = ctx(json!({"Msg": "say \"hi\"\nnow", "Details": {"risk": "High"}}));
        assert_eq!(
            renderer.render("{{ Msg | jsonescape }}", &context).unwrap(),
            r#"say \"hi\"\nnow"#
        );
        assert_eq!(
            renderer.render("{{ Details | marshal }}", &context).unwrap(),
            r#"{"risk":"High"}"#
        );
    }

    #[test]
    fn truncate_adds_ellipsis_only_when_room() {
        let renderer = TemplateRenderer::new();
        let context = ctx(json!({"Msg": "abcdefghij"}));
        assert_eq!(renderer.render("{{ Msg | truncate(6) }}", &context).unwrap(), "abc...");
        assert_eq!(renderer.render("{{ Msg | truncate(3) }}", &context).unwrap(), "abc");
        assert_eq!(renderer.render("{{ Msg | truncate(20) }}", &context).unwrap(), "abcdefghij");
    }

    #[test]
    fn syntax_errors_surface() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.render("{{ unclosed ", &Map::new()).is_err());
    }

    #[test]
    fn event_type_table() {
        assert_eq!(
            ssf_event_type("Compromised User"),
            "https://schemas.openid.net/secevent/risc/event-type/account-compromised"
        );
        assert_eq!(
            ssf_event_type("SHA-1 related issues"),
            "https://schemas.openid.net/secevent/risc/event-type/credential-change-required"
        );
        assert_eq!(
            ssf_event_type("unused identities"),
            "https://schemas.openid.net/secevent/risc/event-type/account-disabled"
        );
        assert_eq!(
            ssf_event_type("Lack of MFA"),
            "https://schemas.openid.net/secevent/caep/event-type/assurance-level-change"
        );
        assert_eq!(
            ssf_event_type("Repeated AD login attempts from invalid device"),
            "https://schemas.openid.net/secevent/caep/event-type/device-compliance-change"
        );
        assert_eq!(
            ssf_event_type("Something else"),
            "https://schemas.openid.net/secevent/caep/event-type/session-revoked"
        );
    }

    #[test]
    fn event_type_filter_in_templates() {
        let renderer = TemplateRenderer::new();
        let context = ctx(json!({"IssueType": "Weak Password"}));
        assert_eq!(
            renderer.render("{{ IssueType | ssf_event_type }}", &context).unwrap(),
            "https://schemas.openid.net/secevent/risc/event-type/credential-change-required"
        );
        assert_eq!(
            renderer.render("{{ ssf_event_type(IssueType) }}", &context).unwrap(),
            "https://schemas.openid.net/secevent/risc/event-type/credential-change-required"
        );
    }
}
