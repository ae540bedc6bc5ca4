//! PowerShell over WinRM.
//!
//! Speaks just enough WS-Management to run one script: create a shell, send
//! the command, receive output until the command reports `Done`, then signal
//! and delete the shell. The action body is the script; it is sent as an
//! `-EncodedCommand` so no quoting survives into the SOAP envelope.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{ActionError, ActionResponse, HttpActionExecutor};
use crate::models::{ActionDefinition, Integration};

const DEFAULT_HTTP_PORT: u16 = 5985;
const DEFAULT_HTTPS_PORT: u16 = 5986;
const MAX_RECEIVES: usize = 120;

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

lazy_static! {
    static ref SHELL_ID: Regex = Regex::new(r#"(?:<(?:\w+:)?ShellId>|Name="ShellId">)([^<]+)<"#).unwrap();
    static ref COMMAND_ID: Regex = Regex::new(r"<(?:\w+:)?CommandId>([^<]+)<").unwrap();
    static ref STREAM: Regex =
        Regex::new(r#"<(?:\w+:)?Stream[^>]*?Name="(stdout|stderr)"[^>]*>([^<]*)</(?:\w+:)?Stream>"#).unwrap();
    static ref DONE: Regex = Regex::new(r#"CommandState[^>]*State="[^"]*/Done""#).unwrap();
    static ref EXIT_CODE: Regex = Regex::new(r"<(?:\w+:)?ExitCode>(-?\d+)<").unwrap();
}

/// Resolve the `/wsman` endpoint from a bare `host[:port]` or a full URL.
pub fn wsman_endpoint(base_url: &str) -> Result<String, ActionError> {
    let raw = base_url.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| ActionError::Configuration(format!("invalid WinRM host '{}': {}", base_url, e)))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ActionError::Configuration(format!("WinRM host missing in '{}'", base_url)))?;

    let scheme = url.scheme();
    let default_port = if scheme == "https" { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT };
    let port = url.port().unwrap_or(default_port);
    Ok(format!("{}://{}:{}/wsman", scheme, host, port))
}

/// PowerShell `-EncodedCommand` argument: base64 of the UTF-16LE script.
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

fn envelope(endpoint: &str, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
    let selector = shell_id
        .map(|id| format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#, id))
        .unwrap_or_default();
    format!(
        concat!(
            r#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
            r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
            r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
            "<env:Header>",
            "<a:To>{to}</a:To>",
            r#"<a:ReplyTo><a:Address env:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>"#,
            r#"<w:MaxEnvelopeSize env:mustUnderstand="true">153600</w:MaxEnvelopeSize>"#,
            "<a:MessageID>uuid:{message_id}</a:MessageID>",
            r#"<w:Locale xml:lang="en-US" env:mustUnderstand="false"/>"#,
            "<w:OperationTimeout>PT10S</w:OperationTimeout>",
            r#"<w:ResourceURI env:mustUnderstand="true">{resource}</w:ResourceURI>"#,
            r#"<a:Action env:mustUnderstand="true">{action}</a:Action>"#,
            "{selector}{options}",
            "</env:Header>",
            "<env:Body>{body}</env:Body>",
            "</env:Envelope>"
        ),
        to = endpoint,
        message_id = Uuid::new_v4().to_string().to_uppercase(),
        resource = RESOURCE_CMD,
        action = action,
        selector = selector,
        options = options,
        body = body,
    )
}

#[derive(Debug, Default, PartialEq)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    done: bool,
}

impl CommandOutput {
    fn absorb(&mut self, response: &str) -> Result<(), ActionError> {
        for caps in STREAM.captures_iter(response) {
            let chunk = caps[2].trim();
            if chunk.is_empty() {
                continue;
            }
            let decoded = STANDARD
                .decode(chunk)
                .map_err(|e| ActionError::Remote(format!("undecodable output stream: {}", e)))?;
            let text = String::from_utf8_lossy(&decoded);
            match &caps[1] {
                "stdout" => self.stdout.push_str(&text),
                _ => self.stderr.push_str(&text),
            }
        }
        if let Some(caps) = EXIT_CODE.captures(response) {
            self.exit_code = caps[1].parse().ok();
        }
        if DONE.is_match(response) {
            self.done = true;
        }
        Ok(())
    }
}

fn capture(pattern: &Regex, response: &str, what: &str) -> Result<String, ActionError> {
    pattern
        .captures(response)
        .map(|caps| caps[1].trim().to_string())
        .ok_or_else(|| ActionError::Remote(format!("WinRM response did not contain a {}", what)))
}

/// One authenticated conversation with a WinRM endpoint.
struct WsManSession<'a> {
    client: &'a Client,
    endpoint: String,
    username: &'a str,
    password: &'a str,
}

impl WsManSession<'_> {
    async fn post(&self, envelope: String) -> Result<String, ActionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(self.username, Some(self.password))
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(envelope)
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
        Ok(body)
    }

    async fn create_shell(&self) -> Result<String, ActionError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let response = self.post(envelope(&self.endpoint, ACTION_CREATE, None, options, body)).await?;
        capture(&SHELL_ID, &response, "ShellId")
    }

    async fn run_script(&self, shell_id: &str, script: &str) -> Result<CommandOutput, ActionError> {
        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command><rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {}</rsp:Arguments></rsp:CommandLine>",
            encode_powershell(script)
        );
        let response = self
            .post(envelope(&self.endpoint, ACTION_COMMAND, Some(shell_id), options, &body))
            .await?;
        let command_id = capture(&COMMAND_ID, &response, "CommandId")?;

        let result = self.receive(shell_id, &command_id).await;

        let signal = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            command_id, SIGNAL_TERMINATE
        );
        if let Err(e) = self
            .post(envelope(&self.endpoint, ACTION_SIGNAL, Some(shell_id), "", &signal))
            .await
        {
            debug!("WinRM signal for command {} failed: {}", command_id, e);
        }

        result
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<CommandOutput, ActionError> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            command_id
        );
        let mut output = CommandOutput::default();

        for _ in 0..MAX_RECEIVES {
            match self
                .post(envelope(&self.endpoint, ACTION_RECEIVE, Some(shell_id), "", &body))
                .await
            {
                Ok(response) => output.absorb(&response)?,
                // Operation timeout while the command is still running
                Err(ActionError::Http { status: 500, body }) if body.contains("TimedOut") => continue,
                Err(e) => return Err(e),
            }
            if output.done {
                return Ok(output);
            }
        }

        Err(ActionError::Remote(format!(
            "command {} did not finish after {} receive calls",
            command_id, MAX_RECEIVES
        )))
    }

    async fn delete_shell(&self, shell_id: &str) {
        if let Err(e) = self
            .post(envelope(&self.endpoint, ACTION_DELETE, Some(shell_id), "", ""))
            .await
        {
            warn!("Failed to delete WinRM shell {} on {}: {}", shell_id, self.endpoint, e);
        }
    }
}

impl HttpActionExecutor {
    pub(super) async fn execute_winrm(
        &self,
        integration: &Integration,
        action: &ActionDefinition,
        context: &Map<String, Value>,
    ) -> Result<ActionResponse, ActionError> {
        let script = self.render(&action.body_template, context)?;
        let creds = &integration.credentials;
        let session = WsManSession {
            client: &self.client,
            endpoint: wsman_endpoint(&integration.base_url)?,
            username: creds.require("winrm", "username")?,
            password: creds.require("winrm", "password")?,
        };

        debug!(integration = %integration.name, "Running PowerShell action '{}' via {}", action.name, session.endpoint);

        let shell_id = session.create_shell().await?;
        let result = session.run_script(&shell_id, &script).await;
        session.delete_shell(&shell_id).await;
        let output = result?;

        match output.exit_code {
            Some(code) if code != 0 => Err(ActionError::Remote(format!(
                "script exited with code {}: {}",
                code,
                output.stderr.trim()
            ))),
            _ => Ok(ActionResponse {
                status_code: None,
                body: output.stdout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::{Matcher, Server, ServerGuard};

    use super::*;
    use crate::config::ExecutorConfig;
    use crate::engine::storage::{InMemoryStore, RemediationStore};
    use crate::executor::ActionExecutor;
    use crate::models::{Credentials, ProtocolKind};

    #[test]
    fn endpoint_defaults_port() {
        assert_eq!(wsman_endpoint("dc01.corp.test").unwrap(), "http://dc01.corp.test:5985/wsman");
        assert_eq!(wsman_endpoint("dc01.corp.test:5999").unwrap(), "http://dc01.corp.test:5999/wsman");
        assert_eq!(
            wsman_endpoint("https://dc01.corp.test").unwrap(),
            "https://dc01.corp.test:5986/wsman"
        );
        assert!(wsman_endpoint("").is_err());
    }

    #[test]
    fn powershell_is_utf16le_base64() {
        // "hi" => 68 00 69 00
        assert_eq!(encode_powershell("hi"), "aABpAA==");
    }

    #[test]
    fn receive_output_is_decoded() {
        let response = format!(
            concat!(
                r#"<rsp:ReceiveResponse>"#,
                r#"<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stderr" CommandId="C1">{}</rsp:Stream>"#,
                r#"<rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
                r#"<rsp:ExitCode>2</rsp:ExitCode></rsp:CommandState>"#,
                r#"</rsp:ReceiveResponse>"#
            ),
            STANDARD.encode("disabled\r\n"),
            STANDARD.encode("warning")
        );
        let mut output = CommandOutput::default();
        output.absorb(&response).unwrap();
        assert_eq!(output.stdout, "disabled\r\n");
        assert_eq!(output.stderr, "warning");
        assert_eq!(output.exit_code, Some(2));
        assert!(output.done);
    }

    async fn mock_shell(server: &mut ServerGuard, exit_code: i32) -> Vec<mockito::Mock> {
        let receive = format!(
            concat!(
                r#"<s:Envelope><s:Body><rsp:ReceiveResponse>"#,
                r#"<rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream>"#,
                r#"<rsp:Stream Name="stdout" CommandId="CMD-1" End="true"></rsp:Stream>"#,
                r#"<rsp:CommandState CommandId="CMD-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
                r#"<rsp:ExitCode>{}</rsp:ExitCode></rsp:CommandState>"#,
                r#"</rsp:ReceiveResponse></s:Body></s:Envelope>"#
            ),
            STANDARD.encode("user disabled"),
            exit_code
        );

        let mut mocks = Vec::new();
        for (action, body) in [
            (ACTION_CREATE, r#"<s:Envelope><s:Body><rsp:Shell><rsp:ShellId>SHELL-1</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>"#.to_string()),
            (ACTION_COMMAND, r#"<s:Envelope><s:Body><rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse></s:Body></s:Envelope>"#.to_string()),
            (ACTION_RECEIVE, receive),
            (ACTION_SIGNAL, "<s:Envelope/>".to_string()),
            (ACTION_DELETE, "<s:Envelope/>".to_string()),
        ] {
            mocks.push(
                server
                    .mock("POST", "/wsman")
                    .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
                    .match_body(Matcher::Regex(regex::escape(action)))
                    .with_status(200)
                    .with_body(body)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        mocks
    }

    async fn winrm_setup(server: &ServerGuard) -> (Integration, HttpActionExecutor, ActionDefinition) {
        let store = Arc::new(InMemoryStore::new());
        let mut integration = Integration::new(0, 1, "Domain Controller", ProtocolKind::WinRm, server.host_with_port());
        integration.credentials = Credentials::new().with("username", "svc").with("password", "pw");
        let integration = store.upsert_integration(integration).await.unwrap();
        let executor = HttpActionExecutor::new(store.clone(), ExecutorConfig::default()).unwrap();
        let action = ActionDefinition {
            id: 1,
            tenant_id: 1,
            integration_id: integration.id,
            name: "Disable AD account".to_string(),
            method: String::new(),
            path_template: String::new(),
            body_template: "Disable-ADAccount -Identity '{{ UserEmail }}'".to_string(),
            retry_count: 1,
        };
        (integration, executor, action)
    }

    fn context() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("UserEmail".to_string(), Value::String("jdoe".to_string()));
        map
    }

    #[tokio::test]
    async fn script_runs_through_full_shell_lifecycle() {
        let mut server = Server::new_async().await;
        let mocks = mock_shell(&mut server, 0).await;
        let (integration, executor, action) = winrm_setup(&server).await;

        let response = executor.execute(&integration, &action, &context()).await.unwrap();
        assert_eq!(response.status_code, None);
        assert_eq!(response.body, "user disabled");
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn non_zero_exit_code_is_a_failure() {
        let mut server = Server::new_async().await;
        // Two attempts, each a full shell lifecycle
        let mut mocks = Vec::new();
        for action in [ACTION_CREATE, ACTION_COMMAND, ACTION_RECEIVE, ACTION_SIGNAL, ACTION_DELETE] {
            let body = match action {
                ACTION_CREATE => "<rsp:ShellId>SHELL-1</rsp:ShellId>".to_string(),
                ACTION_COMMAND => "<rsp:CommandId>CMD-1</rsp:CommandId>".to_string(),
                ACTION_RECEIVE => concat!(
                    r#"<rsp:CommandState CommandId="CMD-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">"#,
                    "<rsp:ExitCode>1</rsp:ExitCode></rsp:CommandState>"
                )
                .to_string(),
                _ => String::new(),
            };
            mocks.push(
                server
                    .mock("POST", "/wsman")
                    .match_body(Matcher::Regex(regex::escape(action)))
                    .with_status(200)
                    .with_body(body)
                    .expect(2)
                    .create_async()
                    .await,
            );
        }
        let (integration, executor, action) = winrm_setup(&server).await;

        let err = executor.execute(&integration, &action, &context()).await.unwrap_err();
        match err {
            ActionError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ActionError::Remote(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        for mock in mocks {
            mock.assert_async().await;
        }
    }
}
