//! MCP server implementation using `rmcp`.
//!
//! Exposes the session/resource coordinator's facade as five MCP tools:
//! `execute_code`, `execute_command`, `get_sessions`, `stop_session`, and
//! `get_volume_path`. This module is the thin transport adapter spec §1
//! calls out as a collaborator, not the core itself — every tool handler
//! below does argument validation and JSON-RPC error-category mapping, then
//! delegates straight to [`Facade`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, Flavor, Template};
use crate::error::CoreError;
use crate::facade::Facade;
use crate::provider::{CommandOutcome, ExecutionOutcome};
use crate::session::SessionSummary;

/// MCP server fronting the session/resource coordinator.
#[derive(Clone)]
pub struct SandboxSessionServer {
    facade: Arc<Facade>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    /// The code to execute.
    #[schemars(description = "The code to execute")]
    pub code: String,
    /// Sandbox template; defaults to the server's configured default.
    #[schemars(description = "Sandbox template: 'python' or 'node'")]
    pub template: Option<String>,
    /// Reuse an existing session by id, or create a new one if omitted or
    /// unknown.
    #[schemars(description = "Existing session id to reuse, or omit to create one")]
    pub session_id: Option<String>,
    /// Resource flavor for a newly created session; ignored when reusing an
    /// existing session.
    #[schemars(description = "Resource flavor for a new session: 'small', 'medium', or 'large'")]
    pub flavor: Option<String>,
    /// Per-call execution timeout in seconds; defaults to the server's
    /// configured default.
    #[schemars(description = "Execution timeout in seconds")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    /// The shell command to execute.
    #[schemars(description = "The command to execute")]
    pub command: String,
    /// Arguments to the command.
    #[schemars(description = "Arguments to the command")]
    pub args: Option<Vec<String>>,
    #[schemars(description = "Sandbox template: 'python' or 'node'")]
    pub template: Option<String>,
    #[schemars(description = "Existing session id to reuse, or omit to create one")]
    pub session_id: Option<String>,
    #[schemars(description = "Resource flavor for a new session: 'small', 'medium', or 'large'")]
    pub flavor: Option<String>,
    #[schemars(description = "Execution timeout in seconds")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSessionsParams {
    /// Restrict the listing to a single session id.
    #[schemars(description = "Session id to filter to, or omit to list all sessions")]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopSessionParams {
    /// The session to stop.
    #[schemars(description = "Session id to stop")]
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetVolumePathParams {}

#[derive(Debug, Serialize)]
struct ExecuteCodeResult {
    session_id: String,
    stdout: String,
    stderr: String,
    success: bool,
    execution_time_ms: u128,
    session_created: bool,
    template: &'static str,
}

#[derive(Debug, Serialize)]
struct ExecuteCommandResult {
    session_id: String,
    stdout: String,
    stderr: String,
    exit_code: i32,
    success: bool,
    execution_time_ms: u128,
    session_created: bool,
    command: String,
    args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SessionSummaryDto {
    session_id: String,
    template: &'static str,
    flavor: &'static str,
    namespace: String,
    state: &'static str,
    created_at_secs_ago: u64,
    last_accessed_secs_ago: u64,
}

impl From<SessionSummary> for SessionSummaryDto {
    fn from(summary: SessionSummary) -> Self {
        Self {
            session_id: summary.id,
            template: summary.template.as_str(),
            flavor: summary.flavor.as_str(),
            namespace: summary.namespace,
            state: summary.state.as_str(),
            created_at_secs_ago: summary.created_at_secs_ago,
            last_accessed_secs_ago: summary.last_accessed_secs_ago,
        }
    }
}

/// Map the core error taxonomy (spec §7) to MCP/JSON-RPC error categories,
/// per the "User-visible failure behaviour" table: `ResourceLimitError` maps
/// to an invalid-request category; configuration, connection, sandbox
/// creation and infrastructure-kind execution failures map to internal
/// error; everything else carries through as an internal error with its
/// message and recovery suggestion preserved.
fn map_core_error(err: CoreError) -> McpError {
    let suggestion = err.recovery_suggestion();
    let message = match &suggestion {
        Some(hint) => format!("{err} (suggestion: {hint})"),
        None => err.to_string(),
    };
    match err {
        CoreError::ResourceLimit { .. } => McpError::invalid_request(message, None),
        CoreError::SessionNotFound { .. } | CoreError::InvalidSessionState { .. } => {
            McpError::invalid_params(message, None)
        }
        CoreError::Configuration { .. }
        | CoreError::Connection { .. }
        | CoreError::SandboxCreation { .. }
        | CoreError::CodeExecution { .. }
        | CoreError::CommandExecution { .. } => McpError::internal_error(message, None),
    }
}

fn parse_template(raw: Option<&str>) -> Result<Option<Template>, McpError> {
    raw.map(Template::parse)
        .transpose()
        .map_err(|e| McpError::invalid_params(e.to_string(), None))
}

fn parse_flavor(raw: Option<&str>) -> Result<Option<Flavor>, McpError> {
    raw.map(Flavor::parse)
        .transpose()
        .map_err(|e| McpError::invalid_params(e.to_string(), None))
}

fn json_result(value: &impl Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        McpError::internal_error(format!("failed to serialize tool result: {e}"), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[tool_router]
impl SandboxSessionServer {
    #[must_use]
    pub fn new(facade: Arc<Facade>) -> Self {
        Self {
            facade,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code in a sandbox session, creating the session first if
    /// `session_id` is omitted or unknown.
    #[tool(description = "Execute code in a sandboxed session, auto-creating the session if needed")]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.code.trim().is_empty() {
            return Err(McpError::invalid_params("code must not be empty", None));
        }
        let template = parse_template(params.template.as_deref())?.unwrap_or(Template::Python);
        let flavor = parse_flavor(params.flavor.as_deref())?;
        let timeout = params.timeout.map(Duration::from_secs);

        let started = Instant::now();
        let (session_id, session_created, outcome): (String, bool, ExecutionOutcome) = self
            .facade
            .execute_code(&params.code, template, params.session_id, flavor, timeout)
            .await
            .map_err(map_core_error)?;
        let elapsed = started.elapsed();

        json_result(&ExecuteCodeResult {
            session_id,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            success: outcome.success,
            execution_time_ms: elapsed.as_millis(),
            session_created,
            template: template.as_str(),
        })
    }

    /// Execute a shell command in a sandbox session, creating the session
    /// first if `session_id` is omitted or unknown.
    #[tool(description = "Execute a shell command in a sandboxed session, auto-creating the session if needed")]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.command.trim().is_empty() {
            return Err(McpError::invalid_params("command must not be empty", None));
        }
        let template = parse_template(params.template.as_deref())?.unwrap_or(Template::Python);
        let flavor = parse_flavor(params.flavor.as_deref())?;
        let timeout = params.timeout.map(Duration::from_secs);
        let args = params.args.clone().unwrap_or_default();

        let started = Instant::now();
        let (session_id, session_created, outcome): (String, bool, CommandOutcome) = self
            .facade
            .execute_command(
                &params.command,
                &args,
                template,
                params.session_id,
                flavor,
                timeout,
            )
            .await
            .map_err(map_core_error)?;
        let elapsed = started.elapsed();

        json_result(&ExecuteCommandResult {
            session_id,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            success: outcome.success,
            execution_time_ms: elapsed.as_millis(),
            session_created,
            command: params.command,
            args,
        })
    }

    /// List active sessions, optionally filtered to a single id.
    #[tool(description = "List active sandbox sessions, optionally filtered to one session id")]
    async fn get_sessions(
        &self,
        Parameters(params): Parameters<GetSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let summaries = self
            .facade
            .get_sessions(params.session_id.as_deref())
            .await
            .into_iter()
            .map(SessionSummaryDto::from)
            .collect::<Vec<_>>();
        json_result(&summaries)
    }

    /// Stop an active session by id.
    #[tool(description = "Stop a sandbox session by id")]
    async fn stop_session(
        &self,
        Parameters(params): Parameters<StopSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.facade
            .stop_session(&params.session_id)
            .await
            .map_err(map_core_error)?;
        json_result(&serde_json::json!({ "session_id": params.session_id, "stopped": true }))
    }

    /// Return the configured shared host/container volume mappings.
    #[tool(description = "List the configured shared host/container volume mappings")]
    async fn get_volume_path(
        &self,
        Parameters(_params): Parameters<GetVolumePathParams>,
    ) -> Result<CallToolResult, McpError> {
        json_result(&self.facade.get_volume_mappings())
    }
}

#[tool_handler]
impl ServerHandler for SandboxSessionServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-session-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Run code or shell commands in managed sandbox sessions.\n\
                 Tools: execute_code, execute_command, get_sessions, stop_session, get_volume_path.\n\
                 Omit session_id to create a new session; pass one back to reuse it."
                    .to_string(),
            ),
        }
    }
}

/// Serve the sandbox session server over stdio until the client
/// disconnects, then stop the facade's background loops and active
/// sessions before returning.
pub async fn serve_stdio(config: Config, facade: Arc<Facade>) -> anyhow::Result<()> {
    let _ = &config; // retained for future transport-level use (e.g. banner info)
    facade.start();
    let server = SandboxSessionServer::new(Arc::clone(&facade));

    info!("starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("failed to start MCP server: {e}"))?;

    let result = service.waiting().await;
    facade.stop().await;

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "MCP server exited with an error");
            Err(anyhow::anyhow!("MCP server error: {e}"))
        }
    }
}
