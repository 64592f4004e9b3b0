//! HTTP implementation of [`ProviderClient`] against the remote
//! sandbox-execution service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{CommandOutcome, CreateSandboxParams, ExecutionOutcome, ProviderClient, SandboxRef};
use crate::error::CoreError;

/// Thin `reqwest`-backed client for the provider's HTTP API.
#[derive(Clone)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProviderClient {
    /// Build a client against `base_url`, optionally authenticating with
    /// `api_key`. The underlying `reqwest::Client` is cheap to clone and
    /// pools its own connections.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> CoreResultSelf {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CoreError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.url(path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Translate a transport-level failure into the `Connection` category,
    /// marking timeouts and connect failures as retryable and treating
    /// everything else (mostly unexpected local errors) as permanent.
    fn connection_error(err: &reqwest::Error) -> CoreError {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        CoreError::Connection {
            message: err.to_string(),
            retryable,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, CoreError> {
        let response = req.send().await.map_err(|e| Self::connection_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retryable = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        let body = response.text().await.unwrap_or_default();
        Err(CoreError::Connection {
            message: format!("provider returned {status}: {body}"),
            retryable,
        })
    }
}

/// Alias to keep constructor signatures readable; `HttpProviderClient::new`
/// never fails in practice (no network I/O happens while building the
/// client) but keeps the fallible shape other constructors in this crate use.
type CoreResultSelf = Result<HttpProviderClient, CoreError>;

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    namespace: &'a str,
    name: &'a str,
    image: &'a str,
    cpus: u32,
    memory_mb: u64,
    volumes: Vec<VolumeMappingDto<'a>>,
}

#[derive(Debug, Serialize)]
struct VolumeMappingDto<'a> {
    host_path: &'a str,
    container_path: &'a str,
}

#[derive(Debug, Serialize)]
struct RunCodeRequest<'a> {
    namespace: &'a str,
    name: &'a str,
    code: &'a str,
    timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct RunCodeResponse {
    stdout: String,
    stderr: String,
    success: bool,
}

#[derive(Debug, Serialize)]
struct RunCommandRequest<'a> {
    namespace: &'a str,
    name: &'a str,
    command: &'a str,
    args: &'a [String],
    timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct RunCommandResponse {
    stdout: String,
    stderr: String,
    exit_code: i32,
    success: bool,
}

#[derive(Debug, Serialize)]
struct StopSandboxRequest<'a> {
    namespace: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListSandboxesResponse {
    sandboxes: Vec<SandboxEntry>,
}

#[derive(Debug, Deserialize)]
struct SandboxEntry {
    namespace: String,
    name: String,
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self, params), fields(namespace = params.namespace, name = params.name))]
    async fn create_sandbox(&self, params: CreateSandboxParams<'_>) -> Result<(), CoreError> {
        debug!(template = %params.template, flavor = %params.flavor, "creating sandbox");

        let body = CreateSandboxRequest {
            namespace: params.namespace,
            name: params.name,
            image: params.image,
            cpus: params.flavor.cpus(),
            memory_mb: params.flavor.memory_mb(),
            volumes: params
                .volumes
                .iter()
                .map(|v| VolumeMappingDto {
                    host_path: &v.host_path,
                    container_path: &v.container_path,
                })
                .collect(),
        };

        let req = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&body);
        self.send(req).await?;
        Ok(())
    }

    #[instrument(skip(self, code), fields(namespace, name))]
    async fn run_code(
        &self,
        namespace: &str,
        name: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, CoreError> {
        let body = RunCodeRequest {
            namespace,
            name,
            code,
            timeout_seconds: timeout.as_secs(),
        };
        let req = self
            .request(reqwest::Method::POST, "/sandboxes/run_code")
            .timeout(timeout)
            .json(&body);
        let response = self.send(req).await?;
        let parsed: RunCodeResponse = response.json().await.map_err(|e| CoreError::Connection {
            message: format!("malformed run_code response: {e}"),
            retryable: false,
        })?;
        Ok(ExecutionOutcome {
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            success: parsed.success,
        })
    }

    #[instrument(skip(self, command, args), fields(namespace, name))]
    async fn run_command(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutcome, CoreError> {
        let body = RunCommandRequest {
            namespace,
            name,
            command,
            args,
            timeout_seconds: timeout.as_secs(),
        };
        let req = self
            .request(reqwest::Method::POST, "/sandboxes/run_command")
            .timeout(timeout)
            .json(&body);
        let response = self.send(req).await?;
        let parsed: RunCommandResponse =
            response.json().await.map_err(|e| CoreError::Connection {
                message: format!("malformed run_command response: {e}"),
                retryable: false,
            })?;
        Ok(CommandOutcome {
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            exit_code: parsed.exit_code,
            success: parsed.success,
        })
    }

    #[instrument(skip(self))]
    async fn stop_sandbox(&self, namespace: &str, name: &str) -> Result<(), CoreError> {
        let body = StopSandboxRequest { namespace, name };
        let req = self
            .request(reqwest::Method::POST, "/sandboxes/stop")
            .json(&body);
        self.send(req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_sandboxes(&self) -> Result<Vec<SandboxRef>, CoreError> {
        let req = self.request(reqwest::Method::GET, "/sandboxes");
        let response = self.send(req).await?;
        let parsed: ListSandboxesResponse =
            response.json().await.map_err(|e| CoreError::Connection {
                message: format!("malformed list_sandboxes response: {e}"),
                retryable: false,
            })?;
        Ok(parsed
            .sandboxes
            .into_iter()
            .map(|entry| SandboxRef {
                namespace: entry.namespace,
                name: entry.name,
            })
            .collect())
    }
}
