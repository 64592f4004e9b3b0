//! Sandbox provider client: a thin capability layer over the remote
//! sandbox-execution HTTP service.
//!
//! The provider is an external service that actually creates, runs code or
//! commands in, and stops micro-VM sandboxes. This module only describes the
//! capability surface; [`http::HttpProviderClient`] is the one real
//! implementation, and tests substitute an in-memory fake behind the same
//! trait.

pub mod http;

use async_trait::async_trait;

use crate::config::{Flavor, Template, VolumeMapping};
use crate::error::CoreResult;

/// Where a sandbox lives at the provider: a logical namespace plus a name
/// unique within that namespace. This is the identity orphan-detection (I5)
/// reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxRef {
    pub namespace: String,
    pub name: String,
}

/// Parameters for creating and starting a sandbox at the provider.
#[derive(Debug, Clone)]
pub struct CreateSandboxParams<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub template: Template,
    pub image: &'static str,
    pub flavor: Flavor,
    pub volumes: &'a [VolumeMapping],
}

/// Result of running code in a sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Whether the call reached completion at the provider (infrastructure
    /// success). A non-zero exit / traceback inside `stderr` does not make
    /// this `false` — see spec §4.1 point 5.
    pub success: bool,
}

/// Result of running a shell command in a sandbox.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

/// Capability surface exposed by the remote sandbox provider.
///
/// Every method may suspend (network I/O) and must translate transport-level
/// failures into [`crate::error::CoreError::Connection`], distinguishing
/// retryable categories (timeouts, 5xx, connection resets) from permanent
/// ones (4xx) where the provider's response makes that possible.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Create and start a sandbox at `(namespace, name)` with the given
    /// resource and volume parameters.
    async fn create_sandbox(&self, params: CreateSandboxParams<'_>) -> CoreResult<()>;

    /// Run code inside an already-started sandbox.
    async fn run_code(
        &self,
        namespace: &str,
        name: &str,
        code: &str,
        timeout: std::time::Duration,
    ) -> CoreResult<ExecutionOutcome>;

    /// Run a shell command inside an already-started sandbox.
    async fn run_command(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        args: &[String],
        timeout: std::time::Duration,
    ) -> CoreResult<CommandOutcome>;

    /// Stop the sandbox at `(namespace, name)`. Idempotent from the caller's
    /// point of view: stopping an already-stopped or unknown sandbox is not
    /// an error at this layer.
    async fn stop_sandbox(&self, namespace: &str, name: &str) -> CoreResult<()>;

    /// Enumerate sandboxes the provider currently reports as running.
    async fn list_sandboxes(&self) -> CoreResult<Vec<SandboxRef>>;
}
