//! The single entry point the MCP layer talks to. Owns the Session Manager
//! and Resource Manager and their background loops, and wires every public
//! operation through the admission → acquire/create → execute path spec §4
//! describes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, Flavor, Template, VolumeMapping};
use crate::error::{CoreError, CoreResult};
use crate::provider::{CommandOutcome, ExecutionOutcome, ProviderClient};
use crate::resource::{ResourceManager, ResourceSnapshot};
use crate::session::{SessionManager, SessionSummary};

/// Facade over session and resource management. Constructed once at
/// startup and shared (behind an `Arc`) with the MCP tool handlers.
pub struct Facade {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    resources: Arc<ResourceManager>,
    provider: Arc<dyn ProviderClient>,
    shutdown: CancellationToken,
}

impl Facade {
    #[must_use]
    pub fn new(config: Config, provider: Arc<dyn ProviderClient>) -> Self {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(Arc::clone(&config), Arc::clone(&provider)));
        let resources = Arc::new(ResourceManager::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            Arc::clone(&provider),
        ));
        Self {
            config,
            sessions,
            resources,
            provider,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the idle-expiry and orphan-cleanup background loops. Must be
    /// called once before serving tool calls.
    pub fn start(&self) {
        self.sessions.start_expiry_loop(self.shutdown.clone());
        self.resources.start_orphan_loop(self.shutdown.clone());
        info!("session and resource coordinator started");
    }

    /// Cancel background loops and stop every active session, best-effort.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sessions.stop_all().await;
        info!("session and resource coordinator stopped");
    }

    /// Run code in a session, creating it first if `session_id` is omitted
    /// or unknown.
    ///
    /// `execute_code`/`execute_command`'s `success` field always reflects
    /// whether the call reached completion at the provider — a non-zero
    /// exit code or a Python traceback is a *successful* execution whose
    /// output happens to carry an error. This distinction is invariant and
    /// must not regress (spec §4.1 point 5).
    pub async fn execute_code(
        &self,
        code: &str,
        template: Template,
        session_id: Option<String>,
        flavor: Option<Flavor>,
        timeout: Option<Duration>,
    ) -> CoreResult<(String, bool, ExecutionOutcome)> {
        let flavor = flavor.unwrap_or(self.config.default_flavor);
        let timeout = timeout.unwrap_or(self.config.default_execution_timeout);

        let (session, created) = self
            .sessions
            .get_or_create(session_id, template, flavor)
            .await?;
        let outcome = session
            .execute_code(self.provider(), &self.config, code, timeout)
            .await?;
        Ok((session.id.clone(), created, outcome))
    }

    /// Run a shell command in a session, creating it first if `session_id`
    /// is omitted or unknown.
    pub async fn execute_command(
        &self,
        command: &str,
        args: &[String],
        template: Template,
        session_id: Option<String>,
        flavor: Option<Flavor>,
        timeout: Option<Duration>,
    ) -> CoreResult<(String, bool, CommandOutcome)> {
        let flavor = flavor.unwrap_or(self.config.default_flavor);
        let timeout = timeout.unwrap_or(self.config.default_execution_timeout);

        let (session, created) = self
            .sessions
            .get_or_create(session_id, template, flavor)
            .await?;
        let outcome = session
            .execute_command(self.provider(), &self.config, command, args, timeout)
            .await?;
        Ok((session.id.clone(), created, outcome))
    }

    /// List sessions, optionally filtered to a single id.
    pub async fn get_sessions(&self, session_id: Option<&str>) -> Vec<SessionSummary> {
        self.sessions.get_sessions(session_id).await
    }

    /// Stop a session by id. Returns an error if the id is unknown, since
    /// (unlike `execute_*`) this is an explicit lookup, not an
    /// auto-creating one (spec §4.1).
    pub async fn stop_session(&self, session_id: &str) -> CoreResult<()> {
        if self.sessions.stop_session(session_id).await {
            Ok(())
        } else {
            Err(CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
        }
    }

    /// Configured shared host/container volume mappings.
    #[must_use]
    pub fn get_volume_mappings(&self) -> &[VolumeMapping] {
        &self.config.shared_volumes
    }

    /// Current resource snapshot (active sessions, flavor breakdown,
    /// aggregate usage, configured ceilings, uptime).
    pub async fn get_resource_stats(&self) -> ResourceSnapshot {
        self.resources.get_resource_stats().await
    }

    /// Force an orphan-reclamation sweep outside its normal schedule.
    /// Exposed for operational tooling and tests; the background loop
    /// already runs this on `orphan_cleanup_interval`.
    pub async fn cleanup_orphan_sandboxes(&self) -> usize {
        self.resources.cleanup_orphan_sandboxes().await
    }

    fn provider(&self) -> &dyn ProviderClient {
        self.provider.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CreateSandboxParams, SandboxRef};
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeProvider;

    #[async_trait]
    impl ProviderClient for FakeProvider {
        async fn create_sandbox(&self, _params: CreateSandboxParams<'_>) -> CoreResult<()> {
            Ok(())
        }

        async fn run_code(
            &self,
            _namespace: &str,
            _name: &str,
            code: &str,
            _timeout: Duration,
        ) -> CoreResult<ExecutionOutcome> {
            Ok(ExecutionOutcome {
                stdout: format!("ran: {code}"),
                stderr: String::new(),
                success: true,
            })
        }

        async fn run_command(
            &self,
            _namespace: &str,
            _name: &str,
            _command: &str,
            _args: &[String],
            _timeout: Duration,
        ) -> CoreResult<CommandOutcome> {
            Ok(CommandOutcome {
                stdout: String::new(),
                stderr: "boom".to_string(),
                exit_code: 1,
                success: true,
            })
        }

        async fn stop_sandbox(&self, _namespace: &str, _name: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn list_sandboxes(&self) -> CoreResult<Vec<SandboxRef>> {
            Ok(Vec::new())
        }
    }

    fn facade() -> Facade {
        Facade::new(Config::default(), Arc::new(FakeProvider))
    }

    #[tokio::test]
    async fn execute_code_autocreates_session() {
        let facade = facade();
        let (session_id, created, outcome) = facade
            .execute_code("print(1)", Template::Python, None, None, None)
            .await
            .unwrap();
        assert!(!session_id.is_empty());
        assert!(created);
        assert!(outcome.success);
        assert_eq!(facade.get_sessions(None).await.len(), 1);
    }

    #[tokio::test]
    async fn reusing_a_session_id_reports_not_created() {
        let facade = facade();
        let (session_id, created, _) = facade
            .execute_code("1", Template::Python, Some("s1".to_string()), None, None)
            .await
            .unwrap();
        assert!(created);
        let (_, created_again, _) = facade
            .execute_code("2", Template::Python, Some(session_id), None, None)
            .await
            .unwrap();
        assert!(!created_again);
    }

    #[tokio::test]
    async fn nonzero_exit_is_still_an_infrastructure_success() {
        let facade = facade();
        let (_id, _created, outcome) = facade
            .execute_command("false", &[], Template::Python, None, None, None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_an_error() {
        let facade = facade();
        let err = facade.stop_session("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn stop_known_session_removes_it() {
        let facade = facade();
        let (session_id, _created, _) = facade
            .execute_code("1", Template::Python, None, None, None)
            .await
            .unwrap();
        facade.stop_session(&session_id).await.unwrap();
        assert!(facade.get_sessions(None).await.is_empty());
    }

    #[tokio::test]
    async fn resource_stats_reflect_active_sessions() {
        let facade = facade();
        facade
            .execute_code("1", Template::Python, None, Some(Flavor::Medium), None)
            .await
            .unwrap();
        let stats = facade.get_resource_stats().await;
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_memory_mb, 2048);
    }
}
