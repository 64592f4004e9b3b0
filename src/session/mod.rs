//! A managed session: the handle pairing a stable session id with one
//! underlying sandbox instance.

pub mod manager;

pub use manager::SessionManager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::config::{Config, Flavor, Template};
use crate::error::{CoreError, CoreResult, ExecutionErrorKind};
use crate::provider::{CommandOutcome, CreateSandboxParams, ExecutionOutcome, ProviderClient};

/// Lifecycle state of a managed session (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Ready,
    Running,
    Error,
    Stopped,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time view of a managed session, for `get_sessions`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub template: Template,
    pub flavor: Flavor,
    pub namespace: String,
    pub state: SessionState,
    pub created_at_secs_ago: u64,
    pub last_accessed_secs_ago: u64,
}

/// A handle pairing a session id with one underlying sandbox.
///
/// All operations against the sandbox are serialized through `op_guard`
/// (I3). `state` and `last_accessed` are kept in their own locks so the
/// expiry loop can inspect them without waiting behind an in-flight
/// operation — it uses `try_lock` on `op_guard` instead (§5: the sweep
/// never blocks an incoming tool call, and never blocks itself on one).
pub struct ManagedSession {
    pub id: String,
    pub template: Template,
    pub flavor: Flavor,
    pub namespace: String,
    pub sandbox_name: String,
    pub created_at: Instant,
    last_accessed: Mutex<Instant>,
    state: RwLock<SessionState>,
    /// Whether `create_sandbox` has ever succeeded for this session. Kept
    /// separate from `state`: an infrastructure failure or timeout during
    /// `execute_code`/`execute_command` moves `state` to `Error`, but the
    /// sandbox itself is still alive at the provider — recovery must retry
    /// the run, not call `create_sandbox` again (spec: "a subsequent
    /// successful execution restores `ready`"). Only read/written while
    /// `op_guard` is held, so plain atomic ordering is enough.
    started: AtomicBool,
    op_guard: Mutex<()>,
}

impl ManagedSession {
    pub(crate) fn new(id: String, template: Template, flavor: Flavor, namespace: String) -> Self {
        let now = Instant::now();
        let sandbox_name = format!("session-{id}");
        Self {
            id,
            template,
            flavor,
            namespace,
            sandbox_name,
            created_at: now,
            last_accessed: Mutex::new(now),
            state: RwLock::new(SessionState::Creating),
            started: AtomicBool::new(false),
            op_guard: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub(crate) async fn touch(&self) {
        *self.last_accessed.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_accessed.lock().await.elapsed()
    }

    pub async fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            template: self.template,
            flavor: self.flavor,
            namespace: self.namespace.clone(),
            state: self.state().await,
            created_at_secs_ago: self.created_at.elapsed().as_secs(),
            last_accessed_secs_ago: self.idle_for().await.as_secs(),
        }
    }

    /// Ensure the underlying sandbox has been created and started. Caller
    /// must already hold `op_guard`.
    ///
    /// Creation happens at most once per session: once `create_sandbox` has
    /// succeeded, this is a no-op even if a later execution left `state` at
    /// `Error` — that error means the *run* failed, not that the sandbox is
    /// gone, and `create_sandbox` has no idempotent "already exists"
    /// handling at the provider, so calling it again would be wrong.
    async fn ensure_started_locked(
        &self,
        provider: &dyn ProviderClient,
        config: &Config,
    ) -> CoreResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let image = config.image_for(self.template);
        let params = CreateSandboxParams {
            namespace: &self.namespace,
            name: &self.sandbox_name,
            template: self.template,
            image,
            flavor: self.flavor,
            volumes: &config.shared_volumes,
        };

        match tokio::time::timeout(config.sandbox_start_timeout, provider.create_sandbox(params))
            .await
        {
            Ok(Ok(())) => {
                self.started.store(true, Ordering::Release);
                self.set_state(SessionState::Ready).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::SandboxCreation {
                    session_id: self.id.clone(),
                    message: e.to_string(),
                })
            }
            Err(_elapsed) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::SandboxCreation {
                    session_id: self.id.clone(),
                    message: format!(
                        "sandbox did not start within {:?}",
                        config.sandbox_start_timeout
                    ),
                })
            }
        }
    }

    /// Execute code in this session, creating the sandbox first if needed.
    pub async fn execute_code(
        &self,
        provider: &dyn ProviderClient,
        config: &Config,
        code: &str,
        timeout: Duration,
    ) -> CoreResult<ExecutionOutcome> {
        let _guard = self.op_guard.lock().await;
        self.ensure_started_locked(provider, config).await?;
        self.set_state(SessionState::Running).await;

        let run = tokio::time::timeout(timeout, provider.run_code(&self.namespace, &self.sandbox_name, code, timeout));
        match run.await {
            Ok(Ok(outcome)) => {
                self.set_state(SessionState::Ready).await;
                self.touch().await;
                Ok(outcome)
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::CodeExecution {
                    session_id: self.id.clone(),
                    kind: ExecutionErrorKind::Infrastructure,
                    message: e.to_string(),
                })
            }
            Err(_elapsed) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::CodeExecution {
                    session_id: self.id.clone(),
                    kind: ExecutionErrorKind::Timeout,
                    message: format!("execution exceeded {timeout:?}"),
                })
            }
        }
    }

    /// Execute a shell command in this session, creating the sandbox first
    /// if needed.
    pub async fn execute_command(
        &self,
        provider: &dyn ProviderClient,
        config: &Config,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> CoreResult<CommandOutcome> {
        let _guard = self.op_guard.lock().await;
        self.ensure_started_locked(provider, config).await?;
        self.set_state(SessionState::Running).await;

        let run = tokio::time::timeout(
            timeout,
            provider.run_command(&self.namespace, &self.sandbox_name, command, args, timeout),
        );
        match run.await {
            Ok(Ok(outcome)) => {
                self.set_state(SessionState::Ready).await;
                self.touch().await;
                Ok(outcome)
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::CommandExecution {
                    session_id: self.id.clone(),
                    kind: ExecutionErrorKind::Infrastructure,
                    message: e.to_string(),
                })
            }
            Err(_elapsed) => {
                self.set_state(SessionState::Error).await;
                Err(CoreError::CommandExecution {
                    session_id: self.id.clone(),
                    kind: ExecutionErrorKind::Timeout,
                    message: format!("execution exceeded {timeout:?}"),
                })
            }
        }
    }

    /// Best-effort stop: instruct the provider to stop the sandbox, then
    /// mark this session terminally stopped. Errors are logged, never
    /// propagated — shutdown and expiry must not fail on one bad session.
    pub async fn stop(&self, provider: &dyn ProviderClient) {
        let _guard = self.op_guard.lock().await;
        if let Err(e) = provider.stop_sandbox(&self.namespace, &self.sandbox_name).await {
            warn!(session = %self.id, error = %e, "error stopping sandbox");
        }
        self.set_state(SessionState::Stopped).await;
    }

    /// Attempt to reap this session if it has been idle past `idle_timeout`
    /// and is not currently running an operation. Returns `true` if the
    /// session was stopped by this call.
    ///
    /// Uses `try_lock` so the reaper never waits behind an in-flight
    /// operation (§5) — a session mid-execution is simply skipped and
    /// retried on the next sweep.
    pub async fn try_reap(&self, idle_timeout: Duration, provider: &dyn ProviderClient) -> bool {
        let Ok(_guard) = self.op_guard.try_lock() else {
            return false;
        };
        let state = self.state().await;
        if matches!(state, SessionState::Running | SessionState::Stopped) {
            return false;
        }
        if self.idle_for().await <= idle_timeout {
            return false;
        }
        if let Err(e) = provider.stop_sandbox(&self.namespace, &self.sandbox_name).await {
            warn!(session = %self.id, error = %e, "error stopping idle sandbox");
        }
        self.set_state(SessionState::Stopped).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_creating() {
        let session = ManagedSession::new(
            "s1".to_string(),
            Template::Python,
            Flavor::Small,
            "default".to_string(),
        );
        assert_eq!(session.sandbox_name, "session-s1");
        assert_eq!(session.created_at.elapsed().as_secs(), 0);
    }

    #[test]
    fn state_display_matches_spec_names() {
        assert_eq!(SessionState::Creating.as_str(), "creating");
        assert_eq!(SessionState::Ready.as_str(), "ready");
        assert_eq!(SessionState::Running.as_str(), "running");
        assert_eq!(SessionState::Error.as_str(), "error");
        assert_eq!(SessionState::Stopped.as_str(), "stopped");
    }

    #[derive(Default)]
    struct FlakyProvider {
        creates: std::sync::atomic::AtomicUsize,
        fail_next_run: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ProviderClient for FlakyProvider {
        async fn create_sandbox(&self, _params: CreateSandboxParams<'_>) -> CoreResult<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_code(
            &self,
            _namespace: &str,
            _name: &str,
            code: &str,
            _timeout: Duration,
        ) -> CoreResult<crate::provider::ExecutionOutcome> {
            if self.fail_next_run.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Connection {
                    message: "simulated transport failure".to_string(),
                    retryable: true,
                });
            }
            Ok(crate::provider::ExecutionOutcome {
                stdout: code.to_string(),
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
        ) -> CoreResult<crate::provider::CommandOutcome> {
            unreachable!("not exercised in this test")
        }

        async fn stop_sandbox(&self, _namespace: &str, _name: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn list_sandboxes(&self) -> CoreResult<Vec<crate::provider::SandboxRef>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn recovery_after_execution_failure_does_not_recreate_the_sandbox() {
        let session = ManagedSession::new(
            "s1".to_string(),
            Template::Python,
            Flavor::Small,
            "default".to_string(),
        );
        let provider = FlakyProvider::default();
        provider.fail_next_run.store(true, Ordering::SeqCst);
        let config = Config::default();

        let err = session
            .execute_code(&provider, &config, "1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CodeExecution { .. }));
        assert_eq!(session.state().await, SessionState::Error);
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);

        let outcome = session
            .execute_code(&provider, &config, "2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(session.state().await, SessionState::Ready);
        assert_eq!(
            provider.creates.load(Ordering::SeqCst),
            1,
            "a failed execution must not trigger a second create_sandbox call"
        );
    }
}
