//! End-to-end scenarios against the Facade with an in-memory provider
//! double, mirroring the concrete walkthroughs in the design notes: session
//! reuse and auto-create, admission under concurrency, idle expiry, command
//! exit codes, and orphan reclamation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use sandbox_session_mcp::config::{Config, Flavor, Template};
use sandbox_session_mcp::error::{CoreError, CoreResult};
use sandbox_session_mcp::facade::Facade;
use sandbox_session_mcp::provider::{
    CommandOutcome, CreateSandboxParams, ExecutionOutcome, ProviderClient, SandboxRef,
};

/// An in-memory stand-in for the remote sandbox provider. `run_code` echoes
/// the last line of `code` as stdout, `run_command` with `exit` treats its
/// first argument as the exit code it should report, mirroring the kind of
/// deterministic fakes the teacher's own test doubles use.
#[derive(Default)]
struct FakeProvider {
    running: Mutex<Vec<SandboxRef>>,
    creates: AtomicUsize,
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn create_sandbox(&self, params: CreateSandboxParams<'_>) -> CoreResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.running.lock().await.push(SandboxRef {
            namespace: params.namespace.to_string(),
            name: params.name.to_string(),
        });
        Ok(())
    }

    async fn run_code(
        &self,
        _namespace: &str,
        _name: &str,
        code: &str,
        _timeout: Duration,
    ) -> CoreResult<ExecutionOutcome> {
        let stdout = code
            .rsplit("print(")
            .next()
            .and_then(|rest| rest.split(')').next())
            .map(|inner| format!("{}\n", inner.trim_matches(|c| c == '\'' || c == '"')))
            .unwrap_or_default();
        Ok(ExecutionOutcome {
            stdout,
            stderr: String::new(),
            success: true,
        })
    }

    async fn run_command(
        &self,
        _namespace: &str,
        _name: &str,
        command: &str,
        args: &[String],
        _timeout: Duration,
    ) -> CoreResult<CommandOutcome> {
        if command == "exit" {
            let code: i32 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            return Ok(CommandOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: code,
                success: true,
            });
        }
        Ok(CommandOutcome {
            stdout: format!("ran {command}"),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        })
    }

    async fn stop_sandbox(&self, namespace: &str, name: &str) -> CoreResult<()> {
        let mut running = self.running.lock().await;
        running.retain(|s| !(s.namespace == namespace && s.name == name));
        Ok(())
    }

    async fn list_sandboxes(&self) -> CoreResult<Vec<SandboxRef>> {
        Ok(self.running.lock().await.clone())
    }
}

fn facade_with(config: Config) -> Facade {
    Facade::new(config, Arc::new(FakeProvider::default()))
}

#[tokio::test]
async fn new_session_then_reuse_then_unknown_id_autocreates() {
    let facade = facade_with(Config::default());

    let (s1, created1, outcome1) = facade
        .execute_code("print('hi')", Template::Python, None, None, None)
        .await
        .unwrap();
    assert!(created1);
    assert_eq!(outcome1.stdout, "hi\n");
    assert!(outcome1.success);

    let sessions = facade.get_sessions(None).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, s1);
    assert_eq!(sessions[0].template, Template::Python);
    assert_eq!(sessions[0].flavor, Flavor::Small);

    let (s1_again, created2, outcome2) = facade
        .execute_code(
            "print('again')",
            Template::Python,
            Some(s1.clone()),
            None,
            None,
        )
        .await
        .unwrap();
    assert!(!created2);
    assert_eq!(s1_again, s1);
    assert_eq!(outcome2.stdout, "again\n");

    let (s3, created3, _) = facade
        .execute_code(
            "print('new')",
            Template::Python,
            Some("unknown".to_string()),
            None,
            None,
        )
        .await
        .unwrap();
    assert!(created3);
    assert_ne!(s3, s1);
}

#[tokio::test]
async fn admission_rejects_the_third_concurrent_session() {
    let mut config = Config::default();
    config.max_sessions = 2;
    let facade = Arc::new(facade_with(config));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let facade = Arc::clone(&facade);
        handles.push(tokio::spawn(async move {
            facade
                .execute_code("1", Template::Python, None, Some(Flavor::Small), None)
                .await
        }));
    }

    let mut ok = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(CoreError::ResourceLimit { message, .. }) => {
                assert!(message.contains("max_sessions=2"));
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(limited, 1);
}

#[tokio::test]
async fn idle_session_expires_after_timeout() {
    let mut config = Config::default();
    config.session_timeout = Duration::from_millis(50);
    config.cleanup_interval = Duration::from_millis(20);
    let facade = facade_with(config);
    facade.start();

    let (_id, _created, _) = facade
        .execute_code("1", Template::Python, Some("s1".to_string()), None, None)
        .await
        .unwrap();
    assert_eq!(facade.get_sessions(None).await.len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(facade.get_sessions(None).await.is_empty());

    facade.stop().await;
}

#[tokio::test]
async fn command_exit_code_is_surfaced_without_infrastructure_failure() {
    let facade = facade_with(Config::default());
    let (_id, created, outcome) = facade
        .execute_command(
            "exit",
            &["7".to_string()],
            Template::Python,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(created);
    assert!(outcome.success);
    assert_eq!(outcome.exit_code, 7);
}

#[tokio::test]
async fn stop_session_is_idempotent_and_unknown_ids_return_not_found() {
    let facade = facade_with(Config::default());
    let (id, _created, _) = facade
        .execute_code("1", Template::Python, None, None, None)
        .await
        .unwrap();

    facade.stop_session(&id).await.unwrap();
    assert!(facade.get_sessions(None).await.is_empty());

    let err = facade.stop_session(&id).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound { .. }));

    let err = facade.stop_session("never-existed").await.unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound { .. }));
}

#[tokio::test]
async fn volume_mappings_pass_through_configuration() {
    let config = Config::from_map(&HashMap::from([(
        "SHARED_VOLUMES".to_string(),
        "/host:/container".to_string(),
    )]))
    .unwrap();
    let facade = facade_with(config);
    let mappings = facade.get_volume_mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].host_path, "/host");
    assert_eq!(mappings[0].container_path, "/container");
}
