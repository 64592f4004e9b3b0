//! Global resource accounting: admission checks, live statistics, and the
//! orphan-sandbox reclamation loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Flavor};
use crate::provider::ProviderClient;
use crate::session::SessionManager;

/// A point-in-time view of global resource usage (spec §3).
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub active_sessions: usize,
    pub flavor_breakdown: HashMap<Flavor, usize>,
    pub total_memory_mb: u64,
    pub total_cpus: u32,
    pub max_sessions: usize,
    pub max_total_memory_mb: Option<u64>,
    pub uptime_seconds: u64,
}

/// Enforces global quotas before sessions are created and drives the
/// orphan-cleanup loop. Holds only read access to the session registry
/// (Ownership, spec §3) — it never inserts or removes an entry itself.
pub struct ResourceManager {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    provider: Arc<dyn ProviderClient>,
    started_at: Instant,
    /// First-observed time for each orphan candidate, keyed by
    /// `(namespace, name)`. A candidate is only reclaimed once it has
    /// survived a full `orphan_cleanup_interval` quarantine window (spec
    /// §9: the provider listing can lag, so a sandbox `creating` at the
    /// instant of listing must not be misclassified as orphan).
    quarantine: Mutex<HashMap<(String, String), Instant>>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionManager>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            config,
            sessions,
            provider,
            started_at: Instant::now(),
            quarantine: Mutex::new(HashMap::new()),
        }
    }

    /// Whether admitting one more session of `flavor` would respect I2.
    /// Read-only and advisory: the atomic enforcement happens inside
    /// `SessionManager::get_or_create`, which holds the registry lock
    /// needed to make the check-then-insert indivisible (see DESIGN.md).
    pub async fn check_admission(&self, flavor: Flavor) -> bool {
        let (active, memory, _cpus) = self.sessions.active_counts().await;
        if active >= self.config.max_sessions {
            return false;
        }
        if let Some(max_mem) = self.config.max_total_memory_mb {
            if memory + flavor.memory_mb() > max_mem {
                return false;
            }
        }
        true
    }

    /// Derive a resource snapshot from the Session Manager's current view.
    pub async fn get_resource_stats(&self) -> ResourceSnapshot {
        let (active_sessions, total_memory_mb, total_cpus) = self.sessions.active_counts().await;
        let flavor_breakdown = self.sessions.flavor_breakdown().await;
        ResourceSnapshot {
            active_sessions,
            flavor_breakdown,
            total_memory_mb,
            total_cpus,
            max_sessions: self.config.max_sessions,
            max_total_memory_mb: self.config.max_total_memory_mb,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Query the provider for running sandboxes, compare against what the
    /// registry currently owns, and stop every sandbox that has survived at
    /// least one quarantine period as an orphan candidate (I5). Returns the
    /// number of sandboxes reclaimed this sweep.
    pub async fn cleanup_orphan_sandboxes(&self) -> usize {
        let provider_sandboxes = match self.provider.list_sandboxes().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list provider sandboxes for orphan sweep");
                return 0;
            }
        };

        let owned = self.sessions.owned_sandbox_refs().await;
        let now = Instant::now();
        let mut quarantine = self.quarantine.lock().await;

        // Drop quarantine entries for sandboxes that are no longer
        // candidates (claimed by a session, or no longer reported by the
        // provider at all).
        let seen: std::collections::HashSet<(String, String)> = provider_sandboxes
            .iter()
            .map(|s| (s.namespace.clone(), s.name.clone()))
            .collect();
        quarantine.retain(|key, _| seen.contains(key) && !owned.contains(key));

        let mut reclaimed = 0;
        for sandbox in &provider_sandboxes {
            let key = (sandbox.namespace.clone(), sandbox.name.clone());
            if owned.contains(&key) {
                continue;
            }

            let first_seen = *quarantine.entry(key.clone()).or_insert(now);
            if now.duration_since(first_seen) < self.config.orphan_cleanup_interval {
                debug!(namespace = %sandbox.namespace, name = %sandbox.name, "orphan candidate still in quarantine");
                continue;
            }

            match self
                .provider
                .stop_sandbox(&sandbox.namespace, &sandbox.name)
                .await
            {
                Ok(()) => {
                    info!(namespace = %sandbox.namespace, name = %sandbox.name, "reclaimed orphan sandbox");
                    quarantine.remove(&key);
                    reclaimed += 1;
                }
                Err(e) => {
                    warn!(namespace = %sandbox.namespace, name = %sandbox.name, error = %e, "failed to reclaim orphan sandbox");
                }
            }
        }

        reclaimed
    }

    /// Start the background orphan-cleanup loop.
    pub fn start_orphan_loop(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.orphan_cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("orphan cleanup loop cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reclaimed = manager.cleanup_orphan_sandboxes().await;
                        if reclaimed > 0 {
                            info!(reclaimed, "orphan cleanup sweep reclaimed sandboxes");
                        } else {
                            debug!("orphan cleanup sweep found nothing to reclaim");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Template;
    use crate::provider::{
        CommandOutcome, CreateSandboxParams, ExecutionOutcome, ProviderClient, SandboxRef,
    };
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct FakeProvider {
        running: TokioMutex<Vec<SandboxRef>>,
        stopped: TokioMutex<Vec<SandboxRef>>,
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        async fn create_sandbox(
            &self,
            _params: CreateSandboxParams<'_>,
        ) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn run_code(
            &self,
            _namespace: &str,
            _name: &str,
            _code: &str,
            _timeout: Duration,
        ) -> crate::error::CoreResult<ExecutionOutcome> {
            unreachable!("not exercised in these tests")
        }

        async fn run_command(
            &self,
            _namespace: &str,
            _name: &str,
            _command: &str,
            _args: &[String],
            _timeout: Duration,
        ) -> crate::error::CoreResult<CommandOutcome> {
            unreachable!("not exercised in these tests")
        }

        async fn stop_sandbox(&self, namespace: &str, name: &str) -> crate::error::CoreResult<()> {
            let mut running = self.running.lock().await;
            running.retain(|s| !(s.namespace == namespace && s.name == name));
            self.stopped.lock().await.push(SandboxRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
            Ok(())
        }

        async fn list_sandboxes(&self) -> crate::error::CoreResult<Vec<SandboxRef>> {
            Ok(self.running.lock().await.clone())
        }
    }

    #[tokio::test]
    async fn admission_respects_max_sessions() {
        let mut config = Config::default();
        config.max_sessions = 1;
        let config = Arc::new(config);
        let provider: Arc<dyn ProviderClient> = Arc::new(FakeProvider::default());
        let sessions = Arc::new(SessionManager::new(Arc::clone(&config), Arc::clone(&provider)));
        let resources = ResourceManager::new(Arc::clone(&config), Arc::clone(&sessions), provider);

        assert!(resources.check_admission(Flavor::Small).await);
        sessions
            .get_or_create(Some("s1".to_string()), Template::Python, Flavor::Small)
            .await
            .unwrap();
        assert!(!resources.check_admission(Flavor::Small).await);
    }

    #[tokio::test]
    async fn orphan_sweep_quarantines_before_reclaiming() {
        let config = Arc::new(Config::default());
        let provider = Arc::new(FakeProvider::default());
        provider.running.lock().await.push(SandboxRef {
            namespace: "default".to_string(),
            name: "rogue-1".to_string(),
        });
        let provider_trait: Arc<dyn ProviderClient> = provider.clone();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&provider_trait),
        ));
        let resources = ResourceManager::new(config, sessions, provider_trait);

        // First sweep only observes the candidate; quarantine window has
        // not elapsed yet.
        let reclaimed_first = resources.cleanup_orphan_sandboxes().await;
        assert_eq!(reclaimed_first, 0);
        assert_eq!(provider.list_sandboxes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphan_sweep_reclaims_after_quarantine_elapses() {
        let mut config = Config::default();
        config.orphan_cleanup_interval = Duration::from_millis(0);
        let config = Arc::new(config);
        let provider = Arc::new(FakeProvider::default());
        provider.running.lock().await.push(SandboxRef {
            namespace: "default".to_string(),
            name: "rogue-1".to_string(),
        });
        let provider_trait: Arc<dyn ProviderClient> = provider.clone();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&provider_trait),
        ));
        let resources = ResourceManager::new(config, sessions, provider_trait);

        resources.cleanup_orphan_sandboxes().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let reclaimed = resources.cleanup_orphan_sandboxes().await;
        assert_eq!(reclaimed, 1);
        assert!(provider.list_sandboxes().await.unwrap().is_empty());
    }
}
