//! The registry mapping session ids to managed sessions, with get-or-create
//! semantics and the idle-expiry background loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ManagedSession, SessionState, SessionSummary};
use crate::config::{Config, Flavor, Template};
use crate::error::{CoreError, CoreResult, ResourceLimitKind};
use crate::provider::ProviderClient;

const DEFAULT_NAMESPACE: &str = "default";

/// Registry of managed sessions. The sole owner of session-id -> session
/// mappings (Ownership, spec §3): only this type may insert or remove an
/// entry.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ManagedSession>>>,
    config: Arc<Config>,
    provider: Arc<dyn ProviderClient>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<Config>, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            provider,
        }
    }

    /// Get an existing session, or atomically admit and create a new one.
    ///
    /// Admission (I2) and insertion (I1) happen under the same write-lock
    /// acquisition so no two concurrent callers can both observe room for
    /// one more session and both insert — the critical section only touches
    /// the in-memory map, never the network (§5).
    ///
    /// Returns the session and whether it was newly created.
    pub async fn get_or_create(
        &self,
        session_id: Option<String>,
        template: Template,
        flavor: Flavor,
    ) -> CoreResult<(Arc<ManagedSession>, bool)> {
        let mut sessions = self.sessions.write().await;

        if let Some(id) = &session_id {
            if let Some(existing) = sessions.get(id) {
                if existing.template != template {
                    return Err(CoreError::InvalidSessionState {
                        session_id: id.clone(),
                        bound_template: existing.template.to_string(),
                        requested_template: template.to_string(),
                    });
                }
                return Ok((Arc::clone(existing), false));
            }
        }

        let active = sessions.len();
        if active >= self.config.max_sessions {
            return Err(CoreError::ResourceLimit {
                kind: ResourceLimitKind::MaxSessions,
                message: format!(
                    "max_sessions={} reached ({active} active)",
                    self.config.max_sessions
                ),
                suggestion: "stop an idle session, or retry after the expiry sweep runs"
                    .to_string(),
            });
        }
        if let Some(max_mem) = self.config.max_total_memory_mb {
            let current: u64 = sessions.values().map(|s| s.flavor.memory_mb()).sum();
            if current + flavor.memory_mb() > max_mem {
                return Err(CoreError::ResourceLimit {
                    kind: ResourceLimitKind::MaxTotalMemory,
                    message: format!(
                        "max_total_memory={max_mem}MiB would be exceeded ({current}MiB in use, +{}MiB requested)",
                        flavor.memory_mb()
                    ),
                    suggestion: "choose a smaller flavor, or retry after an active session frees memory"
                        .to_string(),
                });
            }
        }

        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(ManagedSession::new(
            id.clone(),
            template,
            flavor,
            DEFAULT_NAMESPACE.to_string(),
        ));
        sessions.insert(id, Arc::clone(&session));
        info!(session = %session.id, template = %template, flavor = %flavor, "created session");
        Ok((session, true))
    }

    /// Update last-accessed to now. Idempotent; no-op for an unknown id.
    pub async fn touch(&self, session_id: &str) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(session_id) {
            session.touch().await;
        }
    }

    /// Stop and remove a session. Returns `true` iff a session existed and
    /// was transitioned to stopped. Never raises — provider errors during
    /// stop are logged by `ManagedSession::stop` and swallowed.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        let Some(session) = session else {
            return false;
        };
        if session.state().await == SessionState::Stopped {
            return false;
        }
        session.stop(self.provider.as_ref()).await;
        true
    }

    /// Snapshot sessions, optionally filtered to one id.
    pub async fn get_sessions(&self, session_id: Option<&str>) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries = Vec::new();
        match session_id {
            Some(id) => {
                if let Some(session) = sessions.get(id) {
                    summaries.push(session.summary().await);
                }
            }
            None => {
                for session in sessions.values() {
                    summaries.push(session.summary().await);
                }
            }
        }
        summaries
    }

    /// Number of currently-registered (non-stopped by construction: stopped
    /// sessions are removed immediately) sessions, and their aggregate
    /// memory in MiB. Used by the Resource Manager to compute snapshots
    /// without a second lock over the same data.
    pub async fn active_counts(&self) -> (usize, u64, u32) {
        let sessions = self.sessions.read().await;
        let count = sessions.len();
        let memory: u64 = sessions.values().map(|s| s.flavor.memory_mb()).sum();
        let cpus: u32 = sessions.values().map(|s| s.flavor.cpus()).sum();
        (count, memory, cpus)
    }

    /// Per-flavor breakdown of active sessions.
    pub async fn flavor_breakdown(&self) -> HashMap<Flavor, usize> {
        let sessions = self.sessions.read().await;
        let mut breakdown = HashMap::new();
        for session in sessions.values() {
            *breakdown.entry(session.flavor).or_insert(0) += 1;
        }
        breakdown
    }

    /// `(namespace, name)` pairs owned by every non-stopped session right
    /// now — the set the Resource Manager compares the provider's listing
    /// against to find orphans (I5).
    pub async fn owned_sandbox_refs(&self) -> std::collections::HashSet<(String, String)> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| (s.namespace.clone(), s.sandbox_name.clone()))
            .collect()
    }

    /// Stop every session in the registry, best-effort, concurrently with a
    /// bounded fan-out. Used by the Facade on shutdown.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<ManagedSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        const MAX_CONCURRENT_STOPS: usize = 16;
        for chunk in sessions.chunks(MAX_CONCURRENT_STOPS) {
            let futures = chunk.iter().map(|s| s.stop(self.provider.as_ref()));
            futures::future::join_all(futures).await;
        }
    }

    /// Run one idle-expiry sweep: reap every session idle past
    /// `session_timeout` that is not currently running an operation.
    pub async fn cleanup_expired(&self) -> usize {
        let candidates: Vec<Arc<ManagedSession>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut reaped_ids = Vec::new();
        for session in &candidates {
            if session
                .try_reap(self.config.session_timeout, self.provider.as_ref())
                .await
            {
                reaped_ids.push(session.id.clone());
            }
        }

        if !reaped_ids.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &reaped_ids {
                sessions.remove(id);
            }
            info!(count = reaped_ids.len(), "reaped idle sessions");
        }
        reaped_ids.len()
    }

    /// Start the background idle-expiry loop. Returns a handle joined on
    /// shutdown; cancelling `token` stops the loop promptly, between ticks.
    pub fn start_expiry_loop(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("expiry loop cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reaped = manager.cleanup_expired().await;
                        debug!(reaped, "expiry sweep complete");
                    }
                }
            }
        })
    }
}
