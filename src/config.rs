//! Configuration loaded from process environment variables.
//!
//! A single immutable value built once at startup. All fields have
//! documented defaults and are validated in [`Config::from_env`].

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const ENV_PREFIX: &str = "SANDBOX_MCP_";

/// Closed set of sandbox resource flavors. Raw CPU/memory numbers are never
/// exposed through the tool surface — flavors are the only way resources are
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Small,
    Medium,
    Large,
}

impl Flavor {
    /// CPU count and memory (MiB) for this flavor.
    #[must_use]
    pub const fn resources(self) -> (u32, u64) {
        match self {
            Self::Small => (1, 1024),
            Self::Medium => (2, 2048),
            Self::Large => (4, 4096),
        }
    }

    #[must_use]
    pub const fn cpus(self) -> u32 {
        self.resources().0
    }

    #[must_use]
    pub const fn memory_mb(self) -> u64 {
        self.resources().1
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(CoreError::Configuration {
                message: format!(
                    "unknown flavor '{other}', expected one of: small, medium, large"
                ),
            }),
        }
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of sandbox templates accepted by the tool schema. The image
/// table in [`Config`] may carry more entries than this enum lists (see
/// DESIGN.md); only entries present in that table are ever accepted, and
/// the schema only ever advertises the variants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Python,
    Node,
}

impl Template {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "node" => Ok(Self::Node),
            other => Err(CoreError::Configuration {
                message: format!("unknown template '{other}', expected one of: python, node"),
            }),
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host-path -> container-path shared volume mapping.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
}

/// Top-level configuration for the daemon, built once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sandbox provider base URL.
    pub server_url: String,
    /// Sandbox provider credential, if configured.
    pub api_key: Option<String>,
    /// How long a session may be idle before the expiry loop reclaims it.
    pub session_timeout: Duration,
    /// Concurrency ceiling: maximum simultaneously non-stopped sessions.
    pub max_sessions: usize,
    /// Period between idle-expiry sweeps.
    pub cleanup_interval: Duration,
    /// Flavor used when a tool call omits one.
    pub default_flavor: Flavor,
    /// How long to wait for the provider to start a sandbox.
    pub sandbox_start_timeout: Duration,
    /// Default per-call execution timeout when a tool call omits one.
    pub default_execution_timeout: Duration,
    /// Optional aggregate memory ceiling (MiB), across all active sessions.
    pub max_total_memory_mb: Option<u64>,
    /// Shared host/container volume mappings, surfaced via `get_volume_path`.
    pub shared_volumes: Vec<VolumeMapping>,
    /// Period between orphan-sandbox reclamation sweeps.
    pub orphan_cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5555".to_string(),
            api_key: None,
            session_timeout: Duration::from_secs(1800),
            max_sessions: 10,
            cleanup_interval: Duration::from_secs(60),
            default_flavor: Flavor::Small,
            sandbox_start_timeout: Duration::from_secs(180),
            default_execution_timeout: Duration::from_secs(300),
            max_total_memory_mb: None,
            shared_volumes: Vec::new(),
            orphan_cleanup_interval: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Load configuration from `SANDBOX_MCP_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> CoreResult<Self> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), v))
            })
            .collect();
        Self::from_map(&vars)
    }

    /// Build configuration from an explicit map (used by `from_env` and by
    /// tests, which can exercise validation without touching the real
    /// process environment).
    pub fn from_map(vars: &HashMap<String, String>) -> CoreResult<Self> {
        let defaults = Self::default();

        let server_url = vars
            .get("SERVER_URL")
            .cloned()
            .unwrap_or(defaults.server_url);
        if server_url.trim().is_empty() {
            return Err(CoreError::Configuration {
                message: "server url must not be empty".to_string(),
            });
        }

        let api_key = vars.get("API_KEY").cloned();

        let session_timeout =
            parse_secs(vars, "SESSION_TIMEOUT_SECONDS", defaults.session_timeout)?;
        let max_sessions = parse_usize(vars, "MAX_SESSIONS", defaults.max_sessions)?;
        if max_sessions == 0 {
            return Err(CoreError::Configuration {
                message: "max_sessions must be at least 1".to_string(),
            });
        }
        let cleanup_interval =
            parse_secs(vars, "CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval)?;

        let default_flavor = match vars.get("DEFAULT_FLAVOR") {
            Some(raw) => Flavor::parse(raw)?,
            None => defaults.default_flavor,
        };

        let sandbox_start_timeout = parse_secs(
            vars,
            "SANDBOX_START_TIMEOUT_SECONDS",
            defaults.sandbox_start_timeout,
        )?;
        let default_execution_timeout = parse_secs(
            vars,
            "DEFAULT_EXECUTION_TIMEOUT_SECONDS",
            defaults.default_execution_timeout,
        )?;

        let max_total_memory_mb = match vars.get("MAX_TOTAL_MEMORY_MB") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| CoreError::Configuration {
                        message: format!(
                            "MAX_TOTAL_MEMORY_MB must be a non-negative integer, got '{raw}'"
                        ),
                    })?,
            ),
            None => None,
        };

        let shared_volumes = match vars.get("SHARED_VOLUMES") {
            Some(raw) => parse_volume_mappings(raw)?,
            None => Vec::new(),
        };

        let orphan_cleanup_interval = parse_secs(
            vars,
            "ORPHAN_CLEANUP_INTERVAL_SECONDS",
            defaults.orphan_cleanup_interval,
        )?;

        Ok(Self {
            server_url,
            api_key,
            session_timeout,
            max_sessions,
            cleanup_interval,
            default_flavor,
            sandbox_start_timeout,
            default_execution_timeout,
            max_total_memory_mb,
            shared_volumes,
            orphan_cleanup_interval,
        })
    }

    /// Image name the provider should use for a given template. This table
    /// may be a superset of the closed schema set; only the variants in
    /// [`Template`] are ever exposed through the tool surface.
    #[must_use]
    pub fn image_for(&self, template: Template) -> &'static str {
        match template {
            Template::Python => "python:3.11-slim",
            Template::Node => "node:20-slim",
        }
    }
}

fn parse_secs(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> CoreResult<Duration> {
    match vars.get(key) {
        Some(raw) => {
            let secs: u64 = raw.trim().parse().map_err(|_| CoreError::Configuration {
                message: format!("{key} must be a non-negative integer, got '{raw}'"),
            })?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(default),
    }
}

fn parse_usize(vars: &HashMap<String, String>, key: &str, default: usize) -> CoreResult<usize> {
    match vars.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| CoreError::Configuration {
            message: format!("{key} must be a non-negative integer, got '{raw}'"),
        }),
        None => Ok(default),
    }
}

/// Parse the shared-volume mapping list, accepting either a JSON array of
/// `{host_path, container_path}` objects or a comma-separated list of
/// `host:container` entries.
fn parse_volume_mappings(raw: &str) -> CoreResult<Vec<VolumeMapping>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| CoreError::Configuration {
            message: format!("invalid SHARED_VOLUMES JSON array: {e}"),
        });
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, container) =
                entry
                    .split_once(':')
                    .ok_or_else(|| CoreError::Configuration {
                        message: format!(
                            "invalid SHARED_VOLUMES entry '{entry}', expected 'host:container'"
                        ),
                    })?;
            Ok(VolumeMapping {
                host_path: host.to_string(),
                container_path: container.to_string(),
            })
        })
        .collect()
}
