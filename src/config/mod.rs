//! `WeaveConfig` — the resolved configuration surface for the orchestration
//! core.
//!
//! Priority (highest to lowest): CLI flag / env var > `config.toml` > the
//! built-in default for that key.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 5;
const DEFAULT_REGISTRY_TTL_S: u64 = 15;
const DEFAULT_CONCURRENCY_CAP_PER_AGENT: usize = 16;
const DEFAULT_QUEUE_DEPTH: usize = 128;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_FAILURE_THRESHOLD_SAFETY: u32 = 3;
const DEFAULT_COOLDOWN_S: u64 = 60;
const DEFAULT_COOLDOWN_SAFETY_S: u64 = 30;
const DEFAULT_HALF_OPEN_PROBES: u32 = 3;
const DEFAULT_REWRITE_CAP: u32 = 1;
const DEFAULT_SCORE_THRESHOLD_WARN: f64 = 0.4;
const DEFAULT_TOPIC_BUFFER: usize = 1024;
const DEFAULT_SLOW_CONSUMER_WATERMARK: usize = 256;
const DEFAULT_PUBLIC_TOPIC_PREFIX: &str = "public.";
const DEFAULT_RETRY_MAX: u32 = 2;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const DEFAULT_RETRY_CAP_MS: u64 = 2000;
const DEFAULT_DEDUP_TTL_S: u64 = 300;
const DEFAULT_WS_PORT: u16 = 4600;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// `{data_dir}/config.toml` — every field optional; absence falls through
/// to the built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    ws_port: Option<u16>,
    log: Option<String>,
    registry_redis_url: Option<String>,
    registry_heartbeat_interval_s: Option<u64>,
    registry_ttl_s: Option<u64>,
    router_concurrency_cap_per_agent: Option<usize>,
    router_queue_depth: Option<usize>,
    breaker_failure_threshold_default: Option<u32>,
    breaker_failure_threshold_safety: Option<u32>,
    breaker_cooldown_default_s: Option<u64>,
    breaker_cooldown_safety_s: Option<u64>,
    breaker_half_open_probes: Option<u32>,
    safety_mode_default: Option<String>,
    safety_rewrite_cap_per_payload: Option<u32>,
    safety_score_threshold_warn: Option<f64>,
    hub_topic_buffer: Option<usize>,
    hub_slow_consumer_watermark: Option<usize>,
    hub_public_topic_prefix: Option<String>,
    hub_redis_channel_prefix: Option<String>,
    orchestrator_retry_max: Option<u32>,
    orchestrator_retry_base_ms: Option<u64>,
    orchestrator_retry_cap_ms: Option<u64>,
    orchestrator_dedup_ttl_s: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Safety mode dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyMode {
    Normal,
    Strict,
    CrisisBypass,
}

impl SafetyMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "strict" => Some(Self::Strict),
            "crisis-bypass" => Some(Self::CrisisBypass),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeaveConfig {
    pub ws_port: u16,
    pub data_dir: PathBuf,
    pub log: String,

    pub registry_redis_url: String,
    pub registry_heartbeat_interval: Duration,
    pub registry_ttl: Duration,

    pub router_concurrency_cap_per_agent: usize,
    pub router_queue_depth: usize,

    pub breaker_failure_threshold_default: u32,
    pub breaker_failure_threshold_safety: u32,
    pub breaker_cooldown_default: Duration,
    pub breaker_cooldown_safety: Duration,
    pub breaker_half_open_probes: u32,

    pub safety_mode_default: SafetyMode,
    pub safety_rewrite_cap_per_payload: u32,
    pub safety_score_threshold_warn: f64,

    pub hub_topic_buffer: usize,
    pub hub_slow_consumer_watermark: usize,
    pub hub_public_topic_prefix: String,
    pub hub_redis_channel_prefix: String,

    pub orchestrator_retry_max: u32,
    pub orchestrator_retry_base: Duration,
    pub orchestrator_retry_cap: Duration,
    pub orchestrator_dedup_ttl: Duration,

    /// Shared secret every WebSocket client must present in its `hello`
    /// frame. Empty means auth is disabled (local development only).
    pub ws_auth_token: String,
}

impl WeaveConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    pub fn new(ws_port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let registry_redis_url = std::env::var("WEAVE_REDIS_URL")
            .ok()
            .or(toml.registry_redis_url)
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let safety_mode_default = toml
            .safety_mode_default
            .as_deref()
            .and_then(SafetyMode::parse)
            .unwrap_or(SafetyMode::Normal);

        Self {
            ws_port: ws_port.or(toml.ws_port).unwrap_or(DEFAULT_WS_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            registry_redis_url,
            registry_heartbeat_interval: Duration::from_secs(
                toml.registry_heartbeat_interval_s
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_S),
            ),
            registry_ttl: Duration::from_secs(toml.registry_ttl_s.unwrap_or(DEFAULT_REGISTRY_TTL_S)),
            router_concurrency_cap_per_agent: toml
                .router_concurrency_cap_per_agent
                .unwrap_or(DEFAULT_CONCURRENCY_CAP_PER_AGENT),
            router_queue_depth: toml.router_queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            breaker_failure_threshold_default: toml
                .breaker_failure_threshold_default
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            breaker_failure_threshold_safety: toml
                .breaker_failure_threshold_safety
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD_SAFETY),
            breaker_cooldown_default: Duration::from_secs(
                toml.breaker_cooldown_default_s.unwrap_or(DEFAULT_COOLDOWN_S),
            ),
            breaker_cooldown_safety: Duration::from_secs(
                toml.breaker_cooldown_safety_s
                    .unwrap_or(DEFAULT_COOLDOWN_SAFETY_S),
            ),
            breaker_half_open_probes: toml
                .breaker_half_open_probes
                .unwrap_or(DEFAULT_HALF_OPEN_PROBES),
            safety_mode_default,
            safety_rewrite_cap_per_payload: toml
                .safety_rewrite_cap_per_payload
                .unwrap_or(DEFAULT_REWRITE_CAP),
            safety_score_threshold_warn: toml
                .safety_score_threshold_warn
                .unwrap_or(DEFAULT_SCORE_THRESHOLD_WARN),
            hub_topic_buffer: toml.hub_topic_buffer.unwrap_or(DEFAULT_TOPIC_BUFFER),
            hub_slow_consumer_watermark: toml
                .hub_slow_consumer_watermark
                .unwrap_or(DEFAULT_SLOW_CONSUMER_WATERMARK),
            hub_public_topic_prefix: toml
                .hub_public_topic_prefix
                .unwrap_or_else(|| DEFAULT_PUBLIC_TOPIC_PREFIX.to_string()),
            hub_redis_channel_prefix: toml
                .hub_redis_channel_prefix
                .unwrap_or_else(|| "weave:events:".to_string()),
            orchestrator_retry_max: toml.orchestrator_retry_max.unwrap_or(DEFAULT_RETRY_MAX),
            orchestrator_retry_base: Duration::from_millis(
                toml.orchestrator_retry_base_ms
                    .unwrap_or(DEFAULT_RETRY_BASE_MS),
            ),
            orchestrator_retry_cap: Duration::from_millis(
                toml.orchestrator_retry_cap_ms.unwrap_or(DEFAULT_RETRY_CAP_MS),
            ),
            orchestrator_dedup_ttl: Duration::from_secs(
                toml.orchestrator_dedup_ttl_s.unwrap_or(DEFAULT_DEDUP_TTL_S),
            ),
            ws_auth_token: load_or_create_auth_token(&data_dir),
            data_dir,
        }
    }
}

impl From<SafetyMode> for crate::types::SafetyMode {
    fn from(mode: SafetyMode) -> Self {
        match mode {
            SafetyMode::Normal => crate::types::SafetyMode::Normal,
            SafetyMode::Strict => crate::types::SafetyMode::Strict,
            SafetyMode::CrisisBypass => crate::types::SafetyMode::CrisisBypass,
        }
    }
}

/// Reads `{data_dir}/auth_token`, generating and persisting a fresh one
/// (mode 0600 on Unix) on first run — mirrors how the rest of the ambient
/// config is resolved: a file under `data_dir` wins, a generated default
/// falls back.
fn load_or_create_auth_token(data_dir: &Path) -> String {
    let path = data_dir.join("auth_token");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let token = uuid::Uuid::new_v4().to_string();
    if std::fs::create_dir_all(data_dir).is_ok() {
        if std::fs::write(&path, &token).is_ok() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(&path) {
                    let mut perms = meta.permissions();
                    perms.set_mode(0o600);
                    let _ = std::fs::set_permissions(&path, perms);
                }
            }
        } else {
            error!(path = %path.display(), "failed to persist generated auth token");
        }
    }
    token
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("weave");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("weave");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".weave");
        }
    }
    PathBuf::from(".weave")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = WeaveConfig::new(None, Some(PathBuf::from("/tmp/weave-test-nonexistent")), None);
        assert_eq!(cfg.ws_port, DEFAULT_WS_PORT);
        assert_eq!(cfg.registry_heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.registry_ttl, Duration::from_secs(15));
        assert_eq!(cfg.router_concurrency_cap_per_agent, 16);
        assert_eq!(cfg.router_queue_depth, 128);
        assert_eq!(cfg.breaker_failure_threshold_default, 5);
        assert_eq!(cfg.breaker_failure_threshold_safety, 3);
        assert_eq!(cfg.breaker_cooldown_default, Duration::from_secs(60));
        assert_eq!(cfg.breaker_cooldown_safety, Duration::from_secs(30));
        assert_eq!(cfg.breaker_half_open_probes, 3);
        assert_eq!(cfg.safety_mode_default, SafetyMode::Normal);
        assert_eq!(cfg.safety_rewrite_cap_per_payload, 1);
        assert!((cfg.safety_score_threshold_warn - 0.4).abs() < f64::EPSILON);
        assert_eq!(cfg.hub_topic_buffer, 1024);
        assert_eq!(cfg.hub_slow_consumer_watermark, 256);
        assert_eq!(cfg.hub_public_topic_prefix, "public.");
        assert_eq!(cfg.orchestrator_retry_max, 2);
        assert_eq!(cfg.orchestrator_retry_base, Duration::from_millis(250));
        assert_eq!(cfg.orchestrator_retry_cap, Duration::from_millis(2000));
        assert_eq!(cfg.orchestrator_dedup_ttl, Duration::from_secs(300));
    }
}
