use std::path::PathBuf;

use anyhow::{anyhow, Result};
use jsonschema::validator_for;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::session::Retention;

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VatConfig {
    /// Public base URL of this vat, e.g. <http://127.0.0.1:8091/>
    #[serde(default)]
    pub here: Option<String>,
    /// Name of the vat image inside the state store.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Session windows whose results are kept for replay.
    #[serde(default)]
    pub session_windows: Option<usize>,
    /// Client sessions remembered before the least recently used is dropped.
    #[serde(default)]
    pub max_sessions: Option<usize>,
    /// Evicted sessions still refused on retry.
    #[serde(default)]
    pub max_tombstones: Option<usize>,
    /// Resolution probes sent for a remote promise before giving up.
    #[serde(default)]
    pub max_when_probes: Option<u32>,
    /// Largest response body accepted from a peer.
    #[serde(default)]
    pub max_content_bytes: Option<usize>,
    /// Cache lifetime of property reads (0 disables caching).
    #[serde(default)]
    pub ephemeral_max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct HttpConfig {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub vat: VatConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_value(&schema)?)
}

pub fn write_schema_file(path: &str) -> Result<()> {
    let schema_json = config_schema_json()?;
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)?;
    Ok(())
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let schema = config_schema_json()?;
    let validator = validator_for(&schema).map_err(|e| anyhow!("invalid config schema: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Effective runtime settings of one vat.
#[derive(Debug, Clone, PartialEq)]
pub struct VatSettings {
    pub here: String,
    pub name: String,
    pub state_dir: PathBuf,
    pub retention: Retention,
    pub max_when_probes: u32,
    pub max_content_bytes: usize,
    pub ephemeral_max_age_secs: u64,
}

impl Default for VatSettings {
    fn default() -> Self {
        Self {
            here: "http://127.0.0.1:8091/".into(),
            name: "vat".into(),
            state_dir: PathBuf::from("state"),
            retention: Retention::default(),
            max_when_probes: 16,
            max_content_bytes: 1 << 20,
            ephemeral_max_age_secs: 0,
        }
    }
}

impl VatSettings {
    /// Resolves file values, then `AMP_*` environment overrides, then defaults.
    pub fn from_config(cfg: &VatConfig) -> Result<Self> {
        let defaults = Self::default();
        let here = std::env::var("AMP_HERE")
            .ok()
            .or_else(|| cfg.here.clone())
            .unwrap_or(defaults.here);
        let here = amp_protocol::normalize_peer(&here)
            .map_err(|e| anyhow!("invalid vat base url {here:?}: {e}"))?;
        Ok(Self {
            here,
            name: std::env::var("AMP_VAT_NAME")
                .ok()
                .or_else(|| cfg.name.clone())
                .unwrap_or(defaults.name),
            state_dir: std::env::var("AMP_STATE_DIR")
                .ok()
                .or_else(|| cfg.state_dir.clone())
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            retention: Retention {
                windows: env_parse("AMP_SESSION_WINDOWS")
                    .or(cfg.session_windows)
                    .unwrap_or(defaults.retention.windows)
                    .max(1),
                max_sessions: env_parse("AMP_MAX_SESSIONS")
                    .or(cfg.max_sessions)
                    .unwrap_or(defaults.retention.max_sessions)
                    .max(1),
                tombstones: env_parse("AMP_MAX_TOMBSTONES")
                    .or(cfg.max_tombstones)
                    .unwrap_or(defaults.retention.tombstones),
            },
            max_when_probes: env_parse("AMP_MAX_WHEN_PROBES")
                .or(cfg.max_when_probes)
                .unwrap_or(defaults.max_when_probes),
            max_content_bytes: env_parse("AMP_MAX_CONTENT_BYTES")
                .or(cfg.max_content_bytes)
                .unwrap_or(defaults.max_content_bytes),
            ephemeral_max_age_secs: env_parse("AMP_EPHEMERAL_MAX_AGE_SECS")
                .or(cfg.ephemeral_max_age_secs)
                .unwrap_or(defaults.ephemeral_max_age_secs),
        })
    }

    pub fn with_here(mut self, here: &str) -> Self {
        self.here = amp_protocol::normalize_peer(here).unwrap_or_else(|_| here.to_string());
        self
    }
}
