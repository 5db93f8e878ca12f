//! Zelana Coordinator Configuration
//!
//! Handles loading configuration from:
//! 1. ZL_COORDINATOR_CONFIG env var (explicit path)
//! 2. ./coordinator.toml (current directory)
//! 3. ~/.zelana/coordinator.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs};

const CONFIG_FILE_NAME: &str = "coordinator.toml";
const CONFIG_DIR_NAME: &str = ".zelana";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8390";
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PING_INTERVAL_SECS: u64 = 54;
const DEFAULT_PONG_WAIT_SECS: u64 = 60;
const DEFAULT_MAX_FRAME_BYTES: usize = 150 * 1024 * 1024;
const DEFAULT_AUTH_MAX_AGE_SECS: u64 = 300;

const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 3000;
const DEFAULT_COLLECTION_TIME_SECS: u64 = 180 * 60;
const DEFAULT_WORKER_CHANNEL_CAPACITY: usize = 4;
const DEFAULT_RECONNECT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_MAX_FAILED_SESSIONS: usize = 1024;

const DEFAULT_VERIFIER_TIMEOUT_SECS: u64 = 120;

const DEFAULT_DB_PATH: &str = "./coordinator-db";

const DEFAULT_API_HOST: &str = "127.0.0.1";
const DEFAULT_DEBUG_PORT: u16 = 8391;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub manager: ManagerTomlConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Worker-facing TCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Register envelopes whose timestamp is further than this from the
    /// coordinator clock are refused.
    #[serde(default = "default_auth_max_age")]
    pub auth_max_age_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            pong_wait_secs: DEFAULT_PONG_WAIT_SECS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            auth_max_age_secs: DEFAULT_AUTH_MAX_AGE_SECS,
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.into()
}
fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}
fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_SECS
}
fn default_pong_wait() -> u64 {
    DEFAULT_PONG_WAIT_SECS
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_auth_max_age() -> u64 {
    DEFAULT_AUTH_MAX_AGE_SECS
}

/// Order in which unassigned tasks are pulled from the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSession {
    #[default]
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl FromStr for OrderSession {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" => Ok(OrderSession::Asc),
            "DESC" => Ok(OrderSession::Desc),
            other => bail!("order_session must be ASC or DESC, got {other}"),
        }
    }
}

impl fmt::Display for OrderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSession::Asc => f.write_str("ASC"),
            OrderSession::Desc => f.write_str("DESC"),
        }
    }
}

/// Session manager configuration (TOML format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerTomlConfig {
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_collection_time")]
    pub collection_time_secs: u64,
    #[serde(default)]
    pub order_session: OrderSession,
    #[serde(default = "default_worker_channel_capacity")]
    pub worker_channel_capacity: usize,
    #[serde(default = "default_reconnect_cooldown")]
    pub reconnect_cooldown_secs: u64,
    #[serde(default = "default_max_failed_sessions")]
    pub max_failed_sessions: usize,
}

impl Default for ManagerTomlConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            collection_time_secs: DEFAULT_COLLECTION_TIME_SECS,
            order_session: OrderSession::Asc,
            worker_channel_capacity: DEFAULT_WORKER_CHANNEL_CAPACITY,
            reconnect_cooldown_secs: DEFAULT_RECONNECT_COOLDOWN_SECS,
            max_failed_sessions: DEFAULT_MAX_FAILED_SESSIONS,
        }
    }
}

fn default_dispatch_interval() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_MS
}
fn default_collection_time() -> u64 {
    DEFAULT_COLLECTION_TIME_SECS
}
fn default_worker_channel_capacity() -> usize {
    DEFAULT_WORKER_CHANNEL_CAPACITY
}
fn default_reconnect_cooldown() -> u64 {
    DEFAULT_RECONNECT_COOLDOWN_SECS
}
fn default_max_failed_sessions() -> usize {
    DEFAULT_MAX_FAILED_SESSIONS
}

/// Proof verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_true")]
    pub mock_mode: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_verifier_timeout")]
    pub timeout_secs: Option<u64>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            mock_mode: true,
            endpoint: None,
            timeout_secs: Some(DEFAULT_VERIFIER_TIMEOUT_SECS),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_verifier_timeout() -> Option<u64> {
    Some(DEFAULT_VERIFIER_TIMEOUT_SECS)
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_DB_PATH.into(),
            in_memory: false,
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.into()
}

/// Debug HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_API_HOST.into(),
            debug_port: DEFAULT_DEBUG_PORT,
            enabled: true,
        }
    }
}

fn default_api_host() -> String {
    DEFAULT_API_HOST.into()
}
fn default_debug_port() -> u16 {
    DEFAULT_DEBUG_PORT
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set Option<String> from env var if present
fn env_option_string(key: &str, field: &mut Option<String>) {
    if let Ok(v) = env::var(key) {
        *field = Some(v);
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Set Option<T> from env var if present and parseable
fn env_parse_option<T: FromStr>(key: &str, field: &mut Option<T>) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = Some(parsed);
        }
    }
}

/// Check if env var is set to a truthy value ("1" or "true")
fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

// ============================================================================
// Implementation
// ============================================================================

impl CoordinatorConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                tracing::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("ZL_COORDINATOR_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        Self::default_config_path().filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        env_string("ZL_LISTEN_ADDR", &mut self.server.listen_addr);
        env_parse(
            "ZL_HANDSHAKE_TIMEOUT_SECS",
            &mut self.server.handshake_timeout_secs,
        );
        env_parse("ZL_AUTH_MAX_AGE_SECS", &mut self.server.auth_max_age_secs);

        // Manager
        env_parse(
            "ZL_DISPATCH_INTERVAL_MS",
            &mut self.manager.dispatch_interval_ms,
        );
        env_parse(
            "ZL_COLLECTION_TIME_SECS",
            &mut self.manager.collection_time_secs,
        );
        env_parse("ZL_ORDER_SESSION", &mut self.manager.order_session);
        env_parse(
            "ZL_RECONNECT_COOLDOWN_SECS",
            &mut self.manager.reconnect_cooldown_secs,
        );

        // Verifier
        if let Some(v) = env_bool("ZL_VERIFIER_MOCK") {
            self.verifier.mock_mode = v;
        }
        env_option_string("ZL_VERIFIER_ENDPOINT", &mut self.verifier.endpoint);
        env_parse_option("ZL_VERIFIER_TIMEOUT_SECS", &mut self.verifier.timeout_secs);

        // Database
        env_string("ZL_DB_PATH", &mut self.database.path);
        if let Some(v) = env_bool("ZL_DB_IN_MEMORY") {
            self.database.in_memory = v;
        }

        // API
        env_string("ZL_API_HOST", &mut self.api.host);
        env_parse("ZL_DEBUG_PORT", &mut self.api.debug_port);
        if let Some(v) = env_bool("ZL_API_ENABLED") {
            self.api.enabled = v;
        }
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.verifier.endpoint = Some("http://127.0.0.1:8555".into());
        toml::to_string_pretty(&sample).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.server.max_frame_bytes, 157_286_400);
        assert_eq!(config.manager.collection_time_secs, 10_800);
        assert_eq!(config.manager.order_session, OrderSession::Asc);
        assert_eq!(config.manager.worker_channel_capacity, 4);
        assert!(config.verifier.mock_mode);
        assert_eq!(config.verifier.timeout_secs, Some(120));
        assert!(!config.database.in_memory);
    }

    #[test]
    fn test_generate_sample() {
        let sample = CoordinatorConfig::generate_sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[manager]"));
        assert!(sample.contains("[verifier]"));
        assert!(sample.contains("[database]"));
        assert!(sample.contains("[api]"));
        assert!(sample.contains("order_session = \"ASC\""));
    }

    #[test]
    fn test_parse_sample() {
        let sample = CoordinatorConfig::generate_sample();
        let parsed: CoordinatorConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.api.debug_port, DEFAULT_DEBUG_PORT);
        assert_eq!(
            parsed.verifier.endpoint.as_deref(),
            Some("http://127.0.0.1:8555")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: CoordinatorConfig = toml::from_str(
            r#"
            [manager]
            order_session = "DESC"
            collection_time_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(parsed.manager.order_session, OrderSession::Desc);
        assert_eq!(parsed.manager.collection_time_secs, 30);
        assert_eq!(parsed.manager.dispatch_interval_ms, DEFAULT_DISPATCH_INTERVAL_MS);
        assert_eq!(parsed.server.pong_wait_secs, DEFAULT_PONG_WAIT_SECS);
    }

    #[test]
    fn test_bad_order_session_is_rejected() {
        assert!(toml::from_str::<CoordinatorConfig>("[manager]\norder_session = \"up\"").is_err());
        assert_eq!("desc".parse::<OrderSession>().unwrap(), OrderSession::Desc);
        assert!("sideways".parse::<OrderSession>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[database]\nin_memory = true\n").unwrap();

        let config = CoordinatorConfig::load_from(&path).unwrap();
        assert_eq!(config.server.handshake_timeout_secs, DEFAULT_HANDSHAKE_TIMEOUT_SECS);
        assert!(CoordinatorConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }
}
