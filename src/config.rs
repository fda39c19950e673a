use crate::error::TunnelError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs};

#[derive(Clone)]
pub struct Config {
    /// Parent zone the controller is authoritative for.
    pub parent: String,
    /// Explicit resolver endpoints (host or host:port). Empty means use the
    /// platform's nameservers.
    pub resolvers: Vec<String>,
    /// Controller's long-term X25519 public key, base64.
    pub controller_public_key: String,
    /// Shared TOTP secret, base64.
    pub totp_secret: String,
    pub retry_wait_ms: u64,
    pub retry_count: usize,
    pub query_timeout_ms: u64,
    /// Never negotiate the case-sensitive alphabet.
    pub force_base32: bool,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    parent: String,
    #[serde(default)]
    resolvers: Vec<String>,
    controller_public_key: String,
    totp_secret: String,
    #[serde(default = "default_retry_wait_ms")]
    retry_wait_ms: u64,
    #[serde(default = "default_retry_count")]
    retry_count: usize,
    #[serde(default = "default_query_timeout_ms")]
    query_timeout_ms: u64,
    #[serde(default)]
    force_base32: bool,
}

static EMBEDDED: Lazy<Config> = Lazy::new(|| Config {
    parent: "c2.example.com".to_string(),
    resolvers: vec![],
    // 32 zero bytes; operators must bake in the real controller key.
    controller_public_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
    totp_secret: "Y2hhbmdlLW1l".to_string(),
    retry_wait_ms: default_retry_wait_ms(),
    retry_count: default_retry_count(),
    query_timeout_ms: default_query_timeout_ms(),
    force_base32: false,
});

static RUNTIME: OnceCell<Config> = OnceCell::new();

impl Config {
    pub fn load() -> Self {
        if let Some(cfg) = RUNTIME.get() {
            return cfg.clone();
        }

        let cfg = load_runtime_config().unwrap_or_else(|| EMBEDDED.clone());
        let _ = RUNTIME.set(cfg.clone());
        cfg
    }

    pub fn from_file(path: &str) -> Result<Self, String> {
        let data =
            fs::read_to_string(path).map_err(|e| format!("failed to read config {path}: {e}"))?;
        Self::from_json(&data)
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let parsed: FileConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid config json: {e}"))?;
        Ok(parsed.into())
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn controller_key(&self) -> Result<[u8; 32], TunnelError> {
        let decoded = BASE64
            .decode(&self.controller_public_key)
            .map_err(|e| TunnelError::Config(format!("controller key is not base64: {e}")))?;
        decoded
            .try_into()
            .map_err(|_| TunnelError::Config("controller key must be 32 bytes".to_string()))
    }

    pub fn totp_secret_bytes(&self) -> Result<Vec<u8>, TunnelError> {
        BASE64
            .decode(&self.totp_secret)
            .map_err(|e| TunnelError::Config(format!("totp secret is not base64: {e}")))
    }
}

fn load_runtime_config() -> Option<Config> {
    if let Ok(path) = env::var("BURROW_CONFIG_PATH") {
        match Config::from_file(&path) {
            Ok(cfg) => return Some(cfg),
            Err(err) => eprintln!("[burrow] {err}"),
        }
    }

    if let Ok(json) = env::var("BURROW_CONFIG_JSON") {
        match Config::from_json(&json) {
            Ok(cfg) => return Some(cfg),
            Err(err) => eprintln!("[burrow] {err}"),
        }
    }

    None
}

impl From<FileConfig> for Config {
    fn from(value: FileConfig) -> Self {
        Config {
            parent: value.parent,
            resolvers: value.resolvers,
            controller_public_key: value.controller_public_key,
            totp_secret: value.totp_secret,
            retry_wait_ms: value.retry_wait_ms,
            retry_count: value.retry_count,
            query_timeout_ms: value.query_timeout_ms,
            force_base32: value.force_base32,
        }
    }
}

const fn default_retry_wait_ms() -> u64 {
    1000
}

const fn default_retry_count() -> usize {
    3
}

const fn default_query_timeout_ms() -> u64 {
    3000
}
