use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::model::DEFAULT_USER;
use crate::stream::StreamTransport;

pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";
pub const DEFAULT_API_KEY_ENV: &str = "DIFY_API_KEY";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}
fn default_user() -> String {
    DEFAULT_USER.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderCfg {
    /// Root of the provider API, e.g. https://api.dify.ai/v1
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// User id sent when the caller does not supply one.
    #[serde(default = "default_user")]
    pub default_user: String,
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_user: default_user(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Unset by default so long
    /// streams are not cut off.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_store_path() -> String {
    ".vizier/conversations.json".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoreCfg {
    /// File holding conversation bindings between runs.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct StreamCfg {
    /// Framing used for streaming turns unless a call overrides it.
    #[serde(default)]
    pub transport: StreamTransport,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub stream: StreamCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::ChatError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::ChatError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::ChatError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<SecretString> {
        match std::env::var(&self.provider.api_key_env) {
            Ok(v) if !v.trim().is_empty() => Some(SecretString::from(v)),
            _ => {
                tracing::warn!(
                    env = %self.provider.api_key_env,
                    "provider API key is not set in environment variables"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_json_takes_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vizier.json");
        fs::write(&file, "{}").unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.provider.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.provider.api_key_env, "DIFY_API_KEY");
        assert_eq!(cfg.provider.default_user, "default-user");
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, None);
        assert_eq!(cfg.stream.transport, StreamTransport::EventStream);
    }

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vizier.json");
        let json = r#"{
          "provider": {"base_url": "http://localhost:5001/v1/", "api_key_env": "VIZIER_KEY"},
          "http": {"connect_timeout_ms": 1000, "request_timeout_ms": 90000},
          "store": {"path": "/tmp/bindings.json"},
          "stream": {"transport": "chunked"}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.provider.base_url, "http://localhost:5001/v1/");
        assert_eq!(cfg.provider.default_user, "default-user");
        assert_eq!(cfg.http.request_timeout_ms, Some(90_000));
        assert_eq!(cfg.store.path, "/tmp/bindings.json");
        assert_eq!(cfg.stream.transport, StreamTransport::Chunked);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vizier.toml");
        let toml = r#"
[provider]
base_url = "https://dify.internal/v1"
default_user = "kiosk-7"

[stream]
transport = "event_stream"
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.provider.base_url, "https://dify.internal/v1");
        assert_eq!(cfg.provider.default_user, "kiosk-7");
        assert_eq!(cfg.http, HttpCfg::default());
        assert_eq!(cfg.store, StoreCfg::default());
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/vizier-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            crate::error::ChatError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_json_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{ "provider": { "base_url": 123 "#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        assert!(matches!(err, crate::error::ChatError::Other(_)));
    }

    #[test]
    fn unknown_extension_falls_back_to_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vizier.conf");
        fs::write(&file, "[store]\npath = \"b.json\"\n").unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.store.path, "b.json");
    }

    #[test]
    fn api_key_reads_configured_env() {
        let mut cfg = Config::default();
        cfg.provider.api_key_env = "VIZIER_TEST_KEY_PRESENT".into();
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("VIZIER_TEST_KEY_PRESENT", "app-123") };
        let key = cfg.api_key().expect("key");
        assert_eq!(key.expose_secret(), "app-123");

        cfg.provider.api_key_env = "VIZIER_TEST_KEY_ABSENT".into();
        assert!(cfg.api_key().is_none());
    }
}
