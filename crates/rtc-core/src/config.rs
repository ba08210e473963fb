use crate::dispatch::{BASE_URL_TOKEN, EVENT_NAME_TOKEN, INSTANCE_ID_TOKEN};
use crate::error::{Result, RtcError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// OrchestrationConfig
// ---------------------------------------------------------------------------

/// Retry/timeout policy applied to every orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Forwarded to the external service; the engine never reads it.
    #[serde(default = "default_error_likelihood")]
    pub error_response_likelihood_percentage: u8,
    #[serde(default = "default_timeout_limit")]
    pub timeout_limit_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_error_likelihood() -> u8 {
    50
}

fn default_timeout_limit() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            error_response_likelihood_percentage: default_error_likelihood(),
            timeout_limit_seconds: default_timeout_limit(),
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Endpoint of the external job service.
    #[serde(default = "default_job_url")]
    pub job_url: String,
    /// How long the external service is asked to wait before calling back.
    #[serde(default = "default_callback_after_ms")]
    pub callback_after_ms: u64,
    /// How long the external service is asked to stall before answering the
    /// dispatch itself.
    #[serde(default)]
    pub respond_after_ms: u64,
}

fn default_job_url() -> String {
    "http://localhost:5000/api/job".to_string()
}

fn default_callback_after_ms() -> u64 {
    3000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            job_url: default_job_url(),
            callback_after_ms: default_callback_after_ms(),
            respond_after_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL, substituted for `{baseUrl}`.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_callback_url_template")]
    pub callback_url_template: String,
}

fn default_port() -> u16 {
    7071
}

fn default_public_base_url() -> String {
    "http://localhost:7071".to_string()
}

fn default_callback_url_template() -> String {
    "{baseUrl}/api/orchestrations/{instanceId}/events/{eventName}".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_base_url: default_public_base_url(),
            callback_url_template: default_callback_url_template(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_STORE_FILE)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load `rtc.yaml` from `root`. A missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        paths::store_path(root, &self.store.path)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let error = |message: String| ConfigWarning {
            level: WarnLevel::Error,
            message,
        };
        let warning = |message: String| ConfigWarning {
            level: WarnLevel::Warning,
            message,
        };

        let orch = &self.orchestration;
        if orch.max_attempts == 0 {
            warnings.push(error(
                "orchestration.max_attempts must be at least 1".to_string(),
            ));
        } else if orch.max_attempts > 20 {
            warnings.push(warning(format!(
                "orchestration.max_attempts={} (>20 is unusual)",
                orch.max_attempts
            )));
        }

        if orch.timeout_limit_seconds == 0 {
            warnings.push(error(
                "orchestration.timeout_limit_seconds must be greater than 0".to_string(),
            ));
        }

        if orch.error_response_likelihood_percentage > 100 {
            warnings.push(error(format!(
                "orchestration.error_response_likelihood_percentage={} is not a percentage",
                orch.error_response_likelihood_percentage
            )));
        }

        if !is_http_url(&self.dispatch.job_url) {
            warnings.push(error(format!(
                "dispatch.job_url '{}' must be an http(s) URL",
                self.dispatch.job_url
            )));
        }

        if self.dispatch.callback_after_ms >= orch.timeout_limit_seconds.saturating_mul(1000)
            && orch.timeout_limit_seconds > 0
        {
            warnings.push(warning(format!(
                "dispatch.callback_after_ms={} is not below the {}s timeout; every attempt will time out",
                self.dispatch.callback_after_ms, orch.timeout_limit_seconds
            )));
        }

        if self.dispatch.respond_after_ms >= orch.timeout_limit_seconds.saturating_mul(1000)
            && orch.timeout_limit_seconds > 0
        {
            warnings.push(warning(format!(
                "dispatch.respond_after_ms={} is not below the {}s timeout; the job service will look unresponsive",
                self.dispatch.respond_after_ms, orch.timeout_limit_seconds
            )));
        }

        let template = &self.server.callback_url_template;
        if !template.contains(INSTANCE_ID_TOKEN) {
            warnings.push(error(format!(
                "server.callback_url_template must contain {INSTANCE_ID_TOKEN}"
            )));
        }
        if !template.contains(EVENT_NAME_TOKEN) {
            warnings.push(warning(format!(
                "server.callback_url_template has no {EVENT_NAME_TOKEN} token"
            )));
        }
        if template.contains(BASE_URL_TOKEN) && !is_http_url(&self.server.public_base_url) {
            warnings.push(error(format!(
                "server.public_base_url '{}' must be an http(s) URL",
                self.server.public_base_url
            )));
        }

        if self.store.path.as_os_str().is_empty() {
            warnings.push(error("store.path must not be empty".to_string()));
        }

        warnings
    }

    /// Fail with `InvalidConfig` when any `Error`-level warning is present.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RtcError::InvalidConfig(errors.join("; ")))
        }
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        cfg.ensure_valid().unwrap();
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.orchestration.max_attempts = 5;
        cfg.orchestration.timeout_limit_seconds = 12;
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.orchestration.max_attempts, 5);
        assert_eq!(loaded.orchestration.timeout_limit_seconds, 12);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("rtc.yaml"),
            "orchestration:\n  max_attempts: 7\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.orchestration.max_attempts, 7);
        assert_eq!(cfg.orchestration.timeout_limit_seconds, 30);
        assert_eq!(cfg.server.port, 7071);
    }

    #[test]
    fn zero_max_attempts_is_an_error() {
        let mut cfg = Config::default();
        cfg.orchestration.max_attempts = 0;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("max_attempts")));
        assert!(matches!(
            cfg.ensure_valid(),
            Err(RtcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn likelihood_over_100_is_an_error() {
        let mut cfg = Config::default();
        cfg.orchestration.error_response_likelihood_percentage = 101;
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn template_without_instance_token_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.callback_url_template = "{baseUrl}/callback/{eventName}".into();
        let err = cfg.ensure_valid().unwrap_err();
        assert!(err.to_string().contains("{instanceId}"), "{err}");
    }

    #[test]
    fn large_max_attempts_is_only_a_warning() {
        let mut cfg = Config::default();
        cfg.orchestration.max_attempts = 50;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains(">20 is unusual")));
        cfg.ensure_valid().unwrap();
    }

    #[test]
    fn callback_delay_longer_than_timeout_warns() {
        let mut cfg = Config::default();
        cfg.orchestration.timeout_limit_seconds = 2;
        cfg.dispatch.callback_after_ms = 5000;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("every attempt will time out")));
    }

    #[test]
    fn respond_delay_defaults_to_zero_and_parses() {
        assert_eq!(Config::default().dispatch.respond_after_ms, 0);
        let cfg: Config =
            serde_yaml::from_str("dispatch:\n  respond_after_ms: 3000\n").unwrap();
        assert_eq!(cfg.dispatch.respond_after_ms, 3000);
        assert_eq!(cfg.dispatch.callback_after_ms, 3000);
        assert!(cfg
            .validate()
            .iter()
            .all(|w| !w.message.contains("respond_after_ms")));
    }
}
