use crate::binding::RetryPolicy;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the platform config/data dirs
const APP_DIR: &str = "zigbee-capability-gateway";
const PROFILES_FILE: &str = "profiles.json";
const DIAGNOSTICS_FILE: &str = "diagnostics.json";

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(&key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            vars.push((key.to_string(), value.to_string()));
        }
    }
    vars
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub binding: BindingConfig,
    /// How often sessions check their polled bindings.
    pub poll_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic prefix of the radio coordinator.
    pub base_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub registry_path: PathBuf,
    pub diagnostics_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_concurrent: usize,
}

impl BindingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            storage: StorageConfig {
                registry_path: dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
                    .join(PROFILES_FILE),
                diagnostics_path: dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
                    .join(DIAGNOSTICS_FILE),
            },
            binding: BindingConfig {
                timeout_ms: 10_000,
                max_attempts: 3,
                backoff_base_ms: 1_000,
                backoff_max_ms: 30_000,
                max_concurrent: 8,
            },
            poll_tick_ms: 1_000,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "zigbee-capability-gateway".to_string(),
            username: None,
            password: None,
            base_topic: "zigbee-radio".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // MQTT configuration
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Some(base) = lookup("MQTT_BASE_TOPIC") {
            config.mqtt.base_topic = base.trim_end_matches('/').to_string();
        }

        if let Some(path) = lookup("REGISTRY_PATH") {
            config.storage.registry_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("DIAGNOSTICS_PATH") {
            config.storage.diagnostics_path = PathBuf::from(path);
        }

        // Binding policy
        if let Some(v) = lookup("BIND_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            config.binding.timeout_ms = ms;
        }
        if let Some(v) = lookup("BIND_MAX_ATTEMPTS")
            && let Ok(n) = v.parse()
        {
            config.binding.max_attempts = n;
        }
        if let Some(v) = lookup("BIND_BACKOFF_BASE_MS")
            && let Ok(ms) = v.parse()
        {
            config.binding.backoff_base_ms = ms;
        }
        if let Some(v) = lookup("BIND_BACKOFF_MAX_MS")
            && let Ok(ms) = v.parse()
        {
            config.binding.backoff_max_ms = ms;
        }
        if let Some(v) = lookup("MAX_CONCURRENT_BINDS")
            && let Ok(n) = v.parse()
        {
            config.binding.max_concurrent = n;
        }
        if let Some(v) = lookup("POLL_TICK_MS")
            && let Ok(ms) = v.parse()
        {
            config.poll_tick_ms = ms;
        }

        config
    }

    /// Reject settings the binding engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let b = &self.binding;
        if b.max_attempts == 0 {
            return Err(GatewayError::Config("BIND_MAX_ATTEMPTS must be at least 1".into()));
        }
        if b.timeout_ms == 0 {
            return Err(GatewayError::Config("BIND_TIMEOUT_MS must be positive".into()));
        }
        if b.backoff_base_ms > b.backoff_max_ms {
            return Err(GatewayError::Config(
                "BIND_BACKOFF_BASE_MS must not exceed BIND_BACKOFF_MAX_MS".into(),
            ));
        }
        if b.max_concurrent == 0 {
            return Err(GatewayError::Config("MAX_CONCURRENT_BINDS must be at least 1".into()));
        }
        if self.poll_tick_ms == 0 {
            return Err(GatewayError::Config("POLL_TICK_MS must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }
}
