//! Configuration loading and validation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialogue::DialogueLimits;
use crate::protocol::SessionMode;

/// Top-level Voxflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub dialogue: DialogueConfig,

    #[serde(default)]
    pub engines: EnginesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint path.
    #[serde(default = "default_ws_path")]
    pub path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8770
}

fn default_ws_path() -> String {
    "/ws".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_ws_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Concurrent WebSocket connection cap.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on one inbound frame, envelope included.
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// Heartbeat ping period in seconds.
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    /// How long to wait for any inbound traffic (pong included) before the
    /// connection is considered dead.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    /// Outbound write deadline in seconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
}

fn default_max_connections() -> usize {
    100
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_ping_period() -> u64 {
    30
}

fn default_pong_wait() -> u64 {
    60
}

fn default_write_wait() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            ping_period_secs: default_ping_period(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
        }
    }
}

impl TransportConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    /// Idle seconds before a session is evicted.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Accumulation-buffer hi-watermark in bytes; reaching it flushes the
    /// buffer into the pipeline.
    #[serde(default = "default_audio_buffer_size")]
    pub audio_buffer_size: usize,

    #[serde(default)]
    pub default_mode: SessionMode,

    /// Feature gate for interruption. When false, both the `interrupt`
    /// command and audio-triggered interruption are refused.
    #[serde(default = "default_true")]
    pub enable_interrupt: bool,
}

fn default_max_sessions() -> usize {
    50
}

fn default_session_timeout() -> u64 {
    300
}

fn default_audio_buffer_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            audio_buffer_size: default_audio_buffer_size(),
            default_mode: SessionMode::default(),
            enable_interrupt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,

    /// Approximate token budget per conversation.
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_history_turns() -> usize {
    20
}

fn default_max_context_length() -> usize {
    4096
}

fn default_max_conversations() -> usize {
    100
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
            max_context_length: default_max_context_length(),
            max_conversations: default_max_conversations(),
            system_prompt: None,
        }
    }
}

impl DialogueConfig {
    pub fn limits(&self) -> DialogueLimits {
        DialogueLimits {
            max_history_turns: self.max_history_turns,
            max_context_length: self.max_context_length,
            max_conversations: self.max_conversations,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub asr: EngineSettings,

    #[serde(default)]
    pub llm: EngineSettings,

    #[serde(default)]
    pub tts: EngineSettings,
}

/// Settings for one engine slot. `options` is the provider-specific block;
/// the selected adapter consumes the keys it recognizes and warns about the
/// rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Per-call timeout for this engine, in seconds.
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

fn default_provider() -> String {
    "mock".into()
}

fn default_engine_timeout() -> u64 {
    30
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            api_key_env: None,
            base_url: None,
            timeout_secs: default_engine_timeout(),
            options: HashMap::new(),
        }
    }
}

impl EngineSettings {
    /// Resolve the API key: direct value first, then the env-var reference.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// String-valued provider option, if set.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Integer-valued provider option, if set.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }

    /// Warn about option keys the selected adapter does not consume.
    pub fn warn_unknown_options(&self, recognized: &[&str]) {
        for key in self.options.keys() {
            if !recognized.contains(&key.as_str()) {
                tracing::warn!(
                    provider = %self.provider,
                    option = %key,
                    "Ignoring unrecognized engine option"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level override (trace/debug/info/warn/error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Per-crate log level overrides (e.g. "voxflow_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "plain".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            filters: Vec::new(),
        }
    }
}

/// Resolve a secret. An explicit value wins over its env-var indirection;
/// blank values count as unset.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    direct
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            env_var
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
        })
        .filter(|v| !v.is_empty())
}

/// Expand `${ENV_VAR}` references in the raw config text. An unset variable
/// expands to the empty string, with a warning so a typoed name shows up in
/// the logs instead of silently blanking a field.
fn interpolate_env(raw: &str) -> String {
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    let mut out = String::with_capacity(raw.len());
    let mut cursor = 0;
    for caps in pattern.captures_iter(raw) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&raw[cursor..whole.start()]);
        cursor = whole.end();

        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                tracing::warn!(var = name, "Config references an unset environment variable");
            }
        }
    }
    out.push_str(&raw[cursor..]);
    out
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = interpolate_env(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port cannot be 0".into());
        }
        if !self.server.path.starts_with('/') {
            errors.push(format!("server.path must start with '/': {}", self.server.path));
        }
        if self.session.max_concurrent_sessions == 0 {
            errors.push("session.max_concurrent_sessions cannot be 0".into());
        }
        if self.session.audio_buffer_size == 0 {
            errors.push("session.audio_buffer_size cannot be 0".into());
        }
        if self.transport.pong_wait_secs <= self.transport.ping_period_secs {
            warnings.push(format!(
                "transport.pong_wait_secs ({}) should exceed ping_period_secs ({})",
                self.transport.pong_wait_secs, self.transport.ping_period_secs
            ));
        }

        for (kind, settings) in [
            ("asr", &self.engines.asr),
            ("llm", &self.engines.llm),
            ("tts", &self.engines.tts),
        ] {
            if settings.provider != "mock"
                && settings.provider != "ollama"
                && settings.resolve_api_key().is_none()
            {
                warnings.push(format!(
                    "engines.{kind} provider '{}' has no API key configured",
                    settings.provider
                ));
            }
        }

        (warnings, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8770);
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.session.max_concurrent_sessions, 50);
        assert!(config.session.enable_interrupt);
        assert_eq!(config.dialogue.max_history_turns, 20);
        assert_eq!(config.engines.llm.provider, "mock");
        assert_eq!(config.engines.llm.timeout_secs, 30);
    }

    #[test]
    fn env_interpolation() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("VOXFLOW_TEST_KEY", "sk-test-123") };
        let input = r#"{"key": "${VOXFLOW_TEST_KEY}", "other": "plain"}"#;
        let result = interpolate_env(input);
        assert_eq!(result, r#"{"key": "sk-test-123", "other": "plain"}"#);
        unsafe { std::env::remove_var("VOXFLOW_TEST_KEY") };
    }

    #[test]
    fn env_interpolation_unset_var_expands_empty() {
        let input = r#"{"key": "${VOXFLOW_NONEXISTENT_VAR}"}"#;
        assert_eq!(interpolate_env(input), r#"{"key": ""}"#);
    }

    #[test]
    fn env_interpolation_leaves_non_references_alone() {
        let input = r#"{"a": "$HOME", "b": "${not-a-var}", "c": "100%"}"#;
        assert_eq!(interpolate_env(input), input);
    }

    #[test]
    fn engine_settings_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("VOXFLOW_TEST_API_KEY", "from-env") };
        let settings = EngineSettings {
            api_key_env: Some("VOXFLOW_TEST_API_KEY".into()),
            ..EngineSettings::default()
        };
        assert_eq!(settings.resolve_api_key(), Some("from-env".into()));

        let direct = EngineSettings {
            api_key: Some("direct-key".into()),
            api_key_env: Some("VOXFLOW_TEST_API_KEY".into()),
            ..EngineSettings::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("VOXFLOW_TEST_API_KEY") };
    }

    #[test]
    fn json5_parse() {
        let raw = r#"{
            // voxflow dev config
            server: { port: 9000 },
            session: { max_concurrent_sessions: 2, default_mode: "continuous" },
            engines: {
                llm: { provider: "openai", model: "gpt-4o-mini", options: { temperature: 0.7 } },
            },
        }"#;
        let config: Config = json5::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.session.max_concurrent_sessions, 2);
        assert_eq!(config.session.default_mode, SessionMode::Continuous);
        assert_eq!(config.engines.llm.provider, "openai");
        assert_eq!(config.engines.llm.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut config = Config::default();
        config.server.port = 0;
        config.session.audio_buffer_size = 0;
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn validate_warns_on_missing_api_key() {
        let mut config = Config::default();
        config.engines.llm.provider = "openai".into();
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("engines.llm")));
    }

    #[test]
    fn validate_warns_on_short_pong_wait() {
        let mut config = Config::default();
        config.transport.pong_wait_secs = 10;
        config.transport.ping_period_secs = 30;
        let (warnings, _errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("pong_wait")));
    }
}
