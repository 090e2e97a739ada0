//! Server configuration loading from file and environment variables.

use parley_voice::{AgentConfig, RecognitionConfig, SynthesisConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-session conversation settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Speech recognition provider.
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Conversational agent provider.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Speech synthesis provider.
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum number of concurrent voice sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Origins allowed to open a session. Empty or `*` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Hard limit on draining live sessions at shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Conversation timing and phrasing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Silence in `listening` before the caller is prompted. `0` disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Delay in `thinking` before the filler phrase. `0` disables.
    #[serde(default = "default_encouragement_delay_secs")]
    pub encouragement_delay_secs: u64,

    /// Synthetic utterance sent to the agent when the caller goes quiet.
    #[serde(default = "default_idle_prompt")]
    pub idle_prompt: String,

    /// Filler spoken while a slow reply is generated.
    #[serde(default = "default_encouragement_text")]
    pub encouragement_text: String,

    /// Audio frames queued per connection before synthesis is paced.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_max_connections() -> usize {
    100
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_encouragement_delay_secs() -> u64 {
    3
}

fn default_idle_prompt() -> String {
    "The caller has been silent for a while. Briefly check whether they are still there.".to_string()
}

fn default_encouragement_text() -> String {
    "Let me check on that for you.".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            allowed_origins: Vec::new(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            encouragement_delay_secs: default_encouragement_delay_secs(),
            idle_prompt: default_idle_prompt(),
            encouragement_text: default_encouragement_text(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_MAX_CONNECTIONS` overrides `server.max_connections`
/// - `PARLEY_ALLOWED_ORIGINS` overrides `server.allowed_origins` (comma separated)
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_STT_API_KEY`, `PARLEY_AGENT_API_KEY`, `PARLEY_TTS_API_KEY` set
///   the provider secrets
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(max) = var("PARLEY_MAX_CONNECTIONS") {
        if let Ok(parsed) = max.parse() {
            config.server.max_connections = parsed;
        }
    }
    if let Some(origins) = var("PARLEY_ALLOWED_ORIGINS") {
        config.server.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(key) = var("PARLEY_STT_API_KEY") {
        config.recognition.api_key = key;
    }
    if let Some(key) = var("PARLEY_AGENT_API_KEY") {
        config.agent.api_key = key;
    }
    if let Some(key) = var("PARLEY_TTS_API_KEY") {
        config.synthesis.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.session.idle_timeout_secs, 30);
        assert_eq!(config.synthesis.max_unit_chars, 120);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 8088
max_connections = 4
allowed_origins = ["https://support.example.com"]

[session]
idle_timeout_secs = 12
encouragement_text = "One moment."

[synthesis]
voice_id = "voice-7"

[logging]
json = true
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.max_connections, 4);
        assert_eq!(config.server.allowed_origins, vec!["https://support.example.com"]);
        assert_eq!(config.session.idle_timeout_secs, 12);
        assert_eq!(config.session.encouragement_text, "One moment.");
        assert_eq!(config.session.encouragement_delay_secs, 3);
        assert_eq!(config.synthesis.voice_id, "voice-7");
        assert!(config.logging.json);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PARLEY_PORT", "9000"),
            ("PARLEY_HOST", "0.0.0.0"),
            ("PARLEY_ALLOWED_ORIGINS", "https://a.example, https://b.example ,"),
            ("PARLEY_LOG_JSON", "1"),
            ("PARLEY_TTS_API_KEY", "secret-tts"),
            ("PARLEY_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert!(config.logging.json);
        assert_eq!(config.synthesis.api_key, "secret-tts");
        assert_eq!(config.server.max_connections, 100);
        assert!(!format!("{:?}", config.synthesis).contains("secret-tts"));
    }
}
