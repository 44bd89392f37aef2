//! Configuration module for the tutoring client
//!
//! Settings come from YAML files, environment variables and `.env` files.
//! Priority: YAML > ENV vars > .env values > defaults. The `.env` file is loaded
//! into the process environment by the binary at startup, so from here on it is
//! indistinguishable from real environment variables.
//!
//! # Example
//! ```rust,no_run
//! use tutor_live::config::TutorConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = TutorConfig::from_env()?;
//!
//! // Load from a YAML file with environment variable base
//! let config = TutorConfig::from_file(Path::new("tutor.yaml"))?;
//!
//! println!("Connecting to {}", config.endpoint);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

mod yaml;

pub use yaml::{AudioYaml, PersistenceYaml, ReconnectionYaml, SessionYaml, TutorYaml, YamlConfig};

use crate::core::audio::AudioConfig;
use crate::core::transport::{
    DEFAULT_CHANNEL_CAPACITY, HandshakeMode, ReconnectionConfig, TransportConfig,
};
use crate::errors::{TutorError, TutorResult};
use crate::session::{
    DEFAULT_OPENING_TURN, DEFAULT_PERSISTENCE_TIMEOUT, DEFAULT_SUMMARY_GRACE,
    DEFAULT_WRAP_UP_PROMPT, HttpPersistence, SessionSettings,
};

/// Prefix shared by every environment variable this crate reads.
pub const ENV_PREFIX: &str = "TUTOR_";

/// Client configuration
///
/// Covers the tutor endpoint and how to reach it, audio formats, session
/// behaviour and the optional persistence service.
#[derive(Debug, Clone, PartialEq)]
pub struct TutorConfig {
    // Tutor endpoint
    pub endpoint: String,
    pub api_key: Option<String>,
    pub handshake_mode: HandshakeMode,
    pub reconnection: ReconnectionConfig,
    pub channel_capacity: usize,

    // Audio
    pub audio: AudioConfig,

    // Session
    pub summary_grace_secs: u64,
    pub opening_turn: String,
    pub wrap_up_prompt: String,

    // Persistence service (disabled when no URL is set)
    pub persistence_url: Option<String>,
    pub persistence_api_key: Option<String>,
    pub user_id: Option<String>,
    pub lesson_id: Option<String>,
    pub persistence_timeout_secs: u64,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            handshake_mode: HandshakeMode::default(),
            reconnection: ReconnectionConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            audio: AudioConfig::default(),
            summary_grace_secs: DEFAULT_SUMMARY_GRACE.as_secs(),
            opening_turn: DEFAULT_OPENING_TURN.to_string(),
            wrap_up_prompt: DEFAULT_WRAP_UP_PROMPT.to_string(),
            persistence_url: None,
            persistence_api_key: None,
            user_id: None,
            lesson_id: None,
            persistence_timeout_secs: DEFAULT_PERSISTENCE_TIMEOUT.as_secs(),
        }
    }
}

impl TutorConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables fall back to defaults. The result is validated.
    pub fn from_env() -> TutorResult<Self> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or is malformed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &Path) -> TutorResult<Self> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.apply_yaml(yaml);
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `lookup`, which maps a variable name such as
    /// `TUTOR_ENDPOINT` to its value. Not validated.
    pub fn from_lookup<F>(lookup: F) -> TutorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        Ok(Self {
            endpoint: env.string("ENDPOINT").unwrap_or(defaults.endpoint),
            api_key: env.string("API_KEY"),
            handshake_mode: env
                .parse("HANDSHAKE_MODE")?
                .unwrap_or(defaults.handshake_mode),
            reconnection: ReconnectionConfig {
                enabled: env
                    .flag("RECONNECT_ENABLED")?
                    .unwrap_or(defaults.reconnection.enabled),
                max_attempts: env
                    .parse("RECONNECT_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.reconnection.max_attempts),
                base_delay_ms: env
                    .parse("RECONNECT_BASE_DELAY_MS")?
                    .unwrap_or(defaults.reconnection.base_delay_ms),
            },
            channel_capacity: env
                .parse("CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            audio: AudioConfig {
                input_sample_rate: env
                    .parse("INPUT_SAMPLE_RATE")?
                    .unwrap_or(defaults.audio.input_sample_rate),
                output_sample_rate: env
                    .parse("OUTPUT_SAMPLE_RATE")?
                    .unwrap_or(defaults.audio.output_sample_rate),
                chunk_duration_ms: env
                    .parse("CHUNK_DURATION_MS")?
                    .unwrap_or(defaults.audio.chunk_duration_ms),
            },
            summary_grace_secs: env
                .parse("SUMMARY_GRACE_SECS")?
                .unwrap_or(defaults.summary_grace_secs),
            opening_turn: env.string("OPENING_TURN").unwrap_or(defaults.opening_turn),
            wrap_up_prompt: env
                .string("WRAP_UP_PROMPT")
                .unwrap_or(defaults.wrap_up_prompt),
            persistence_url: env.string("PERSISTENCE_URL"),
            persistence_api_key: env.string("PERSISTENCE_API_KEY"),
            user_id: env.string("USER_ID"),
            lesson_id: env.string("LESSON_ID"),
            persistence_timeout_secs: env
                .parse("PERSISTENCE_TIMEOUT_SECS")?
                .unwrap_or(defaults.persistence_timeout_secs),
        })
    }

    /// Override fields with every value the YAML file sets.
    pub fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(tutor) = yaml.tutor {
            override_with(&mut self.endpoint, tutor.endpoint);
            override_option(&mut self.api_key, tutor.api_key);
            override_with(&mut self.handshake_mode, tutor.handshake_mode);
        }
        if let Some(reconnection) = yaml.reconnection {
            override_with(&mut self.reconnection.enabled, reconnection.enabled);
            override_with(&mut self.reconnection.max_attempts, reconnection.max_attempts);
            override_with(&mut self.reconnection.base_delay_ms, reconnection.base_delay_ms);
        }
        if let Some(audio) = yaml.audio {
            override_with(&mut self.audio.input_sample_rate, audio.input_sample_rate);
            override_with(&mut self.audio.output_sample_rate, audio.output_sample_rate);
            override_with(&mut self.audio.chunk_duration_ms, audio.chunk_duration_ms);
        }
        if let Some(session) = yaml.session {
            override_with(&mut self.summary_grace_secs, session.summary_grace_secs);
            override_with(&mut self.opening_turn, session.opening_turn);
            override_with(&mut self.wrap_up_prompt, session.wrap_up_prompt);
            override_with(&mut self.channel_capacity, session.channel_capacity);
        }
        if let Some(persistence) = yaml.persistence {
            override_option(&mut self.persistence_url, persistence.url);
            override_option(&mut self.persistence_api_key, persistence.api_key);
            override_option(&mut self.user_id, persistence.user_id);
            override_option(&mut self.lesson_id, persistence.lesson_id);
            override_with(&mut self.persistence_timeout_secs, persistence.timeout_secs);
        }
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> TutorResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(invalid("endpoint is required (set TUTOR_ENDPOINT)"));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| invalid(format!("invalid endpoint '{}': {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!(
                "endpoint must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(invalid("sample rates must be greater than zero"));
        }
        if self.audio.chunk_duration_ms == 0 {
            return Err(invalid("chunk duration must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel capacity must be greater than zero"));
        }
        if let Some(persistence_url) = &self.persistence_url {
            let url = Url::parse(persistence_url)
                .map_err(|e| invalid(format!("invalid persistence url '{persistence_url}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid("persistence url must use http:// or https://"));
            }
        }
        Ok(())
    }

    /// Settings for the websocket transport.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            handshake_mode: self.handshake_mode,
            reconnection: self.reconnection.clone(),
            channel_capacity: self.channel_capacity,
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
        }
    }

    /// Settings for the session orchestrator.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            audio: self.audio,
            summary_grace: Duration::from_secs(self.summary_grace_secs),
            opening_turn: self.opening_turn.clone(),
            wrap_up_prompt: self.wrap_up_prompt.clone(),
        }
    }

    /// HTTP persistence client, or `None` when no persistence URL is set.
    pub fn persistence_client(&self) -> TutorResult<Option<HttpPersistence>> {
        let Some(base_url) = &self.persistence_url else {
            return Ok(None);
        };
        let mut client = HttpPersistence::new(base_url)?
            .with_timeout(Duration::from_secs(self.persistence_timeout_secs));
        if let Some(api_key) = &self.persistence_api_key {
            client = client.with_api_key(api_key.clone());
        }
        if let Some(user_id) = &self.user_id {
            client = client.with_user(user_id.clone());
        }
        if let Some(lesson_id) = &self.lesson_id {
            client = client.with_lesson(lesson_id.clone());
        }
        Ok(Some(client))
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str) -> TutorResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|value| {
                value.parse::<T>().map_err(|e| {
                    invalid(format!("invalid value for {ENV_PREFIX}{name} '{value}': {e}"))
                })
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> TutorResult<Option<bool>> {
        self.string(name)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(format!(
                    "invalid value for {ENV_PREFIX}{name} '{value}': expected true or false"
                ))),
            })
            .transpose()
    }
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn override_option<T>(field: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *field = value;
    }
}

fn invalid(message: impl Into<String>) -> TutorError {
    TutorError::InvalidConfiguration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn valid() -> TutorConfig {
        TutorConfig {
            endpoint: "wss://tutor.example.com/live".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = TutorConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.chunk_duration_ms, 100);
        assert_eq!(config.summary_grace_secs, 30);
        assert_eq!(config.opening_turn, "Hello");
        assert_eq!(config.reconnection.max_attempts, 3);
        assert_eq!(config.reconnection.base_delay_ms, 2000);
        assert!(config.persistence_url.is_none());
    }

    #[test]
    fn test_env_values() {
        let config = TutorConfig::from_lookup(lookup(&[
            ("TUTOR_ENDPOINT", "ws://localhost:9000"),
            ("TUTOR_API_KEY", "key"),
            ("TUTOR_HANDSHAKE_MODE", "query"),
            ("TUTOR_RECONNECT_ENABLED", "off"),
            ("TUTOR_RECONNECT_MAX_ATTEMPTS", "5"),
            ("TUTOR_CHUNK_DURATION_MS", "20"),
            ("TUTOR_PERSISTENCE_URL", "https://api.example.com"),
            ("TUTOR_OPENING_TURN", "  "),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "ws://localhost:9000");
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert_eq!(config.handshake_mode, HandshakeMode::Query);
        assert!(!config.reconnection.enabled);
        assert_eq!(config.reconnection.max_attempts, 5);
        assert_eq!(config.audio.chunk_duration_ms, 20);
        // Blank values fall back to defaults
        assert_eq!(config.opening_turn, "Hello");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_invalid_number() {
        let err = TutorConfig::from_lookup(lookup(&[("TUTOR_INPUT_SAMPLE_RATE", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("TUTOR_INPUT_SAMPLE_RATE"));
    }

    #[test]
    fn test_env_invalid_flag() {
        let err = TutorConfig::from_lookup(lookup(&[("TUTOR_RECONNECT_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_yaml_overrides_env() {
        let mut config = TutorConfig::from_lookup(lookup(&[
            ("TUTOR_ENDPOINT", "ws://env-host:1"),
            ("TUTOR_API_KEY", "env-key"),
            ("TUTOR_SUMMARY_GRACE_SECS", "45"),
        ]))
        .unwrap();
        let yaml = YamlConfig::parse(
            "tutor:\n  endpoint: \"wss://yaml-host/live\"\nsession:\n  opening_turn: \"Hola\"\n",
        )
        .unwrap();

        config.apply_yaml(yaml);

        // YAML overrides ENV
        assert_eq!(config.endpoint, "wss://yaml-host/live");
        assert_eq!(config.opening_turn, "Hola");
        // ENV value kept where YAML is silent
        assert_eq!(config.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.summary_grace_secs, 45);
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(valid().validate().is_ok());

        let missing = TutorConfig::default();
        assert!(missing.validate().unwrap_err().to_string().contains("endpoint is required"));

        let http = TutorConfig {
            endpoint: "https://tutor.example.com".to_string(),
            ..Default::default()
        };
        assert!(http.validate().unwrap_err().to_string().contains("ws://"));
    }

    #[test]
    fn test_validate_audio() {
        let mut config = valid();
        config.audio.output_sample_rate = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.audio.chunk_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_persistence_url() {
        let mut config = valid();
        config.persistence_url = Some("ftp://files.example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = valid();
        config.summary_grace_secs = 12;
        config.api_key = Some("key".to_string());
        config.persistence_url = Some("https://api.example.com".to_string());
        config.user_id = Some("user-1".to_string());

        let transport = config.transport_config();
        assert_eq!(transport.endpoint, config.endpoint);
        assert_eq!(transport.api_key.as_deref(), Some("key"));
        assert_eq!(transport.input_sample_rate, 16000);

        let settings = config.session_settings();
        assert_eq!(settings.summary_grace, Duration::from_secs(12));

        assert!(config.persistence_client().unwrap().is_some());
        assert!(valid().persistence_client().unwrap().is_none());
    }

    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("TUTOR_ENDPOINT");
            env::remove_var("TUTOR_API_KEY");
        }
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("tutor.yaml");
        fs::write(&config_path, "tutor:\n  endpoint: \"wss://yaml-host/live\"\n").unwrap();

        unsafe {
            env::set_var("TUTOR_ENDPOINT", "ws://env-host:1");
            env::set_var("TUTOR_API_KEY", "env-key");
        }

        let config = TutorConfig::from_file(&config_path).unwrap();

        assert_eq!(config.endpoint, "wss://yaml-host/live");
        assert_eq!(config.api_key.as_deref(), Some("env-key"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_requires_endpoint() {
        cleanup_env_vars();

        let result = TutorConfig::from_env();
        assert!(matches!(result, Err(TutorError::InvalidConfiguration(_))));
    }
}
