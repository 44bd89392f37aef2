use serde::Deserialize;
use std::path::Path;

use crate::core::transport::HandshakeMode;
use crate::errors::{TutorError, TutorResult};

/// Complete YAML configuration structure
///
/// Every field is optional so a file can override only what it needs. Values
/// present here win over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// tutor:
///   endpoint: "wss://tutor.example.com/live"
///   api_key: "your-api-key"
///   handshake_mode: first_frame
///
/// reconnection:
///   enabled: true
///   max_attempts: 3
///   base_delay_ms: 2000
///
/// audio:
///   input_sample_rate: 16000
///   output_sample_rate: 24000
///   chunk_duration_ms: 100
///
/// session:
///   summary_grace_secs: 30
///   opening_turn: "Hello"
///   channel_capacity: 256
///
/// persistence:
///   url: "https://api.example.com/tutor/"
///   api_key: "persistence-key"
///   user_id: "user-42"
///   lesson_id: "cafe-order"
///   timeout_secs: 5
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub tutor: Option<TutorYaml>,
    pub reconnection: Option<ReconnectionYaml>,
    pub audio: Option<AudioYaml>,
    pub session: Option<SessionYaml>,
    pub persistence: Option<PersistenceYaml>,
}

/// Tutor endpoint configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TutorYaml {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub handshake_mode: Option<HandshakeMode>,
}

/// Reconnection configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

/// Audio configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub chunk_duration_ms: Option<u32>,
}

/// Session behaviour from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub summary_grace_secs: Option<u64>,
    pub opening_turn: Option<String>,
    pub wrap_up_prompt: Option<String>,
    pub channel_capacity: Option<usize>,
}

/// Persistence service configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersistenceYaml {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub lesson_id: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns [`TutorError::InvalidConfiguration`] if the file cannot be read or
    /// the YAML is malformed.
    pub fn from_file(path: &Path) -> TutorResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TutorError::InvalidConfiguration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from YAML text
    pub fn parse(contents: &str) -> TutorResult<Self> {
        serde_yaml::from_str(contents).map_err(|e| {
            TutorError::InvalidConfiguration(format!("Failed to parse YAML config: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
tutor:
  endpoint: "wss://tutor.example.com/live"
  api_key: "secret"
  handshake_mode: query

reconnection:
  enabled: false
  max_attempts: 5
  base_delay_ms: 500

audio:
  input_sample_rate: 8000
  chunk_duration_ms: 20

session:
  summary_grace_secs: 10
  opening_turn: "Hola"

persistence:
  url: "https://api.example.com/"
  user_id: "user-1"
"#;

        let config = YamlConfig::parse(yaml).unwrap();

        let tutor = config.tutor.unwrap();
        assert_eq!(
            tutor.endpoint,
            Some("wss://tutor.example.com/live".to_string())
        );
        assert_eq!(tutor.handshake_mode, Some(HandshakeMode::Query));

        let reconnection = config.reconnection.unwrap();
        assert_eq!(reconnection.enabled, Some(false));
        assert_eq!(reconnection.max_attempts, Some(5));

        let audio = config.audio.unwrap();
        assert_eq!(audio.input_sample_rate, Some(8000));
        assert_eq!(audio.output_sample_rate, None);

        let session = config.session.unwrap();
        assert_eq!(session.summary_grace_secs, Some(10));
        assert_eq!(session.opening_turn, Some("Hola".to_string()));

        assert_eq!(config.persistence.unwrap().user_id, Some("user-1".to_string()));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config = YamlConfig::parse("{}").unwrap();
        assert!(config.tutor.is_none());
        assert!(config.session.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("tutor.yaml");
        fs::write(&config_path, "tutor:\n  endpoint: \"ws://localhost:9000\"\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(
            config.tutor.unwrap().endpoint,
            Some("ws://localhost:9000".to_string())
        );
    }

    #[test]
    fn test_from_file_not_found() {
        let result = YamlConfig::from_file(Path::new("/nonexistent/tutor.yaml"));

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
