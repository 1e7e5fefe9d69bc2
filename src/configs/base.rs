use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub voice: VoiceConfig,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        crate::log_println!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        if config_str.is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }

        Self::from_toml(&config_str)
    }

    pub fn from_toml(raw: &str) -> AnyResult<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [logging]
            level = "debug"

            [logging.file]
            path = "./logs/voxlink.log"

            [voice]
            guild_id = "41771983423143937"
            channel_id = "127121515262115840"
            user_id = 80351110224678912
            self_deaf = true

            [voice.server]
            session_id = "my_session_id"
            token = "my_token"
            endpoint = "smart.loyal.discord.gg"
        "#;

        let config = Config::from_toml(raw).unwrap();
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.file.unwrap().max_lines, 10_000);

        let voice = config.voice;
        assert_eq!(voice.guild_id.0, 41771983423143937);
        assert_eq!(voice.user_id.0, 80351110224678912);
        assert!(voice.self_deaf);
        assert!(!voice.self_mute);
        assert_eq!(voice.frame_interval_ms, 20);
        assert_eq!(voice.server.unwrap().endpoint, "smart.loyal.discord.gg");
    }

    #[test]
    fn test_missing_voice_table_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.logging.is_none());
        assert_eq!(config.voice.trailing_silence_frames, 5);
        assert!(config.voice.server.is_none());
    }
}
