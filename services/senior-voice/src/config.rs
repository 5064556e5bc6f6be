use std::path::PathBuf;
use tracing::Level;
use tripot_core::SpeechSettings;

/// Why the environment could not be turned into a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Client settings, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Backend `host:port`, without scheme or path.
    pub server: String,
    pub data_dir: PathBuf,
    pub tts_program: String,
    pub speech: SpeechSettings,
    pub log_level: Level,
}

impl Config {
    /// Reads `TRIPOT_*`, `TTS_*` and `RUST_LOG`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Tests control the environment themselves.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server = std::env::var("TRIPOT_SERVER").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        if server.is_empty() || server.contains("://") || server.contains('/') {
            return Err(ConfigError::InvalidValue(
                "TRIPOT_SERVER".to_string(),
                format!("'{}' must be a bare host:port", server),
            ));
        }

        let data_dir = match std::env::var("TRIPOT_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_local_dir()
                .map(|dir| dir.join("tripot"))
                .ok_or_else(|| ConfigError::MissingVar("TRIPOT_DATA_DIR".to_string()))?,
        };

        let tts_program = std::env::var("TTS_PROGRAM").unwrap_or_else(|_| "espeak-ng".to_string());
        let locale = std::env::var("TTS_LOCALE").unwrap_or_else(|_| "ko-KR".to_string());

        let rate_str = std::env::var("TTS_RATE").unwrap_or_else(|_| "0.5".to_string());
        let rate = rate_str
            .parse::<f32>()
            .ok()
            .filter(|rate| *rate > 0.0 && *rate <= 1.0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TTS_RATE".to_string(),
                    format!("'{}' is not a rate in (0, 1]", rate_str),
                )
            })?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            server,
            data_dir,
            tts_program,
            speech: SpeechSettings { locale, rate },
            log_level,
        })
    }
}
