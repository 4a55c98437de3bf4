use tracing::Level;

pub const DEFAULT_NEGOTIATION_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini-realtime-preview-2024-12-17";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub broker_url: String,
    pub negotiation_url: String,
    pub model: String,
    pub ice_servers: Vec<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`Config::from_env`], with `broker_url` taking precedence over `BROKER_URL`.
    pub fn load(broker_url: Option<String>) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let broker_url = broker_url
            .or_else(|| std::env::var("BROKER_URL").ok())
            .ok_or_else(|| ConfigError::MissingVar("BROKER_URL".to_string()))?;
        validate_http_url("BROKER_URL", &broker_url)?;

        let negotiation_url = std::env::var("REALTIME_NEGOTIATION_URL")
            .unwrap_or_else(|_| DEFAULT_NEGOTIATION_URL.to_string());
        validate_http_url("REALTIME_NEGOTIATION_URL", &negotiation_url)?;

        let model = std::env::var("REALTIME_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let ice_servers = match std::env::var("ICE_SERVERS") {
            Ok(list) => parse_ice_servers(&list)?,
            Err(_) => Vec::new(),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            broker_url,
            negotiation_url,
            model,
            ice_servers,
            log_level,
        })
    }
}

fn validate_http_url(var: &str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("unsupported scheme '{}'", scheme),
        )),
    }
}

fn parse_ice_servers(list: &str) -> Result<Vec<String>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            if ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                Ok(url.to_string())
            } else {
                Err(ConfigError::InvalidValue(
                    "ICE_SERVERS".to_string(),
                    format!("'{}' is not a STUN or TURN URL", url),
                ))
            }
        })
        .collect()
}
