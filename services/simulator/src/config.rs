use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub openai_api_key: SecretString,
    pub openai_base_url: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub log_llm_calls: bool,
    pub llm_log_path: PathBuf,
    pub print_llm_calls: bool,
    pub max_workers: usize,
    pub rate_limit_per_minute: u32,
    pub max_attempts: u32,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a boolean", raw),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let log_llm_calls = parse_flag("LOG_LLM_CALLS", false)?;
        let llm_log_path = std::env::var("LOG_LLM_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs/llm_calls.jsonl"));
        let print_llm_calls = parse_flag("PRINT_LLM_CALLS", false)?;

        let max_workers = parse_var("MAX_WORKERS", 100usize)?;
        let rate_limit_per_minute = parse_var("RATE_LIMIT_PER_MINUTE", 100u32)?;
        let max_attempts = parse_var("MAX_ATTEMPTS", 3u32)?;
        if rate_limit_per_minute == 0 {
            return Err(ConfigError::InvalidValue(
                "RATE_LIMIT_PER_MINUTE".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            openai_api_key,
            openai_base_url,
            log_level,
            prompts_path,
            log_llm_calls,
            llm_log_path,
            print_llm_calls,
            max_workers,
            rate_limit_per_minute,
            max_attempts,
        })
    }
}
