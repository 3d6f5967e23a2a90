use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use teloxide::types::ChatId;

use crate::chatbot::conversation::DEFAULT_MAX_TURNS;
use crate::chatbot::gemini::{DEFAULT_API_URL, DEFAULT_MODEL};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_DIR: &str = "logs";

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    Missing(&'static str),
    /// A variable could not be parsed.
    Invalid { var: &'static str, value: String, reason: String },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(var) => write!(f, "{} is not set", var),
            Self::Invalid { var, value, reason } => {
                write!(f, "invalid value '{}' for {}: {}", value, var, reason)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

pub struct Config {
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    /// Chat-completions endpoint.
    pub gemini_api_url: String,
    pub gemini_model: String,
    /// Upper bound for one AI request.
    pub ai_timeout: Duration,
    /// Turns retained per user.
    pub max_history_turns: usize,
    pub log_dir: PathBuf,
    /// Chat that receives WARN/ERROR logs, if any.
    pub log_chat_id: Option<ChatId>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("gemini_api_url", &self.gemini_api_url)
            .field("gemini_model", &self.gemini_model)
            .field("ai_timeout", &self.ai_timeout)
            .field("max_history_turns", &self.max_history_turns)
            .field("log_dir", &self.log_dir)
            .field("log_chat_id", &self.log_chat_id)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let telegram_bot_token =
            get("TELEGRAM_BOT_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "TELEGRAM_BOT_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let gemini_api_key = get("GEMINI_API_KEY").ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;

        let timeout_secs: u64 = parse_or("AI_TIMEOUT_SECS", get("AI_TIMEOUT_SECS"), DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Validation("AI_TIMEOUT_SECS must be greater than 0".into()));
        }

        let max_history_turns: usize =
            parse_or("MAX_HISTORY_TURNS", get("MAX_HISTORY_TURNS"), DEFAULT_MAX_TURNS)?;
        if max_history_turns < 2 {
            return Err(ConfigError::Validation(
                "MAX_HISTORY_TURNS must be at least 2 to hold one exchange".into(),
            ));
        }

        let log_chat_id = get("LOG_CHAT_ID")
            .map(|v| parse_or("LOG_CHAT_ID", Some(v), 0i64).map(ChatId))
            .transpose()?;

        Ok(Self {
            telegram_bot_token,
            gemini_api_key,
            gemini_api_url: get("GEMINI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ai_timeout: Duration::from_secs(timeout_secs),
            max_history_turns,
            log_dir: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_chat_id,
        })
    }
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value: v,
        }),
    }
}
