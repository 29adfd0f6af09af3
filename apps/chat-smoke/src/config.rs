//! Environment-backed configuration for `chat-smoke`.

use std::{env, error::Error, fmt};

use chat_core::{ConversationId, PAGE_SIZE, RetryPolicy};
use chat_runtime::RuntimeConfig;

const DEFAULT_HISTORY: usize = 120;
const DEFAULT_USER: &str = "alice";
const DEFAULT_GROUP: &str = "smoke-group";

/// Smoke run parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Messages seeded into the conversation before opening it.
    pub history: usize,
    /// Viewing user; also the sender of the smoke message.
    pub user_id: String,
    pub conversation_id: ConversationId,
    pub runtime: RuntimeConfig,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let history = parse_or("TASKCHAT_SMOKE_HISTORY", DEFAULT_HISTORY, &mut lookup)?;
        let page_size = parse_or("TASKCHAT_SMOKE_PAGE_SIZE", PAGE_SIZE, &mut lookup)?;
        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKCHAT_SMOKE_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let user_id = optional_trimmed_env("TASKCHAT_SMOKE_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER.to_owned());
        let group_id = optional_trimmed_env("TASKCHAT_SMOKE_GROUP", &mut lookup)
            .unwrap_or_else(|| DEFAULT_GROUP.to_owned());
        let conversation_id = match optional_trimmed_env("TASKCHAT_SMOKE_TASK", &mut lookup) {
            Some(task_id) => ConversationId::task(group_id, task_id),
            None => ConversationId::group(group_id),
        };

        let defaults = RetryPolicy::default();
        let base_delay_ms = parse_or(
            "TASKCHAT_SMOKE_RETRY_BASE_MS",
            defaults.base_delay_ms(),
            &mut lookup,
        )?;
        let max_delay_ms = parse_or(
            "TASKCHAT_SMOKE_RETRY_MAX_MS",
            defaults.max_delay_ms(),
            &mut lookup,
        )?;
        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "TASKCHAT_SMOKE_RETRY_MAX_MS",
                value: max_delay_ms.to_string(),
                reason: format!("must be at least the base delay ({base_delay_ms})"),
            });
        }

        Ok(Self {
            history,
            user_id,
            conversation_id,
            runtime: RuntimeConfig {
                page_size,
                retry_policy: RetryPolicy::new(base_delay_ms, max_delay_ms),
                ..RuntimeConfig::default()
            },
        })
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
