//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default Ollama generate endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434/api/generate";

/// Default model tag.
pub const DEFAULT_MODEL: &str = "gemma3:27b";

/// Model context window in tokens.
pub const DEFAULT_CONTEXT_TOKENS: usize = 128_000;

/// Rough chars-per-token estimate used to turn the token window into a char budget.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Column at which rendered HTML bodies are wrapped.
pub const DEFAULT_WRAP_WIDTH: usize = 130;

const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;

/// What to do when the prompt frame alone exceeds the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrunPolicy {
    /// Log the overrun and classify the hard-cut prompt anyway.
    #[default]
    Send,
    /// Skip the message.
    Skip,
}

/// How many messages of one batch may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchParallelism {
    /// One message at a time, in delivery order.
    #[default]
    Sequential,
    /// Up to `n` messages concurrently.
    Bounded(usize),
}

impl BatchParallelism {
    /// Effective number of concurrent messages.
    pub fn limit(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Bounded(n) => n.max(1),
        }
    }
}

/// Retry settings for the classification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts after the first one. Zero means single-attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each subsequent retry.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Tagger configuration.
#[derive(Debug, Clone)]
pub struct TaggerConfig {
    /// Inference endpoint (Ollama `/api/generate`).
    pub endpoint: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Model context window in tokens.
    pub context_tokens: usize,
    /// Chars-per-token estimate.
    pub chars_per_token: usize,
    /// Wrap column for HTML-to-text rendering.
    pub wrap_width: usize,
    /// Per-request timeout for the inference call. `None` waits for the model
    /// however long it takes.
    pub request_timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub parallelism: BatchParallelism,
    pub overrun_policy: OverrunPolicy,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            context_tokens: DEFAULT_CONTEXT_TOKENS,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            wrap_width: DEFAULT_WRAP_WIDTH,
            request_timeout: None,
            retry: RetryConfig::default(),
            parallelism: BatchParallelism::default(),
            overrun_policy: OverrunPolicy::default(),
        }
    }
}

impl TaggerConfig {
    /// Prompt budget in characters (512,000 with the defaults).
    pub fn char_budget(&self) -> usize {
        self.context_tokens.saturating_mul(self.chars_per_token)
    }

    /// Build config from `MAIL_TAGGER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let endpoint = get("MAIL_TAGGER_OLLAMA_URL").unwrap_or(defaults.endpoint);
        let model = get("MAIL_TAGGER_MODEL").unwrap_or(defaults.model);

        let context_tokens =
            parse_or("MAIL_TAGGER_CONTEXT_TOKENS", get("MAIL_TAGGER_CONTEXT_TOKENS"), defaults.context_tokens)?;
        let chars_per_token = parse_or(
            "MAIL_TAGGER_CHARS_PER_TOKEN",
            get("MAIL_TAGGER_CHARS_PER_TOKEN"),
            defaults.chars_per_token,
        )?;
        let wrap_width = parse_or("MAIL_TAGGER_WRAP_WIDTH", get("MAIL_TAGGER_WRAP_WIDTH"), defaults.wrap_width)?;
        if wrap_width == 0 {
            return Err(invalid("MAIL_TAGGER_WRAP_WIDTH", "must be at least 1"));
        }

        let request_timeout = match get("MAIL_TAGGER_REQUEST_TIMEOUT_SECS") {
            None => None,
            Some(v) => match parse_or("MAIL_TAGGER_REQUEST_TIMEOUT_SECS", Some(v), 0u64)? {
                0 => return Err(invalid("MAIL_TAGGER_REQUEST_TIMEOUT_SECS", "must be at least 1")),
                secs => Some(Duration::from_secs(secs)),
            },
        };
        let max_retries = parse_or("MAIL_TAGGER_MAX_RETRIES", get("MAIL_TAGGER_MAX_RETRIES"), 0u32)?;
        let backoff_ms = parse_or(
            "MAIL_TAGGER_RETRY_BACKOFF_MS",
            get("MAIL_TAGGER_RETRY_BACKOFF_MS"),
            DEFAULT_RETRY_BACKOFF_MS,
        )?;

        let parallelism = match get("MAIL_TAGGER_PARALLELISM") {
            None => BatchParallelism::Sequential,
            Some(v) if v.eq_ignore_ascii_case("sequential") => BatchParallelism::Sequential,
            Some(v) => match v.parse::<usize>() {
                Ok(0) | Ok(1) => BatchParallelism::Sequential,
                Ok(n) => BatchParallelism::Bounded(n),
                Err(e) => return Err(invalid("MAIL_TAGGER_PARALLELISM", &e.to_string())),
            },
        };

        let overrun_policy = match get("MAIL_TAGGER_OVERRUN_POLICY").as_deref() {
            None => OverrunPolicy::Send,
            Some(v) if v.eq_ignore_ascii_case("send") => OverrunPolicy::Send,
            Some(v) if v.eq_ignore_ascii_case("skip") => OverrunPolicy::Skip,
            Some(other) => {
                return Err(invalid(
                    "MAIL_TAGGER_OVERRUN_POLICY",
                    &format!("expected \"send\" or \"skip\", got \"{other}\""),
                ));
            }
        };

        Ok(Self {
            endpoint,
            model,
            context_tokens,
            chars_per_token,
            wrap_width,
            request_timeout,
            retry: RetryConfig {
                max_retries,
                backoff: Duration::from_millis(backoff_ms),
            },
            parallelism,
            overrun_policy,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| invalid(key, &e.to_string())),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
