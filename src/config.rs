//! Runtime configuration
//!
//! Read from environment variables (a `.env` file is loaded by the binaries).
//! Every setting has a default so the agent runs with nothing configured.

use crate::error::AgentError;
use crate::retry::RetryPolicy;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_MAX_PARSE_FAILURES: u32 = 3;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    /// Consecutive unparseable completions tolerated before the run is stopped
    pub max_parse_failures: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
    /// Final answers below this confidence are flagged
    pub low_confidence_threshold: u8,
    /// Finished runs kept in the archive; the oldest are evicted first
    pub archive_capacity: usize,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub summary_api_base_url: Option<String>,
    pub api_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_parse_failures: DEFAULT_MAX_PARSE_FAILURES,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            llm_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            low_confidence_threshold: 5,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            summary_api_base_url: None,
            api_port: 8080,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_iterations = parse_or(&get, "AGENT_MAX_ITERATIONS", defaults.max_iterations)?;
        if max_iterations == 0 {
            return Err(AgentError::Config(
                "AGENT_MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }

        let archive_capacity =
            parse_or(&get, "AGENT_ARCHIVE_CAPACITY", defaults.archive_capacity)?;
        if archive_capacity == 0 {
            return Err(AgentError::Config(
                "AGENT_ARCHIVE_CAPACITY must be at least 1".to_string(),
            ));
        }

        let port_key = if get("PORT").is_some() { "PORT" } else { "API_PORT" };

        Ok(Self {
            max_iterations,
            max_parse_failures: parse_or(
                &get,
                "AGENT_MAX_PARSE_FAILURES",
                defaults.max_parse_failures,
            )?,
            max_retries: parse_or(&get, "AGENT_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(parse_or(&get, "AGENT_RETRY_BASE_MS", 500u64)?),
            llm_timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 60u64)?),
            tool_timeout: Duration::from_secs(parse_or(&get, "TOOL_TIMEOUT_SECS", 30u64)?),
            low_confidence_threshold: parse_or(
                &get,
                "AGENT_LOW_CONFIDENCE",
                defaults.low_confidence_threshold,
            )?,
            archive_capacity,
            gemini_api_key: get("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            summary_api_base_url: get("SUMMARY_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            api_port: parse_or(&get, port_key, defaults.api_port)?,
        })
    }

    /// Retries and timeout for think steps
    pub fn llm_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            self.retry_base_delay,
            self.llm_timeout,
        )
    }

    /// Retries and timeout for tool back-ends
    pub fn tool_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            self.retry_base_delay,
            self.tool_timeout,
        )
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| AgentError::Config(format!("{}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
