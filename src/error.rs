//! Error types for the hierarchical retrieval agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Tool not registered: {0}")]
    ToolNotRegistered(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Llm(_) | AgentError::ToolExecution(_) | AgentError::Timeout(_) => true,
            AgentError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error() || s.as_u16() == 429).unwrap_or(true)
            }
            AgentError::Io(_) => true,
            AgentError::ToolNotRegistered(_)
            | AgentError::InvalidToolInput(_)
            | AgentError::Config(_)
            | AgentError::Cancelled(_)
            | AgentError::Serialization(_) => false,
        }
    }
}
