//! LLM completion service
//!
//! The agent only sees the `LlmClient` trait: system instructions, the
//! conversation so far and the latest observation go in, free text comes out.

pub mod gemini;

pub use gemini::GeminiClient;

use crate::error::AgentError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatTurn>,
    /// Result of the previous step, sent as the newest user turn
    pub observation: Option<String>,
}

impl CompletionRequest {
    /// Messages with the observation appended, in send order
    pub fn turns(&self) -> Vec<ChatTurn> {
        let mut turns = self.messages.clone();
        if let Some(observation) = &self.observation {
            turns.push(ChatTurn::user(observation.clone()));
        }
        turns
    }
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

enum ScriptStep {
    Reply(String),
    Fail(String),
}

/// Replays canned completions in order.
///
/// Once the script is used up it keeps returning the `repeat` completion if one
/// was set, otherwise it fails with a non-retryable error.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ScriptStep>>,
    repeat: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(completions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(
                completions
                    .into_iter()
                    .map(|c| ScriptStep::Reply(c.into()))
                    .collect(),
            ),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Return `completion` forever once the script runs out
    pub fn repeating(mut self, completion: impl Into<String>) -> Self {
        self.repeat = Some(completion.into());
        self
    }

    /// Queue a transient failure after the steps already scripted
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(ScriptStep::Fail(message.into()));
        }
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let next = self
            .script
            .lock()
            .map_err(|_| AgentError::Config("scripted LLM lock poisoned".to_string()))?
            .pop_front();

        match next {
            Some(ScriptStep::Reply(text)) => Ok(text),
            Some(ScriptStep::Fail(message)) => Err(AgentError::Llm(message)),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| AgentError::Config("scripted LLM has no completions left".to_string())),
        }
    }
}
