//! Hierarchical Retrieval Agent
//!
//! Answers financial questions by walking pre-computed summaries from sector
//! to company to document, driven by an LLM reasoning loop:
//! - parses free-text LLM output into structured actions, repairing common
//!   formatting mistakes
//! - enforces the sector → company → document call order
//! - keeps every result of repeated tool calls under its own key
//! - validates tool output before it re-enters the loop
//!
//! LOOP:
//! THINK → PARSE → ORCHESTRATE → OBSERVE → (repeat) → COMPOSE

pub mod agent;
pub mod api;
pub mod audit;
pub mod composer;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod retry;
pub mod state;
pub mod tools;
pub mod validation;

pub use error::Result;

// Re-export common types
pub use agent::{HierarchicalAgent, QueryOutcome};
pub use models::*;
