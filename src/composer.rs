//! Answer composer
//!
//! Turns a terminal `ExecutionState` into the caller-facing `QueryResponse`.
//! Findings are grouped by tool but every stored invocation contributes, so a
//! second company lookup never hides the first.

use crate::models::{QueryResponse, QueryStatus, Termination, ToolName};
use crate::state::ExecutionState;

pub const UNAVAILABLE_MESSAGE: &str = "I do not have access to the necessary data to answer this question. \
The sector and company summaries consulted did not contain the requested information.";

#[derive(Debug, Clone)]
pub struct AnswerComposer {
    low_confidence_threshold: u8,
}

impl AnswerComposer {
    pub fn new(low_confidence_threshold: u8) -> Self {
        Self {
            low_confidence_threshold,
        }
    }

    pub fn compose(&self, state: &ExecutionState) -> QueryResponse {
        // A state that was never terminated is reported as stopped early.
        let termination = state
            .termination()
            .cloned()
            .unwrap_or(Termination::IterationsExhausted);
        let forced = termination.is_forced();

        let evidence = state.evidence();
        let confidence = state.current_confidence();
        let document_evidence = state
            .results_for(ToolName::Document)
            .iter()
            .any(|(_, result)| !result.evidence.is_empty());
        let unavailable = !document_evidence && confidence == 0;

        let status = if !forced {
            QueryStatus::Success
        } else if state.has_progress() {
            QueryStatus::Partial
        } else {
            QueryStatus::Error
        };

        let mut sections = Vec::new();
        if forced {
            sections.push(format!(
                "Stopped before a final answer because {}.",
                termination.describe()
            ));
        }

        if unavailable {
            sections.push(UNAVAILABLE_MESSAGE.to_string());
        } else {
            if let Some(answer) = state.final_answer().map(str::trim).filter(|a| !a.is_empty()) {
                sections.push(answer.to_string());
            }

            let mut notes = Vec::new();
            if confidence < self.low_confidence_threshold {
                notes.push(format!(
                    "Note: confidence in this answer is low ({}/10).",
                    confidence
                ));
            }
            if !document_evidence {
                notes.push("Note: no supporting document evidence was retrieved.".to_string());
            }
            if !notes.is_empty() {
                sections.push(notes.join("\n"));
            }

            if let Some(findings) = findings(state) {
                sections.push(findings);
            }
        }

        if sections.is_empty() {
            sections.push("No answer was produced.".to_string());
        }

        let mut warnings = state.validation_warnings();
        if forced {
            warnings.insert(0, format!("run stopped: {}", termination.describe()));
        }

        QueryResponse {
            status,
            result_text: sections.join("\n\n"),
            evidence,
            confidence,
            tool_sequence: state.tool_sequence().iter().map(|c| c.key()).collect(),
            warnings,
        }
    }
}

impl Default for AnswerComposer {
    fn default() -> Self {
        Self::new(5)
    }
}

fn findings(state: &ExecutionState) -> Option<String> {
    let mut blocks = Vec::new();

    for tool in ToolName::ALL {
        let lines: Vec<String> = state
            .results_for(tool)
            .into_iter()
            .filter(|(_, result)| !result.answer.trim().is_empty())
            .map(|(key, result)| format!("- [{}] {}", key, result.answer.trim()))
            .collect();

        if !lines.is_empty() {
            blocks.push(format!("{} findings:\n{}", heading(tool), lines.join("\n")));
        }
    }

    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

fn heading(tool: ToolName) -> &'static str {
    match tool {
        ToolName::Sector => "Sector",
        ToolName::Company => "Company",
        ToolName::Document => "Document",
        ToolName::Evidence => "Evidence",
    }
}
