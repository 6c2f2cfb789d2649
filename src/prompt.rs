//! Prompt rendering for the think step
//!
//! System instructions, the opening question, and the observations fed back
//! after each step (tool results, rejections, format corrections).

use crate::models::{ToolName, ToolResult};
use crate::orchestrator::Rejection;

const MAX_OBSERVED_ANSWER_CHARS: usize = 1200;

/// System instructions listing the tools, the output format and the call order
pub fn system_instructions(tools: &[(ToolName, &str)], max_iterations: u32) -> String {
    let tool_lines = tools
        .iter()
        .map(|(kind, description)| format!("- {}: {}", kind.action_name(), description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a financial research agent. You answer questions by consulting pre-computed summaries organised as sector -> company -> document.

Tools:
{tool_lines}

Rules:
- Start with sector_tool.
- Then call company_tool, once per company you need. Pass the company identifier from the sector result.
- If company_tool returns document identifiers you must call document_tool next.
- evidence_tool may be used once a company has been consulted.
- Only state facts that appear in tool observations. If the tools report no data, say you do not have access to the necessary data.
- You have at most {max_iterations} steps.

Respond in exactly this format:
Thought: <your reasoning>
Action: <tool name>
Action Input: {{"query": "...", "company": "<identifier, optional>", "doc_ids": ["<optional>"]}}

When you can answer, respond with:
Thought: <your reasoning>
Final Answer: <the answer>

Never write the Observation yourself."#
    )
}

pub fn opening_turn(query: &str) -> String {
    format!("Question: {}", query)
}

/// Observation for a committed tool result
pub fn result_observation(key: &str, result: &ToolResult, allowed_next: &[ToolName]) -> String {
    let mut lines = vec![format!("Observation [{}]:", key)];

    let answer = result.answer.trim();
    if answer.is_empty() {
        lines.push("Answer: (no answer returned)".to_string());
    } else {
        lines.push(format!("Answer: {}", truncate(answer, MAX_OBSERVED_ANSWER_CHARS)));
    }
    lines.push(format!("Confidence: {}/10", result.confidence));

    if !result.relevant_identifiers.is_empty() {
        lines.push(format!(
            "Relevant identifiers: {}",
            result.relevant_identifiers.join(", ")
        ));
    }
    if !result.evidence.is_empty() {
        lines.push(format!("Evidence items: {}", result.evidence.len()));
    }
    if let Some(defect) = &result.validation_error {
        lines.push(format!("Note: output was incomplete ({})", defect));
    }

    lines.push(allowed_line(allowed_next));
    lines.join("\n")
}

/// Observation for a refused tool call
pub fn rejection_observation(rejection: &Rejection, allowed_next: &[ToolName]) -> String {
    format!(
        "Observation: The tool call was rejected: {}.\n{}",
        rejection,
        allowed_line(allowed_next)
    )
}

/// Observation asking for the expected format after an unreadable completion
pub fn format_correction(failures: u32, max_failures: u32, allowed_next: &[ToolName]) -> String {
    format!(
        "Observation: I could not read your last response ({}/{} format errors). \
         Reply with 'Thought:' followed by either 'Action:' and 'Action Input:' lines \
         or a 'Final Answer:' line.\n{}",
        failures,
        max_failures,
        allowed_line(allowed_next)
    )
}

fn allowed_line(allowed: &[ToolName]) -> String {
    let names = allowed
        .iter()
        .map(|t| t.action_name())
        .collect::<Vec<_>>()
        .join(", ");
    format!("Allowed next: {} or Final Answer", names)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
