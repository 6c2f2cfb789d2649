//! Tool output validation
//!
//! Every raw tool output is coerced into a [`ToolResult`] before the
//! orchestrator looks at it. Missing or wrong-shaped fields never drop the
//! call: they are defaulted and described in `validation_error`.

use crate::models::{EvidenceItem, ToolName, ToolResult};
use serde_json::{Map, Value};

const MAX_CONFIDENCE: i64 = 10;

const ANSWER_KEYS: &[&str] = &["answer"];
const FALLBACK_ANSWER_KEYS: &[&str] = &["result", "output", "summary", "response"];
const THOUGHT_KEYS: &[&str] = &["thought", "reasoning"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "confidence_score"];
const IDENTIFIER_KEYS: &[&str] = &[
    "relevant_identifiers",
    "relevantIdentifiers",
    "relevant_doc_ids",
    "doc_ids",
    "identifiers",
];
/// The sector tool names the company it wants inspected next
const SECTOR_IDENTIFIER_KEYS: &[&str] = &["category", "categories", "companies", "company"];
const EVIDENCE_KEYS: &[&str] = &["evidence"];

/// Required-field policy for one tool family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPolicy {
    pub requires_answer: bool,
    pub requires_identifiers: bool,
    pub requires_evidence: bool,
}

impl FieldPolicy {
    pub fn for_tool(tool: ToolName) -> Self {
        match tool {
            ToolName::Sector => Self {
                requires_answer: true,
                requires_identifiers: false,
                requires_evidence: false,
            },
            ToolName::Company => Self {
                requires_answer: true,
                requires_identifiers: true,
                requires_evidence: false,
            },
            ToolName::Document => Self {
                requires_answer: true,
                requires_identifiers: false,
                requires_evidence: true,
            },
            ToolName::Evidence => Self {
                requires_answer: false,
                requires_identifiers: false,
                requires_evidence: true,
            },
        }
    }
}

/// Coerce a raw tool output into a [`ToolResult`].
pub fn validate(tool: ToolName, raw: &Value) -> ToolResult {
    let policy = FieldPolicy::for_tool(tool);
    let mut issues = Vec::new();

    let empty = Map::new();
    let fields = match unwrap_data(raw) {
        Value::Object(map) => map,
        Value::String(text) => {
            // Some tools answer with bare text; keep it as the answer.
            issues.push("expected a JSON object, got a string".to_string());
            return finish(tool, policy, &empty, Some(text.clone()), issues);
        }
        other => {
            issues.push(format!("expected a JSON object, got {}", json_kind(other)));
            return finish(tool, policy, &empty, None, issues);
        }
    };

    finish(tool, policy, fields, None, issues)
}

fn finish(
    tool: ToolName,
    policy: FieldPolicy,
    fields: &Map<String, Value>,
    bare_answer: Option<String>,
    mut issues: Vec<String>,
) -> ToolResult {
    let thought = match read_text(fields, THOUGHT_KEYS) {
        Some(Ok(text)) => text,
        Some(Err(kind)) => {
            issues.push(format!("'thought' must be a string, got {}", kind));
            String::new()
        }
        None => String::new(),
    };

    let answer = match read_text(fields, ANSWER_KEYS) {
        Some(Ok(text)) => text,
        Some(Err(kind)) => {
            issues.push(format!("'answer' must be a string, got {}", kind));
            fallback_answer(fields, bare_answer)
        }
        None => {
            if policy.requires_answer && bare_answer.is_none() {
                issues.push("missing required field 'answer'".to_string());
            }
            fallback_answer(fields, bare_answer)
        }
    };

    let confidence = read_confidence(fields, &mut issues);

    let mut relevant_identifiers = read_identifiers(fields, IDENTIFIER_KEYS, &mut issues);
    if relevant_identifiers.is_none() && tool == ToolName::Sector {
        relevant_identifiers = read_identifiers(fields, SECTOR_IDENTIFIER_KEYS, &mut issues);
    }
    if relevant_identifiers.is_none() && policy.requires_identifiers {
        issues.push("missing required field 'relevant_identifiers'".to_string());
    }

    let evidence = read_evidence(fields, &mut issues);
    if evidence.is_none() && policy.requires_evidence {
        issues.push("missing required field 'evidence'".to_string());
    }

    ToolResult {
        tool_name: tool,
        thought,
        answer,
        confidence,
        relevant_identifiers: relevant_identifiers.unwrap_or_default(),
        evidence: evidence.unwrap_or_default(),
        validation_error: if issues.is_empty() {
            None
        } else {
            Some(issues.join("; "))
        },
    }
}

/// Accept outputs wrapped as `{"data": {...}}`
fn unwrap_data(raw: &Value) -> &Value {
    match raw {
        Value::Object(map) if map.len() == 1 => map.get("data").unwrap_or(raw),
        _ => raw,
    }
}

fn first_present<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

fn read_text(fields: &Map<String, Value>, keys: &[&str]) -> Option<Result<String, &'static str>> {
    first_present(fields, keys).map(|value| match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(json_kind(other)),
    })
}

fn fallback_answer(fields: &Map<String, Value>, bare_answer: Option<String>) -> String {
    if let Some(text) = bare_answer {
        return text.trim().to_string();
    }
    match read_text(fields, FALLBACK_ANSWER_KEYS) {
        Some(Ok(text)) => text,
        _ => fields
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.trim().is_empty())
            .map(|e| format!("Tool reported an error: {}", e.trim()))
            .unwrap_or_default(),
    }
}

fn read_confidence(fields: &Map<String, Value>, issues: &mut Vec<String>) -> u8 {
    let Some(value) = first_present(fields, CONFIDENCE_KEYS) else {
        return 0;
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        // "7" or "7/10"
        Value::String(s) => s
            .split('/')
            .next()
            .and_then(|head| head.trim().parse::<f64>().ok()),
        _ => None,
    };

    match parsed {
        Some(score) if score.is_finite() => {
            let rounded = score.round() as i64;
            if !(0..=MAX_CONFIDENCE).contains(&rounded) {
                issues.push(format!("'confidence' {} outside 0-10, clamped", score));
            }
            rounded.clamp(0, MAX_CONFIDENCE) as u8
        }
        _ => {
            issues.push(format!("'confidence' must be a number, got {}", json_kind(value)));
            0
        }
    }
}

fn read_identifiers(
    fields: &Map<String, Value>,
    keys: &[&str],
    issues: &mut Vec<String>,
) -> Option<Vec<String>> {
    let value = first_present(fields, keys)?;
    let mut identifiers: Vec<String> = Vec::new();

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => push_identifier(s, &mut identifiers),
                    Value::Number(n) => push_identifier(&n.to_string(), &mut identifiers),
                    other => issues.push(format!(
                        "identifier entries must be strings, got {}",
                        json_kind(other)
                    )),
                }
            }
        }
        Value::String(s) => {
            // A single identifier, or a comma-separated list.
            for part in s.split(',') {
                push_identifier(part, &mut identifiers);
            }
        }
        other => {
            issues.push(format!(
                "'relevant_identifiers' must be a list, got {}",
                json_kind(other)
            ));
        }
    }

    Some(identifiers)
}

fn push_identifier(raw: &str, identifiers: &mut Vec<String>) {
    let id = raw.trim();
    if !id.is_empty() && !identifiers.iter().any(|existing| existing == id) {
        identifiers.push(id.to_string());
    }
}

fn read_evidence(fields: &Map<String, Value>, issues: &mut Vec<String>) -> Option<Vec<EvidenceItem>> {
    let value = first_present(fields, EVIDENCE_KEYS)?;

    let Value::Array(items) = value else {
        issues.push(format!("'evidence' must be a list, got {}", json_kind(value)));
        return Some(Vec::new());
    };

    let mut evidence = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(entry) => {
                let quote = pick_str(entry, &["quote", "text", "content", "excerpt"]);
                let source = pick_str(entry, &["source", "doc_id", "document", "source_id"]);
                match quote {
                    Some(quote) => evidence.push(EvidenceItem {
                        quote,
                        source: source.unwrap_or_default(),
                    }),
                    None => issues.push("evidence entry without a quote".to_string()),
                }
            }
            Value::String(quote) => evidence.push(EvidenceItem {
                quote: quote.trim().to_string(),
                source: String::new(),
            }),
            other => issues.push(format!(
                "evidence entries must be objects, got {}",
                json_kind(other)
            )),
        }
    }

    Some(evidence)
}

fn pick_str(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| entry.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

//
// ================= Tests =================
//
