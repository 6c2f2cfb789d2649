//! Completion parser
//!
//! Turns one free-text LLM completion into a [`ParsedAction`].
//! Models routinely drop the `Action Input:` label, wrap arguments in quotes or
//! code fences, or keep writing past the action with an invented observation, so
//! the parser works in three tiers:
//!
//! 1. strict: `Action:` line followed by an `Action Input:` line
//! 2. tolerant: the argument sits on the action line or on the following lines
//! 3. salvage: the first JSON-like block after a tool mention
//!
//! Anything else is `Unparseable`. The parser is pure; callers log.

use crate::models::ParsedAction;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `Action: <name> [rest]`, tolerating markdown emphasis around the label
    static ref ACTION_LINE: Regex =
        Regex::new(r"(?im)^[ \t*_#>]*action[ \t*_]*:[ \t*_]*(.*)$").unwrap();

    static ref ACTION_INPUT: Regex =
        Regex::new(r"(?im)^[ \t*_#>]*action[ \t_]*input[ \t*_]*:[ \t*_]*").unwrap();

    static ref FINAL_ANSWER: Regex =
        Regex::new(r"(?im)^[ \t*_#>]*final[ \t_]*answer[ \t*_]*:[ \t*_]*").unwrap();

    static ref THOUGHT: Regex =
        Regex::new(r"(?im)^[ \t*_#>]*thought[ \t*_]*:[ \t*_]*").unwrap();

    /// Any line that starts a new ReAct section
    static ref MARKER: Regex = Regex::new(
        r"(?i)^[ \t*_#>]*(?:thought|action|action[ \t_]*input|observation|final[ \t_]*answer|question)[ \t*_]*:"
    )
    .unwrap();

    static ref TOOL_NAME: Regex = Regex::new(r"^[`*'\x22]*([A-Za-z_][\w\-]*)[`*'\x22]*").unwrap();

    /// Tool names mentioned anywhere in prose, used by the salvage tier
    static ref KNOWN_TOOL: Regex = Regex::new(
        r"(?i)\b((?:sector|company|document|evidence|department|category|news|doc)_tool)\b"
    )
    .unwrap();

    /// Loosely marked action, e.g. `**Action** -> company_tool`
    static ref LOOSE_ACTION: Regex =
        Regex::new(r"(?i)\baction\b[^\w\n]{0,8}([A-Za-z_][\w\-]*)").unwrap();
}

/// Parse one completion into exactly one action.
pub fn parse(text: &str) -> ParsedAction {
    let action_at = ACTION_LINE.find(text).map(|m| m.start());
    let final_answer = FINAL_ANSWER.find(text).map(|m| (m.start(), m.end()));

    // A final answer written before any action line is authoritative.
    if let Some((start, end)) = final_answer {
        if action_at.map_or(true, |a| a > start) {
            let answer = segment_until_marker(text, end).trim();
            if !answer.is_empty() {
                return ParsedAction::FinalAnswer {
                    text: answer.to_string(),
                };
            }
        }
    }

    if let Some(invocation) = strict_match(text)
        .or_else(|| tolerant_match(text))
        .or_else(|| salvage_match(text))
    {
        return invocation;
    }

    // Action line present but unusable; fall back to a trailing final answer.
    if let Some((_, end)) = final_answer {
        let answer = segment_until_marker(text, end).trim();
        if !answer.is_empty() {
            return ParsedAction::FinalAnswer {
                text: answer.to_string(),
            };
        }
    }

    ParsedAction::Unparseable {
        raw_text: text.to_string(),
    }
}

/// The reasoning segment of a completion, if any.
///
/// Prompts usually end with `Thought:`, so a completion often starts with the
/// thought text and no label; in that case everything before the first marker
/// line counts.
pub fn extract_thought(text: &str) -> Option<String> {
    let segment = match THOUGHT.find(text) {
        Some(m) => segment_until_marker(text, m.end()),
        None => {
            let first_marker = marker_offsets(text).into_iter().next().unwrap_or(text.len());
            &text[..first_marker]
        }
    };

    let thought = segment.trim();
    if thought.is_empty() {
        None
    } else {
        Some(thought.to_string())
    }
}

// ================= Tier 1: strict =================

fn strict_match(text: &str) -> Option<ParsedAction> {
    let captures = ACTION_LINE.captures(text)?;
    let line = captures.get(0)?;
    let (tool_name, _) = split_tool_name(captures.get(1)?.as_str())?;

    // The label must be the next section after the action line.
    let next_marker = marker_offsets(&text[line.end()..])
        .into_iter()
        .next()
        .map(|offset| offset + line.end())?;
    let input = ACTION_INPUT.find_at(text, next_marker)?;
    if input.start() != next_marker {
        return None;
    }

    let argument = clean_argument(segment_until_marker(text, input.end()));
    if argument.is_empty() {
        return None;
    }

    Some(ParsedAction::Invocation {
        tool_name,
        raw_argument_text: argument,
    })
}

// ================= Tier 2: tolerant =================

fn tolerant_match(text: &str) -> Option<ParsedAction> {
    let captures = ACTION_LINE.captures(text)?;
    let line = captures.get(0)?;
    let (tool_name, remainder) = split_tool_name(captures.get(1)?.as_str())?;

    let remainder = remainder
        .trim()
        .trim_start_matches(|c: char| c == ':' || c == '-' || c == '>' || c == '=')
        .trim();

    let argument = if !remainder.is_empty() {
        // Direct-call form: `company_tool(query="...")`
        if remainder.starts_with('(') && remainder.ends_with(')') {
            clean_argument(&remainder[1..remainder.len() - 1])
        } else {
            clean_argument(remainder)
        }
    } else {
        following_lines_argument(segment_until_marker(text, line.end()))
    };

    if argument.is_empty() {
        return None;
    }

    Some(ParsedAction::Invocation {
        tool_name,
        raw_argument_text: argument,
    })
}

/// Argument written on the lines after a bare `Action: name` line.
fn following_lines_argument(segment: &str) -> String {
    let body = segment.trim_start();
    if body.is_empty() {
        return String::new();
    }

    if body.starts_with('{') || body.starts_with('[') {
        if let Some(json) = balanced_json(body, 0) {
            return clean_argument(json);
        }
    }

    if body.starts_with("```") {
        return clean_argument(body);
    }

    // Plain text runs until the first blank line.
    let paragraph = body.split("\n\n").next().unwrap_or(body);
    clean_argument(paragraph)
}

// ================= Tier 3: salvage =================

fn salvage_match(text: &str) -> Option<ParsedAction> {
    let known = KNOWN_TOOL
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| (m.as_str().to_string(), m.end()));
    let loose = LOOSE_ACTION
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| (m.as_str().to_string(), m.end()));

    for (tool_name, after) in known.chain(loose) {
        if let Some(json) = balanced_json(text, after) {
            return Some(ParsedAction::Invocation {
                tool_name,
                raw_argument_text: json.trim().to_string(),
            });
        }
    }

    None
}

// ================= Helpers =================

fn split_tool_name(action_rest: &str) -> Option<(String, &str)> {
    let captures = TOOL_NAME.captures(action_rest.trim_start())?;
    let whole = captures.get(0)?;
    let name = captures.get(1)?.as_str().to_string();
    let trimmed = action_rest.trim_start();
    Some((name, &trimmed[whole.end()..]))
}

/// Byte offsets of every line that starts a ReAct section.
fn marker_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if MARKER.is_match(line) {
            offsets.push(offset);
        }
        offset += line.len();
    }
    offsets
}

/// Text from `start` up to the next marker line (exclusive).
fn segment_until_marker(text: &str, start: usize) -> &str {
    let rest = &text[start..];
    let mut offset = 0;
    for (i, line) in rest.split_inclusive('\n').enumerate() {
        // The first piece is the tail of the line we started on.
        if i > 0 && MARKER.is_match(line) {
            return &rest[..offset];
        }
        offset += line.len();
    }
    rest
}

fn clean_argument(raw: &str) -> String {
    let mut arg = raw.trim();

    if let Some(stripped) = arg.strip_prefix("```") {
        // Drop the info string (`json`) and the closing fence.
        let body = stripped.split_once('\n').map(|(_, b)| b).unwrap_or("");
        arg = body.trim_end().trim_end_matches("```").trim();
    }

    for quote in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            let inner = &arg[1..arg.len() - 1];
            if !inner.contains(quote) {
                arg = inner.trim();
            }
        }
    }

    arg.to_string()
}

/// First balanced `{...}` or `[...]` at or after `from`, string-aware.
fn balanced_json(text: &str, from: usize) -> Option<&str> {
    let rest = text.get(from..)?;
    let open_rel = rest.find(|c| c == '{' || c == '[')?;
    let start = from + open_rel;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}
