//! Core data models for the hierarchical retrieval agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

//
// ================= Tools =================
//

/// The tools the orchestrator knows about. Sector, company and document are the
/// three hierarchy levels; evidence is the ancillary side-tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Sector,
    Company,
    Document,
    Evidence,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::Sector,
        ToolName::Company,
        ToolName::Document,
        ToolName::Evidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Sector => "sector",
            ToolName::Company => "company",
            ToolName::Document => "document",
            ToolName::Evidence => "evidence",
        }
    }

    /// Name the LLM is told to use in `Action:` lines
    pub fn action_name(&self) -> &'static str {
        match self {
            ToolName::Sector => "sector_tool",
            ToolName::Company => "company_tool",
            ToolName::Document => "document_tool",
            ToolName::Evidence => "evidence_tool",
        }
    }

    /// Unique per-call key for the n-th successful invocation (1-based)
    pub fn call_key(&self, n: u32) -> String {
        format!("{}_{}", self.as_str(), n)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .trim_matches(|c| c == '`' || c == '*' || c == '"' || c == '\'')
            .to_lowercase()
            .replace(['-', ' '], "_");

        match normalized.as_str() {
            "sector" | "sector_tool" | "department" | "department_tool" => Ok(ToolName::Sector),
            "company" | "company_tool" | "category" | "category_tool" => Ok(ToolName::Company),
            "document" | "document_tool" | "doc_tool" | "doc" => Ok(ToolName::Document),
            "evidence" | "evidence_tool" | "news" | "news_tool" => Ok(ToolName::Evidence),
            _ => Err(format!("unknown tool '{}'", s.trim())),
        }
    }
}

//
// ================= Tool Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    pub quote: String,
    pub source: String,
}

/// Validated output of one tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_name: ToolName,
    pub thought: String,
    pub answer: String,
    pub confidence: u8,
    pub relevant_identifiers: Vec<String>,
    pub evidence: Vec<EvidenceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl ToolResult {
    pub fn is_valid(&self) -> bool {
        self.validation_error.is_none()
    }
}

//
// ================= Parsing =================
//

/// Structured reading of one LLM completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAction {
    Invocation {
        tool_name: String,
        raw_argument_text: String,
    },
    FinalAnswer {
        text: String,
    },
    Unparseable {
        raw_text: String,
    },
}

//
// ================= Execution Log =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: ToolName,
    pub invocation_index: u32,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn key(&self) -> String {
        self.tool_name.call_key(self.invocation_index)
    }
}

/// Why a run stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    Finished,
    IterationsExhausted,
    ParseFailuresExhausted,
    Cancelled,
    Failed(String),
}

impl Termination {
    pub fn is_forced(&self) -> bool {
        !matches!(self, Termination::Finished)
    }

    pub fn describe(&self) -> String {
        match self {
            Termination::Finished => "the agent finished".to_string(),
            Termination::IterationsExhausted => "the iteration limit was reached".to_string(),
            Termination::ParseFailuresExhausted => {
                "the model repeatedly produced unreadable output".to_string()
            }
            Termination::Cancelled => "the request was cancelled".to_string(),
            Termination::Failed(reason) => format!("a tool or model call failed: {}", reason),
        }
    }
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Partial,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStatus::Success => "success",
            QueryStatus::Partial => "partial",
            QueryStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: QueryStatus,
    pub result_text: String,
    pub evidence: Vec<EvidenceItem>,
    pub confidence: u8,
    pub tool_sequence: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_name_aliases() {
        assert_eq!("department_tool".parse::<ToolName>(), Ok(ToolName::Sector));
        assert_eq!("Category_Tool".parse::<ToolName>(), Ok(ToolName::Company));
        assert_eq!("`document_tool`".parse::<ToolName>(), Ok(ToolName::Document));
        assert_eq!("news-tool".parse::<ToolName>(), Ok(ToolName::Evidence));
        assert!("sql_tool".parse::<ToolName>().is_err());
    }

    #[test]
    fn test_call_key() {
        assert_eq!(ToolName::Company.call_key(2), "company_2");
    }
}
