//! Per-query execution state
//!
//! One `ExecutionState` exists per query. Reads are public; every mutation is
//! crate-private and performed by the orchestrator. Per-call result keys are
//! minted here, so repeated calls to one tool can never overwrite each other.

use crate::models::{EvidenceItem, Termination, ToolCallRecord, ToolName, ToolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where the run sits in the sector → company → document hierarchy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AwaitingSector,
    AwaitingCompany,
    AwaitingDocumentOrFinal,
    Terminal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    query: String,
    stage: Stage,
    tool_sequence: Vec<ToolCallRecord>,
    invocation_counts: BTreeMap<ToolName, u32>,
    results: BTreeMap<String, ToolResult>,
    /// identifier → the tool expected to consume it
    pending_identifiers: BTreeMap<String, ToolName>,
    processed_identifiers: BTreeSet<String>,
    current_confidence: u8,
    /// Set when a company result nominated documents that still need fetching
    document_required: bool,
    final_answer: Option<String>,
    termination: Option<Termination>,
    started_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            stage: Stage::AwaitingSector,
            tool_sequence: Vec::new(),
            invocation_counts: BTreeMap::new(),
            results: BTreeMap::new(),
            pending_identifiers: BTreeMap::new(),
            processed_identifiers: BTreeSet::new(),
            current_confidence: 0,
            document_required: false,
            final_answer: None,
            termination: None,
            started_at: Utc::now(),
        }
    }

    // ================= Reads =================

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn tool_sequence(&self) -> &[ToolCallRecord] {
        &self.tool_sequence
    }

    pub fn invocation_count(&self, tool: ToolName) -> u32 {
        self.invocation_counts.get(&tool).copied().unwrap_or(0)
    }

    pub fn results(&self) -> &BTreeMap<String, ToolResult> {
        &self.results
    }

    pub fn result(&self, key: &str) -> Option<&ToolResult> {
        self.results.get(key)
    }

    /// Every stored result of one tool, in invocation order
    pub fn results_for(&self, tool: ToolName) -> Vec<(String, &ToolResult)> {
        (1..=self.invocation_count(tool))
            .filter_map(|n| {
                let key = tool.call_key(n);
                self.results.get(&key).map(|result| (key, result))
            })
            .collect()
    }

    pub fn pending_identifiers(&self) -> BTreeSet<String> {
        self.pending_identifiers.keys().cloned().collect()
    }

    /// Pending identifiers meant for one tool, in sorted order
    pub fn pending_for(&self, tool: ToolName) -> Vec<String> {
        self.pending_identifiers
            .iter()
            .filter(|(_, consumer)| **consumer == tool)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn processed_identifiers(&self) -> &BTreeSet<String> {
        &self.processed_identifiers
    }

    pub fn current_confidence(&self) -> u8 {
        self.current_confidence
    }

    pub fn document_required(&self) -> bool {
        self.document_required
    }

    pub fn company_consulted(&self) -> bool {
        self.invocation_count(ToolName::Company) > 0
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.termination.is_some()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn has_progress(&self) -> bool {
        !self.results.is_empty()
    }

    /// All evidence collected so far, in call order
    pub fn evidence(&self) -> Vec<EvidenceItem> {
        self.tool_sequence
            .iter()
            .filter_map(|call| self.results.get(&call.key()))
            .flat_map(|result| result.evidence.iter().cloned())
            .collect()
    }

    /// Validation defects of stored results, prefixed with their keys
    pub fn validation_warnings(&self) -> Vec<String> {
        self.tool_sequence
            .iter()
            .filter_map(|call| {
                let key = call.key();
                self.results
                    .get(&key)
                    .and_then(|r| r.validation_error.as_ref())
                    .map(|error| format!("{}: {}", key, error))
            })
            .collect()
    }

    /// `invocation_counts[t]` equals the number of stored `t_*` results
    pub fn counts_consistent(&self) -> bool {
        ToolName::ALL.iter().all(|tool| {
            let prefix = format!("{}_", tool.as_str());
            let stored = self.results.keys().filter(|k| k.starts_with(&prefix)).count();
            stored as u32 == self.invocation_count(*tool)
        })
    }

    // ================= Orchestrator-only mutation =================

    /// Store a validated result under a fresh per-call key and log the call.
    pub(crate) fn record_result(&mut self, result: ToolResult) -> String {
        let tool = result.tool_name;
        let count = self.invocation_counts.entry(tool).or_insert(0);
        *count += 1;
        let invocation_index = *count;

        let key = tool.call_key(invocation_index);
        self.current_confidence = result.confidence;
        self.results.insert(key.clone(), result);
        self.tool_sequence.push(ToolCallRecord {
            tool_name: tool,
            invocation_index,
            timestamp: Utc::now(),
        });

        key
    }

    /// Queue identifiers for `consumer`; returns the ones newly queued.
    /// Documents that were already fetched are not queued again.
    pub(crate) fn nominate(&mut self, identifiers: &[String], consumer: ToolName) -> Vec<String> {
        let mut added = Vec::new();
        for id in identifiers {
            if consumer == ToolName::Document && self.processed_identifiers.contains(id) {
                continue;
            }
            if self.pending_identifiers.insert(id.clone(), consumer).is_none() {
                added.push(id.clone());
            }
        }
        added
    }

    pub(crate) fn consume_identifier(&mut self, id: &str) -> bool {
        self.pending_identifiers.remove(id).is_some()
    }

    /// Move fetched documents from pending to processed.
    pub(crate) fn mark_processed(&mut self, identifiers: &[String]) {
        for id in identifiers {
            self.pending_identifiers.remove(id);
            self.processed_identifiers.insert(id.clone());
        }
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub(crate) fn set_document_required(&mut self, required: bool) {
        self.document_required = required;
    }

    pub(crate) fn terminate(&mut self, termination: Termination, final_answer: Option<String>) {
        if self.termination.is_some() {
            return;
        }
        self.stage = Stage::Terminal;
        self.final_answer = final_answer;
        self.termination = Some(termination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tool: ToolName, answer: &str, confidence: u8) -> ToolResult {
        ToolResult {
            tool_name: tool,
            thought: String::new(),
            answer: answer.to_string(),
            confidence,
            relevant_identifiers: vec![],
            evidence: vec![],
            validation_error: None,
        }
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = ExecutionState::new("What was NVIDIA's data center revenue?");
        assert!(state.results().is_empty());
        assert!(state.tool_sequence().is_empty());
        assert!(ToolName::ALL.iter().all(|t| state.invocation_count(*t) == 0));
        assert_eq!(state.current_confidence(), 0);
        assert_eq!(state.stage(), Stage::AwaitingSector);
        assert!(!state.is_terminal());
        assert!(state.counts_consistent());
    }

    #[test]
    fn test_repeated_calls_get_distinct_keys() {
        let mut state = ExecutionState::new("q");
        let first = state.record_result(result(ToolName::Company, "NVIDIA", 7));
        let second = state.record_result(result(ToolName::Company, "Microsoft", 5));

        assert_eq!(first, "company_1");
        assert_eq!(second, "company_2");
        assert_eq!(state.results().len(), 2);
        assert_eq!(state.invocation_count(ToolName::Company), 2);
        assert_eq!(state.current_confidence(), 5);
        assert!(state.counts_consistent());

        let answers: Vec<_> = state
            .results_for(ToolName::Company)
            .into_iter()
            .map(|(_, r)| r.answer.clone())
            .collect();
        assert_eq!(answers, vec!["NVIDIA", "Microsoft"]);
    }

    #[test]
    fn test_processed_documents_are_not_renominated() {
        let mut state = ExecutionState::new("q");
        let ids = vec!["D1".to_string(), "D2".to_string()];
        assert_eq!(state.nominate(&ids, ToolName::Document), ids);

        state.mark_processed(&ids[..1]);
        assert_eq!(state.pending_for(ToolName::Document), vec!["D2".to_string()]);
        assert!(state.processed_identifiers().contains("D1"));

        let again = state.nominate(&["D1".to_string(), "D3".to_string()], ToolName::Document);
        assert_eq!(again, vec!["D3".to_string()]);
    }

    #[test]
    fn test_terminate_is_sticky() {
        let mut state = ExecutionState::new("q");
        state.terminate(Termination::Finished, Some("done".into()));
        state.terminate(Termination::Cancelled, None);

        assert_eq!(state.termination(), Some(&Termination::Finished));
        assert_eq!(state.final_answer(), Some("done"));
        assert_eq!(state.stage(), Stage::Terminal);
    }
}
