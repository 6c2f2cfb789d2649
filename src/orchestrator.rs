//! Tool-chain orchestrator
//!
//! Owns the sector → company → document sequence. Given the current state and
//! a requested tool it either rejects the call (the rejection becomes the next
//! observation) or runs the tool, validates its output and commits the result.
//!
//! This is the only code that mutates an `ExecutionState`.

use crate::error::AgentError;
use crate::models::{Termination, ToolName, ToolResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{ExecutionState, Stage};
use crate::tools::{HierarchyTool, ToolRegistry, ToolRequest};
use crate::validation::validate;
use crate::Result;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// A tool request the orchestrator refused; recoverable, never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("sequence violation: {requested} cannot be called now; allowed next: {}", tool_list(.allowed))]
    SequenceViolation {
        requested: ToolName,
        allowed: Vec<ToolName>,
    },

    #[error("unknown tool '{requested}'; allowed next: {}", tool_list(.allowed))]
    UnknownTool {
        requested: String,
        allowed: Vec<ToolName>,
    },

    #[error("document_tool has no unprocessed document identifiers to read")]
    NothingToProcess,

    #[error("the run has already finished")]
    RunFinished,
}

fn tool_list(tools: &[ToolName]) -> String {
    if tools.is_empty() {
        return "none".to_string();
    }
    tools
        .iter()
        .map(|t| t.action_name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Executed { key: String, result: ToolResult },
    Rejected(Rejection),
}

pub struct ToolChainOrchestrator {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
}

impl ToolChainOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Tools the LLM may call from the current state
    pub fn allowed_tools(&self, state: &ExecutionState) -> Vec<ToolName> {
        match state.stage() {
            Stage::AwaitingSector => vec![ToolName::Sector],
            Stage::AwaitingCompany if state.company_consulted() => {
                vec![ToolName::Company, ToolName::Evidence]
            }
            Stage::AwaitingCompany => vec![ToolName::Company],
            Stage::AwaitingDocumentOrFinal if state.document_required() => {
                vec![ToolName::Document]
            }
            Stage::AwaitingDocumentOrFinal => ToolName::ALL.to_vec(),
            Stage::Terminal => Vec::new(),
        }
    }

    /// Check, run and commit one tool call.
    ///
    /// Returns `Err` only when the tool back-end failed after retries (or is
    /// not registered); the state is left untouched in that case.
    pub async fn handle_invocation(
        &self,
        state: &mut ExecutionState,
        tool_name: &str,
        raw_arguments: &str,
    ) -> Result<StepOutcome> {
        if state.is_terminal() {
            return Ok(StepOutcome::Rejected(Rejection::RunFinished));
        }

        let allowed = self.allowed_tools(state);
        let kind = match tool_name.parse::<ToolName>() {
            Ok(kind) => kind,
            Err(_) => {
                warn!(tool = tool_name, "Rejected unknown tool");
                return Ok(StepOutcome::Rejected(Rejection::UnknownTool {
                    requested: tool_name.trim().to_string(),
                    allowed,
                }));
            }
        };

        if !allowed.contains(&kind) {
            warn!(tool = %kind, stage = ?state.stage(), "Rejected out-of-sequence tool call");
            return Ok(StepOutcome::Rejected(Rejection::SequenceViolation {
                requested: kind,
                allowed,
            }));
        }

        let mut request = ToolRequest::from_raw(raw_arguments, state.query());
        match kind {
            ToolName::Company => {
                if request.context_identifier.is_none() {
                    request.context_identifier =
                        state.pending_for(ToolName::Company).into_iter().next();
                }
            }
            ToolName::Document => {
                let candidates = if request.identifiers.is_empty() {
                    state.pending_for(ToolName::Document)
                } else {
                    request.identifiers.clone()
                };
                request.identifiers = candidates
                    .into_iter()
                    .filter(|id| !state.processed_identifiers().contains(id))
                    .collect();
                if request.identifiers.is_empty() {
                    return Ok(StepOutcome::Rejected(Rejection::NothingToProcess));
                }
            }
            ToolName::Sector | ToolName::Evidence => {}
        }

        let tool = self
            .registry
            .get(kind)
            .ok_or_else(|| AgentError::ToolNotRegistered(kind.action_name().to_string()))?;
        let tool: &dyn HierarchyTool = tool.as_ref();
        let request_ref = &request;

        let raw = with_retry(&self.retry, kind.action_name(), || tool.invoke(request_ref)).await?;

        let result = validate(kind, &raw);
        if let Some(defect) = &result.validation_error {
            warn!(tool = %kind, defect = %defect, "Tool output failed validation, using defaults");
        }

        let key = state.record_result(result.clone());
        self.advance(state, kind, &request, &result);

        info!(
            tool = %kind,
            key = %key,
            confidence = result.confidence,
            identifiers = result.relevant_identifiers.len(),
            evidence = result.evidence.len(),
            stage = ?state.stage(),
            "Tool result committed"
        );

        Ok(StepOutcome::Executed { key, result })
    }

    fn advance(
        &self,
        state: &mut ExecutionState,
        kind: ToolName,
        request: &ToolRequest,
        result: &ToolResult,
    ) {
        match kind {
            ToolName::Sector => {
                state.nominate(&result.relevant_identifiers, ToolName::Company);
                if state.stage() == Stage::AwaitingSector {
                    state.set_stage(Stage::AwaitingCompany);
                }
            }
            ToolName::Company => {
                if let Some(id) = &request.context_identifier {
                    state.consume_identifier(id);
                }
                state.nominate(&result.relevant_identifiers, ToolName::Document);
                // Documents queued earlier by the evidence tool count too.
                if !state.pending_for(ToolName::Document).is_empty() {
                    state.set_document_required(true);
                    state.set_stage(Stage::AwaitingDocumentOrFinal);
                }
            }
            ToolName::Document => {
                state.mark_processed(&request.identifiers);
                state.nominate(&result.relevant_identifiers, ToolName::Document);
                state.set_document_required(false);
            }
            ToolName::Evidence => {
                state.nominate(&result.relevant_identifiers, ToolName::Document);
            }
        }
    }

    /// Accept a final answer; finishing is never blocked.
    pub fn accept_final(&self, state: &mut ExecutionState, text: impl Into<String>) {
        state.terminate(Termination::Finished, Some(text.into()));
    }

    /// Stop the run without a final answer from the LLM.
    pub fn terminate(&self, state: &mut ExecutionState, termination: Termination) {
        state.terminate(termination, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StaticTool;
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1))
    }

    fn orchestrator(tools: Vec<StaticTool>) -> ToolChainOrchestrator {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        ToolChainOrchestrator::new(Arc::new(registry), fast_retry())
    }

    fn sector_tool() -> StaticTool {
        StaticTool::new(ToolName::Sector, vec![]).repeating(json!({
            "thought": "semis",
            "answer": "Semiconductors: NVIDIA and AMD lead accelerators",
            "confidence": 6,
            "relevant_identifiers": ["NVDA", "AMD"]
        }))
    }

    fn company_with_docs() -> serde_json::Value {
        json!({
            "answer": "Data center revenue grew 409%",
            "confidence": 7,
            "relevant_identifiers": ["D1", "D2"]
        })
    }

    fn company_without_docs() -> serde_json::Value {
        json!({"answer": "", "confidence": 0, "relevant_identifiers": []})
    }

    fn document_tool() -> StaticTool {
        StaticTool::new(ToolName::Document, vec![]).repeating(json!({
            "answer": "Q4 data center revenue was $18.4B",
            "confidence": 9,
            "evidence": [{"quote": "Data center revenue was a record $18.4 billion", "source": "D1"}]
        }))
    }

    fn rejected(outcome: &StepOutcome) -> Option<&Rejection> {
        match outcome {
            StepOutcome::Rejected(r) => Some(r),
            StepOutcome::Executed { .. } => None,
        }
    }

    #[tokio::test]
    async fn test_sector_must_come_first() {
        let orch = orchestrator(vec![sector_tool(), document_tool()]);
        let mut state = ExecutionState::new("NVIDIA data center revenue?");

        let outcome = orch
            .handle_invocation(&mut state, "document_tool", r#"{"doc_ids": ["D1"]}"#)
            .await
            .unwrap();

        assert_eq!(
            rejected(&outcome),
            Some(&Rejection::SequenceViolation {
                requested: ToolName::Document,
                allowed: vec![ToolName::Sector],
            })
        );
        assert!(state.tool_sequence().is_empty());

        let outcome = orch
            .handle_invocation(&mut state, "sector_tool", "semiconductors")
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Executed { ref key, .. } if key == "sector_1"));
        assert_eq!(state.stage(), Stage::AwaitingCompany);
        assert_eq!(
            state.pending_for(ToolName::Company),
            vec!["AMD".to_string(), "NVDA".to_string()]
        );
    }

    #[tokio::test]
    async fn test_company_with_documents_forces_document_tool() {
        let company = StaticTool::new(ToolName::Company, vec![company_with_docs()]);
        let evidence = StaticTool::new(ToolName::Evidence, vec![json!({"evidence": []})]);
        let orch = orchestrator(vec![sector_tool(), company, document_tool(), evidence]);
        let mut state = ExecutionState::new("q");

        orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        orch.handle_invocation(&mut state, "company_tool", r#"{"query": "q", "company": "NVDA"}"#)
            .await
            .unwrap();

        assert!(state.document_required());
        assert_eq!(orch.allowed_tools(&state), vec![ToolName::Document]);
        assert!(!state.pending_identifiers().contains("NVDA"));

        let outcome = orch.handle_invocation(&mut state, "evidence_tool", "q").await.unwrap();
        assert!(matches!(
            rejected(&outcome),
            Some(Rejection::SequenceViolation { requested: ToolName::Evidence, .. })
        ));

        let outcome = orch.handle_invocation(&mut state, "document_tool", "q").await.unwrap();
        assert!(matches!(outcome, StepOutcome::Executed { ref key, .. } if key == "document_1"));
        assert!(state.processed_identifiers().contains("D1"));
        assert!(state.processed_identifiers().contains("D2"));
        assert!(state.pending_for(ToolName::Document).is_empty());
        assert_eq!(orch.allowed_tools(&state), ToolName::ALL.to_vec());
        assert_eq!(state.current_confidence(), 9);

        let again = orch.handle_invocation(&mut state, "document_tool", "q").await.unwrap();
        assert_eq!(rejected(&again), Some(&Rejection::NothingToProcess));
    }

    #[tokio::test]
    async fn test_company_without_documents_allows_evidence_or_more_companies() {
        let company = StaticTool::new(ToolName::Company, vec![]).repeating(company_without_docs());
        let evidence = StaticTool::new(
            ToolName::Evidence,
            vec![json!({"evidence": [{"quote": "AMD shipped MI300", "source": "news-1"}]})],
        );
        let orch = orchestrator(vec![sector_tool(), company, document_tool(), evidence]);
        let mut state = ExecutionState::new("q");

        orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        assert_eq!(orch.allowed_tools(&state), vec![ToolName::Company]);

        orch.handle_invocation(&mut state, "company_tool", "q").await.unwrap();
        assert_eq!(
            orch.allowed_tools(&state),
            vec![ToolName::Company, ToolName::Evidence]
        );
        assert_eq!(state.current_confidence(), 0);

        let doc = orch.handle_invocation(&mut state, "document_tool", "q").await.unwrap();
        assert!(rejected(&doc).is_some());

        let outcome = orch.handle_invocation(&mut state, "news_tool", "q").await.unwrap();
        assert!(matches!(outcome, StepOutcome::Executed { ref key, .. } if key == "evidence_1"));
        assert_eq!(state.evidence().len(), 1);
    }

    #[tokio::test]
    async fn test_company_naming_a_queued_document_forces_document_tool() {
        let company = StaticTool::new(
            ToolName::Company,
            vec![
                company_without_docs(),
                json!({"answer": "Robotaxi pilot in Austin", "confidence": 5, "relevant_identifiers": ["D1"]}),
            ],
        );
        let evidence = StaticTool::new(
            ToolName::Evidence,
            vec![json!({"evidence": [], "relevant_identifiers": ["D1"]})],
        );
        let orch = orchestrator(vec![sector_tool(), company, document_tool(), evidence]);
        let mut state = ExecutionState::new("q");

        orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        orch.handle_invocation(&mut state, "company_tool", "q").await.unwrap();
        orch.handle_invocation(&mut state, "evidence_tool", "q").await.unwrap();
        assert_eq!(state.pending_for(ToolName::Document), vec!["D1".to_string()]);

        orch.handle_invocation(&mut state, "company_tool", "q").await.unwrap();

        assert_eq!(state.stage(), Stage::AwaitingDocumentOrFinal);
        assert_eq!(orch.allowed_tools(&state), vec![ToolName::Document]);

        let outcome = orch.handle_invocation(&mut state, "document_tool", "q").await.unwrap();
        assert!(matches!(outcome, StepOutcome::Executed { ref key, .. } if key == "document_1"));
        assert!(state.processed_identifiers().contains("D1"));
    }

    #[tokio::test]
    async fn test_company_consumes_pending_identifier() {
        let company = StaticTool::new(ToolName::Company, vec![]).repeating(company_without_docs());
        let orch = orchestrator(vec![sector_tool(), company]);
        let mut state = ExecutionState::new("q");

        orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        orch.handle_invocation(&mut state, "company_tool", "q").await.unwrap();

        assert_eq!(state.pending_for(ToolName::Company), vec!["NVDA".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_company_calls_keep_every_result() {
        let company = StaticTool::new(
            ToolName::Company,
            vec![
                json!({"answer": "NVIDIA: data center up 409%", "confidence": 7, "relevant_identifiers": []}),
                json!({"answer": "Microsoft: Azure up 30%", "confidence": 6, "relevant_identifiers": []}),
            ],
        );
        let orch = orchestrator(vec![sector_tool(), company]);
        let mut state = ExecutionState::new("Compare NVIDIA and Microsoft");

        orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        orch.handle_invocation(&mut state, "company_tool", r#"{"company": "NVDA"}"#)
            .await
            .unwrap();
        orch.handle_invocation(&mut state, "company_tool", r#"{"company": "MSFT"}"#)
            .await
            .unwrap();

        assert_eq!(state.invocation_count(ToolName::Company), 2);
        assert!(state.result("company_1").unwrap().answer.contains("NVIDIA"));
        assert!(state.result("company_2").unwrap().answer.contains("Microsoft"));
        assert!(state.counts_consistent());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let orch = orchestrator(vec![sector_tool()]);
        let mut state = ExecutionState::new("q");

        let outcome = orch.handle_invocation(&mut state, "sql_tool", "SELECT 1").await.unwrap();
        assert!(matches!(
            rejected(&outcome),
            Some(Rejection::UnknownTool { requested, .. }) if requested == "sql_tool"
        ));
    }

    #[tokio::test]
    async fn test_tool_failure_leaves_state_untouched() {
        let sector = StaticTool::new(ToolName::Sector, vec![])
            .then_fail("503")
            .then_fail("503");
        let orch = orchestrator(vec![sector]);
        let mut state = ExecutionState::new("q");

        let result = orch.handle_invocation(&mut state, "sector_tool", "q").await;

        assert!(matches!(result, Err(AgentError::ToolExecution(_))));
        assert_eq!(state.invocation_count(ToolName::Sector), 0);
        assert_eq!(state.stage(), Stage::AwaitingSector);
    }

    #[tokio::test]
    async fn test_validation_defect_is_stored_not_dropped() {
        let sector = StaticTool::new(ToolName::Sector, vec![json!({"confidence": "high"})]);
        let orch = orchestrator(vec![sector]);
        let mut state = ExecutionState::new("q");

        let outcome = orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();

        match outcome {
            StepOutcome::Executed { key, result } => {
                assert_eq!(key, "sector_1");
                assert!(result.validation_error.is_some());
                assert_eq!(result.confidence, 0);
            }
            other => panic!("expected execution, got {:?}", other),
        }
        assert_eq!(state.validation_warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_final_answer_is_never_blocked() {
        let orch = orchestrator(vec![sector_tool()]);
        let mut state = ExecutionState::new("q");

        orch.accept_final(&mut state, "No data.");

        assert!(state.is_terminal());
        assert_eq!(state.final_answer(), Some("No data."));
        assert!(orch.allowed_tools(&state).is_empty());

        let outcome = orch.handle_invocation(&mut state, "sector_tool", "q").await.unwrap();
        assert_eq!(rejected(&outcome), Some(&Rejection::RunFinished));
    }
}
