//! Agent loop
//!
//! THINK → PARSE → ORCHESTRATE → OBSERVE → (repeat) → COMPOSE
//!
//! Strictly sequential per query: the next think step only starts after the
//! previous tool result has been committed to the state.

use crate::audit::{QueryArchive, QueryRecord};
use crate::composer::AnswerComposer;
use crate::config::AgentConfig;
use crate::llm::{ChatTurn, CompletionRequest, GeminiClient, LlmClient};
use crate::models::{ParsedAction, QueryResponse, Termination};
use crate::orchestrator::{StepOutcome, ToolChainOrchestrator};
use crate::parser;
use crate::prompt;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::ExecutionState;
use crate::tools::{create_default_registry, ToolRegistry};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a caller gets back from one query
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub audit_id: Uuid,
    pub response: QueryResponse,
}

pub struct HierarchicalAgent {
    llm: Arc<dyn LlmClient>,
    orchestrator: ToolChainOrchestrator,
    composer: AnswerComposer,
    archive: Arc<QueryArchive>,
    llm_retry: RetryPolicy,
    max_iterations: u32,
    max_parse_failures: u32,
}

impl HierarchicalAgent {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, config: &AgentConfig) -> Self {
        Self {
            llm,
            orchestrator: ToolChainOrchestrator::new(registry, config.tool_retry_policy()),
            composer: AnswerComposer::new(config.low_confidence_threshold),
            archive: Arc::new(QueryArchive::with_capacity(config.archive_capacity)),
            llm_retry: config.llm_retry_policy(),
            max_iterations: config.max_iterations.max(1),
            max_parse_failures: config.max_parse_failures,
        }
    }

    /// Gemini for the think step, the summary service for the tools
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let llm = GeminiClient::new(config.gemini_api_key.clone(), &config.gemini_model)?;
        let registry = create_default_registry(config)?;
        Ok(Self::new(Arc::new(llm), Arc::new(registry), config))
    }

    pub fn with_archive(mut self, archive: Arc<QueryArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn archive(&self) -> Arc<QueryArchive> {
        self.archive.clone()
    }

    pub async fn run_query(&self, query: &str) -> Result<QueryOutcome> {
        self.run_query_with_cancellation(query, CancellationToken::new())
            .await
    }

    /// Run one query; cancelling `cancel` stops further steps but still
    /// composes and archives whatever was collected.
    pub async fn run_query_with_cancellation(
        &self,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome> {
        let start_time = Instant::now();
        let mut state = ExecutionState::new(query);

        info!(
            query = %query,
            max_iterations = self.max_iterations,
            "Agent: starting query"
        );

        self.drive(&mut state, &cancel).await;

        let response = self.composer.compose(&state);
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        info!(
            status = %response.status,
            tool_calls = response.tool_sequence.len(),
            confidence = response.confidence,
            execution_time_ms,
            "Agent: query complete"
        );

        let record = QueryRecord::new(state, response.clone(), execution_time_ms);
        let audit_id = self.archive.record(record).await?;

        Ok(QueryOutcome { audit_id, response })
    }

    async fn drive(&self, state: &mut ExecutionState, cancel: &CancellationToken) {
        let system = prompt::system_instructions(
            &self.orchestrator.registry().describe(),
            self.max_iterations,
        );
        let mut history = vec![ChatTurn::user(prompt::opening_turn(state.query()))];
        let mut observation: Option<String> = None;
        let mut parse_failures = 0u32;

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "Agent: cancelled before think step");
                self.orchestrator.terminate(state, Termination::Cancelled);
                return;
            }

            // === THINK ===
            let request = CompletionRequest {
                system: system.clone(),
                messages: history.clone(),
                observation: observation.take(),
            };

            let llm: &dyn LlmClient = self.llm.as_ref();
            let request_ref = &request;
            let completion = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = with_retry(&self.llm_retry, "llm", || llm.complete(request_ref)) => Some(result),
            };

            let completion = match completion {
                None => {
                    info!(iteration, "Agent: cancelled during think step");
                    self.orchestrator.terminate(state, Termination::Cancelled);
                    return;
                }
                Some(Err(e)) => {
                    error!(iteration, error = %e, "Agent: LLM call failed");
                    self.orchestrator
                        .terminate(state, Termination::Failed(e.to_string()));
                    return;
                }
                Some(Ok(text)) => text,
            };

            if let Some(previous) = request.observation {
                history.push(ChatTurn::user(previous));
            }
            history.push(ChatTurn::assistant(completion.clone()));

            if let Some(thought) = parser::extract_thought(&completion) {
                debug!(iteration, thought = %thought, "Agent thought");
            }

            // === PARSE ===
            match parser::parse(&completion) {
                ParsedAction::FinalAnswer { text } => {
                    info!(iteration, "Agent: final answer accepted");
                    self.orchestrator.accept_final(state, text);
                    return;
                }
                ParsedAction::Unparseable { raw_text } => {
                    parse_failures += 1;
                    warn!(
                        iteration,
                        parse_failures,
                        chars = raw_text.len(),
                        "Agent: could not parse completion"
                    );
                    if parse_failures > self.max_parse_failures {
                        self.orchestrator
                            .terminate(state, Termination::ParseFailuresExhausted);
                        return;
                    }
                    observation = Some(prompt::format_correction(
                        parse_failures,
                        self.max_parse_failures,
                        &self.orchestrator.allowed_tools(state),
                    ));
                }
                ParsedAction::Invocation {
                    tool_name,
                    raw_argument_text,
                } => {
                    parse_failures = 0;
                    debug!(iteration, tool = %tool_name, "Agent: tool requested");

                    // === ORCHESTRATE ===
                    let step = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        outcome = self.orchestrator.handle_invocation(
                            state,
                            &tool_name,
                            &raw_argument_text,
                        ) => Some(outcome),
                    };

                    // === OBSERVE ===
                    match step {
                        None => {
                            info!(iteration, "Agent: cancelled during tool call");
                            self.orchestrator.terminate(state, Termination::Cancelled);
                            return;
                        }
                        Some(Ok(StepOutcome::Executed { key, result })) => {
                            observation = Some(prompt::result_observation(
                                &key,
                                &result,
                                &self.orchestrator.allowed_tools(state),
                            ));
                        }
                        Some(Ok(StepOutcome::Rejected(rejection))) => {
                            observation = Some(prompt::rejection_observation(
                                &rejection,
                                &self.orchestrator.allowed_tools(state),
                            ));
                        }
                        Some(Err(e)) => {
                            error!(iteration, tool = %tool_name, error = %e, "Agent: tool call failed");
                            self.orchestrator
                                .terminate(state, Termination::Failed(e.to_string()));
                            return;
                        }
                    }
                }
            }
        }

        warn!(
            max_iterations = self.max_iterations,
            "Agent: iteration limit reached, composing from collected results"
        );
        self.orchestrator
            .terminate(state, Termination::IterationsExhausted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::models::{QueryStatus, ToolName};
    use crate::tools::StaticTool;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn test_config() -> AgentConfig {
        AgentConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            llm_timeout: Duration::from_secs(2),
            tool_timeout: Duration::from_secs(2),
            ..AgentConfig::default()
        }
    }

    fn action(tool: &str, input: &str) -> String {
        format!(
            "Thought: I should call {}.\nAction: {}\nAction Input: {}",
            tool, tool, input
        )
    }

    fn final_answer(text: &str) -> String {
        format!("Thought: I can answer now.\nFinal Answer: {}", text)
    }

    fn registry(tools: Vec<StaticTool>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        Arc::new(registry)
    }

    fn agent_with(llm: Arc<ScriptedLlm>, tools: Vec<StaticTool>, config: &AgentConfig) -> HierarchicalAgent {
        HierarchicalAgent::new(llm, registry(tools), config)
    }

    fn sector(answer: &str, confidence: u8, ids: &[&str]) -> Value {
        json!({"answer": answer, "confidence": confidence, "relevant_identifiers": ids})
    }

    #[tokio::test]
    async fn test_full_hierarchy_run() {
        let llm = Arc::new(ScriptedLlm::new([
            action("sector_tool", r#"{"query": "semiconductors"}"#),
            action("company_tool", r#"{"query": "data center revenue", "company": "NVDA"}"#),
            action("document_tool", r#"{"query": "data center revenue"}"#),
            final_answer("NVIDIA's data center revenue was a record $18.4B in Q4."),
        ]));
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("Semis led by NVIDIA", 6, &["NVDA"])]),
            StaticTool::new(
                ToolName::Company,
                vec![json!({"answer": "Data center drove growth", "confidence": 7, "relevant_identifiers": ["D1"]})],
            ),
            StaticTool::new(
                ToolName::Document,
                vec![json!({
                    "answer": "Q4 data center revenue $18.4B",
                    "confidence": 9,
                    "evidence": [{"quote": "record data center revenue of $18.4 billion", "source": "D1"}]
                })],
            ),
        ];
        let agent = agent_with(llm.clone(), tools, &test_config());

        let outcome = agent.run_query("What was NVIDIA's Q4 data center revenue?").await.unwrap();
        let response = outcome.response;

        assert_eq!(response.status, QueryStatus::Success);
        assert_eq!(response.tool_sequence, vec!["sector_1", "company_1", "document_1"]);
        assert_eq!(response.confidence, 9);
        assert_eq!(response.evidence.len(), 1);
        assert!(response.result_text.starts_with("NVIDIA's data center revenue"));

        let requests = llm.requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[1]
            .observation
            .as_deref()
            .unwrap()
            .starts_with("Observation [sector_1]:"));

        let record = agent.archive().get(outcome.audit_id).await.unwrap().unwrap();
        assert!(record.state.is_terminal());
        assert_eq!(record.state.processed_identifiers().len(), 1);
    }

    #[tokio::test]
    async fn test_two_company_calls_both_reach_the_answer() {
        let llm = Arc::new(ScriptedLlm::new([
            action("sector_tool", r#"{"query": "AI leaders"}"#),
            action("company_tool", r#"{"query": "AI revenue", "company": "NVDA"}"#),
            action("company_tool", r#"{"query": "AI revenue", "company": "MSFT"}"#),
            final_answer("Both companies grew AI revenue."),
        ]));
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("Tech", 6, &["NVDA", "MSFT"])]),
            StaticTool::new(
                ToolName::Company,
                vec![
                    json!({"answer": "NVIDIA AI revenue rose 262%", "confidence": 7, "relevant_identifiers": []}),
                    json!({"answer": "Microsoft AI run-rate hit $13B", "confidence": 6, "relevant_identifiers": []}),
                ],
            ),
        ];
        let agent = agent_with(llm, tools, &test_config());

        let response = agent.run_query("Compare NVIDIA and Microsoft").await.unwrap().response;

        assert_eq!(response.tool_sequence, vec!["sector_1", "company_1", "company_2"]);
        assert!(response.result_text.contains("NVIDIA AI revenue rose 262%"));
        assert!(response.result_text.contains("Microsoft AI run-rate hit $13B"));
    }

    #[tokio::test]
    async fn test_no_data_answers_unavailable() {
        let llm = Arc::new(ScriptedLlm::new([
            action("sector_tool", r#"{"query": "robotaxi"}"#),
            action("company_tool", r#"{"query": "robotaxi revenue"}"#),
            final_answer("Robotaxi revenue was $3B."),
        ]));
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("", 0, &[])]),
            StaticTool::new(
                ToolName::Company,
                vec![json!({"answer": "", "confidence": 0, "relevant_identifiers": []})],
            ),
        ];
        let agent = agent_with(llm, tools, &test_config());

        let response = agent.run_query("Tesla robotaxi revenue?").await.unwrap().response;

        assert!(response.result_text.contains("I do not have access to the necessary data"));
        assert!(!response.result_text.contains("$3B"));
    }

    #[tokio::test]
    async fn test_iteration_limit_returns_partial() {
        let llm = Arc::new(
            ScriptedLlm::new([action("sector_tool", r#"{"query": "energy"}"#)])
                .repeating(action("company_tool", r#"{"query": "oil majors"}"#)),
        );
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("Energy", 4, &["XOM"])]),
            StaticTool::new(ToolName::Company, vec![]).repeating(json!({
                "answer": "Exxon upstream earnings fell",
                "confidence": 5,
                "relevant_identifiers": [],
                "evidence": [{"quote": "Upstream earnings decreased", "source": "XOM-10Q"}]
            })),
        ];
        let config = AgentConfig {
            max_iterations: 4,
            ..test_config()
        };
        let agent = agent_with(llm, tools, &config);

        let response = agent.run_query("How did oil majors do?").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Partial);
        assert!(!response.result_text.is_empty());
        assert!(response.result_text.contains("iteration limit"));
        assert_eq!(response.tool_sequence.len(), 4);
        assert!(!response.evidence.is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_is_recovered() {
        let llm = Arc::new(ScriptedLlm::new([
            "I think we should look at the sector first.".to_string(),
            action("sector_tool", r#"{"query": "banks"}"#),
            final_answer("Banks are stable."),
        ]));
        let tools = vec![StaticTool::new(
            ToolName::Sector,
            vec![sector("Banks stable", 6, &[])],
        )];
        let agent = agent_with(llm.clone(), tools, &test_config());

        let response = agent.run_query("How are banks?").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Success);
        assert_eq!(response.tool_sequence, vec!["sector_1"]);
        let correction = llm.requests()[1].observation.clone().unwrap();
        assert!(correction.contains("could not read your last response"));
    }

    #[tokio::test]
    async fn test_repeated_parse_failures_stop_the_run() {
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()).repeating("just rambling"));
        let config = AgentConfig {
            max_parse_failures: 2,
            ..test_config()
        };
        let agent = agent_with(llm.clone(), vec![], &config);

        let response = agent.run_query("q").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Error);
        assert_eq!(llm.requests().len(), 3);
        assert!(response.warnings[0].contains("unreadable output"));
    }

    #[tokio::test]
    async fn test_sequence_violation_is_fed_back() {
        let llm = Arc::new(ScriptedLlm::new([
            action("document_tool", r#"{"doc_ids": ["D9"]}"#),
            action("sector_tool", r#"{"query": "retail"}"#),
            final_answer("Retail is soft."),
        ]));
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("Retail soft", 6, &[])]),
            StaticTool::new(ToolName::Document, vec![]),
        ];
        let agent = agent_with(llm.clone(), tools, &test_config());

        let response = agent.run_query("Retail outlook?").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Success);
        assert_eq!(response.tool_sequence, vec!["sector_1"]);
        let feedback = llm.requests()[1].observation.clone().unwrap();
        assert!(feedback.contains("sequence violation"));
        assert!(feedback.contains("sector_tool"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let llm = Arc::new(ScriptedLlm::new([final_answer("never")]));
        let agent = agent_with(llm.clone(), vec![], &test_config());
        let token = CancellationToken::new();
        token.cancel();

        let response = agent
            .run_query_with_cancellation("q", token)
            .await
            .unwrap()
            .response;

        assert_eq!(response.status, QueryStatus::Error);
        assert!(llm.requests().is_empty());
    }

    /// Cancels the run from inside its second think step
    struct CancellingLlm {
        inner: ScriptedLlm,
        token: CancellationToken,
    }

    #[async_trait::async_trait]
    impl LlmClient for CancellingLlm {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            if request.observation.is_some() {
                self.token.cancel();
            }
            self.inner.complete(request).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_keeps_partial_work() {
        let token = CancellationToken::new();
        let llm = Arc::new(CancellingLlm {
            inner: ScriptedLlm::new([
                action("sector_tool", r#"{"query": "semis"}"#),
                action("company_tool", r#"{"query": "semis"}"#),
            ]),
            token: token.clone(),
        });
        let tools = vec![
            StaticTool::new(ToolName::Sector, vec![sector("Semis strong", 6, &["NVDA"])]),
            StaticTool::new(ToolName::Company, vec![sector("unused", 1, &[])]),
        ];
        let agent = HierarchicalAgent::new(llm, registry(tools), &test_config());

        let response = agent
            .run_query_with_cancellation("q", token)
            .await
            .unwrap()
            .response;

        assert_eq!(response.status, QueryStatus::Partial);
        assert_eq!(response.tool_sequence, vec!["sector_1"]);
        assert!(response.result_text.contains("Semis strong"));
        assert!(response.warnings[0].contains("cancelled"));
    }

    #[tokio::test]
    async fn test_tool_failure_after_progress_is_partial() {
        let llm = Arc::new(ScriptedLlm::new([
            action("sector_tool", r#"{"query": "semis"}"#),
            action("company_tool", r#"{"query": "gross margin", "company": "AMD"}"#),
        ]));
        let tools = vec![
            StaticTool::new(
                ToolName::Sector,
                vec![json!({
                    "answer": "AMD gaining accelerator share",
                    "confidence": 6,
                    "relevant_identifiers": ["AMD"],
                    "evidence": [{"quote": "MI300 ramp exceeded plan", "source": "SECTOR-SEMIS"}]
                })],
            ),
            StaticTool::new(ToolName::Company, vec![])
                .then_fail("summary service 503")
                .then_fail("summary service 503"),
        ];
        let agent = agent_with(llm, tools, &test_config());

        let response = agent.run_query("AMD gross margin?").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Partial);
        assert_eq!(response.tool_sequence, vec!["sector_1"]);
        assert_eq!(response.evidence.len(), 1);
        assert!(response.warnings[0].starts_with("run stopped"));
        assert!(response.warnings[0].contains("summary service 503"));
    }

    #[tokio::test]
    async fn test_archive_capacity_follows_config() {
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()).repeating(final_answer("ok")));
        let config = AgentConfig {
            archive_capacity: 1,
            ..test_config()
        };
        let agent = agent_with(llm, vec![], &config);

        let first = agent.run_query("first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = agent.run_query("second").await.unwrap();

        let archive = agent.archive();
        assert_eq!(archive.capacity(), 1);
        assert_eq!(archive.len().await, 1);
        assert!(archive.get(first.audit_id).await.unwrap().is_none());
        assert!(archive.get(second.audit_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_llm_failure_surfaces_as_error_status() {
        let llm = Arc::new(
            ScriptedLlm::new(Vec::<String>::new())
                .then_fail("upstream 503")
                .then_fail("upstream 503"),
        );
        let agent = agent_with(llm.clone(), vec![], &test_config());

        let response = agent.run_query("q").await.unwrap().response;

        assert_eq!(response.status, QueryStatus::Error);
        assert_eq!(llm.requests().len(), 2);
        assert!(response.warnings[0].contains("upstream 503"));
    }
}
