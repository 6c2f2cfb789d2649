//! Tool trait and registry
//!
//! The sector, company, document and evidence tools are external services.
//! The core only hands them a `ToolRequest` and gets back a loosely-typed JSON
//! value, which the validator turns into a `ToolResult`.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::models::ToolName;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

lazy_static! {
    static ref LEGACY_ID_LIST: Regex =
        Regex::new(r"(?i)\b(?:doc_ids|document_ids|identifiers)\s*=\s*\[([^\]]*)\]").unwrap();
    static ref LEGACY_CONTEXT: Regex = Regex::new(
        r#"(?i)\b(?:category_id|category|company|identifier|sector)\s*=\s*["']?([^,"'\s\]]+)"#
    )
    .unwrap();
    static ref LEGACY_KEY: Regex = Regex::new(r"(?i),?\s*\b[a-z_]+\s*=").unwrap();
}

/// Arguments for one tool call, as understood from the LLM's raw text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ToolRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
}

impl ToolRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Read the argument text of an `Action Input:`.
    ///
    /// Accepts a JSON object, the `query, category=ID` / `doc_ids=[a, b]`
    /// shorthand, or plain text. An empty query falls back to `fallback_query`.
    pub fn from_raw(raw: &str, fallback_query: &str) -> Self {
        let raw = raw.trim();

        let mut request = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self::from_object(&map),
            Ok(Value::String(text)) => Self::from_text(&text),
            _ => Self::from_text(raw),
        };

        if request.query.trim().is_empty() {
            request.query = fallback_query.to_string();
        }
        request
    }

    fn from_object(map: &serde_json::Map<String, Value>) -> Self {
        let query = ["query", "question", "input", "text"]
            .iter()
            .find_map(|k| map.get(*k).and_then(scalar_text))
            .unwrap_or_default();

        let context_identifier = [
            "identifier",
            "company",
            "category",
            "category_id",
            "sector",
            "department",
        ]
        .iter()
        .find_map(|k| map.get(*k).and_then(scalar_text))
        .filter(|id| !id.is_empty());

        let identifiers = ["doc_ids", "identifiers", "document_ids"]
            .iter()
            .find_map(|k| map.get(*k))
            .map(identifier_list)
            .unwrap_or_default();

        Self {
            query,
            context_identifier,
            identifiers,
        }
    }

    fn from_text(text: &str) -> Self {
        let text = text.trim();

        let identifiers = LEGACY_ID_LIST
            .captures(text)
            .map(|caps| split_identifiers(&caps[1]))
            .unwrap_or_default();
        let context_identifier = LEGACY_CONTEXT
            .captures(text)
            .map(|caps| caps[1].to_string());

        let query = match LEGACY_KEY.find(text) {
            Some(m) if !identifiers.is_empty() || context_identifier.is_some() => {
                text[..m.start()].trim().trim_end_matches(',').trim()
            }
            _ => text,
        };

        Self {
            query: query.trim_matches(|c| c == '"' || c == '\'').to_string(),
            context_identifier,
            identifiers,
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn identifier_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(scalar_text)
            .filter(|id| !id.is_empty())
            .collect(),
        Value::String(s) => split_identifiers(s),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn split_identifiers(list: &str) -> Vec<String> {
    list.split(',')
        .map(|id| id.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// One hierarchy level (or the evidence side-tool)
#[async_trait::async_trait]
pub trait HierarchyTool: Send + Sync {
    fn kind(&self) -> ToolName;
    fn description(&self) -> &'static str;
    async fn invoke(&self, request: &ToolRequest) -> Result<Value>;
}

/// Tool registry keyed by tool kind
pub struct ToolRegistry {
    tools: HashMap<ToolName, Arc<dyn HierarchyTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn HierarchyTool>) {
        self.tools.insert(tool.kind(), tool);
    }

    pub fn get(&self, kind: ToolName) -> Option<Arc<dyn HierarchyTool>> {
        self.tools.get(&kind).cloned()
    }

    /// Registered kinds in hierarchy order
    pub fn list(&self) -> Vec<ToolName> {
        ToolName::ALL
            .iter()
            .copied()
            .filter(|kind| self.tools.contains_key(kind))
            .collect()
    }

    pub fn describe(&self) -> Vec<(ToolName, &'static str)> {
        self.list()
            .into_iter()
            .filter_map(|kind| self.tools.get(&kind).map(|t| (kind, t.description())))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_description(kind: ToolName) -> &'static str {
    match kind {
        ToolName::Sector => {
            "Summarizes a sector and nominates the companies (category identifiers) worth inspecting"
        }
        ToolName::Company => {
            "Answers from one company's summary and nominates document identifiers when detail is needed"
        }
        ToolName::Document => "Reads the nominated documents and returns quoted evidence",
        ToolName::Evidence => "Looks up supporting news evidence for the question",
    }
}

#[derive(Clone)]
struct SummaryApiClient {
    client: Client,
    base_url: String,
}

impl SummaryApiClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &ToolRequest) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                AgentError::ToolExecution(format!("Summary API request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, path, &error_text));
        }

        response.json::<Value>().await.map_err(|e| {
            AgentError::ToolExecution(format!("Invalid JSON response from {}: {}", path, e))
        })
    }
}

/// Server errors and rate limits are transient; any other failure status is
/// a problem with the request itself.
fn status_error(status: StatusCode, path: &str, body: &str) -> AgentError {
    let message = format!("Summary API returned {} for {}: {}", status, path, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AgentError::ToolExecution(message)
    } else {
        AgentError::InvalidToolInput(message)
    }
}

/// Tool served by the summary service at `/api/v1/{tool}`
pub struct HttpSummaryTool {
    kind: ToolName,
    api: Option<SummaryApiClient>,
}

impl HttpSummaryTool {
    fn new(kind: ToolName, api: Option<SummaryApiClient>) -> Self {
        Self { kind, api }
    }
}

#[async_trait::async_trait]
impl HierarchyTool for HttpSummaryTool {
    fn kind(&self) -> ToolName {
        self.kind
    }

    fn description(&self) -> &'static str {
        default_description(self.kind)
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<Value> {
        let api = self.api.as_ref().ok_or_else(|| {
            AgentError::Config("SUMMARY_API_BASE_URL is not configured".to_string())
        })?;

        let path = format!("/api/v1/{}", self.kind.as_str());
        debug!(tool = %self.kind, %path, "Calling summary API");
        api.post_json(&path, request).await
    }
}

enum StaticStep {
    Output(Value),
    Fail(String),
}

/// Returns scripted raw outputs in order; for local runs and tests.
pub struct StaticTool {
    kind: ToolName,
    outputs: Mutex<VecDeque<StaticStep>>,
    repeat: Option<Value>,
    requests: Mutex<Vec<ToolRequest>>,
}

impl StaticTool {
    pub fn new<I>(kind: ToolName, outputs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            kind,
            outputs: Mutex::new(outputs.into_iter().map(StaticStep::Output).collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Return `output` for every call once the script runs out
    pub fn repeating(mut self, output: Value) -> Self {
        self.repeat = Some(output);
        self
    }

    /// Queue a transient failure after the outputs already scripted
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.push_back(StaticStep::Fail(message.into()));
        }
        self
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl HierarchyTool for StaticTool {
    fn kind(&self) -> ToolName {
        self.kind
    }

    fn description(&self) -> &'static str {
        default_description(self.kind)
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<Value> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let next = self
            .outputs
            .lock()
            .map_err(|_| AgentError::Config("static tool lock poisoned".to_string()))?
            .pop_front();

        match next {
            Some(StaticStep::Output(value)) => Ok(value),
            Some(StaticStep::Fail(message)) => Err(AgentError::ToolExecution(message)),
            None => self.repeat.clone().ok_or_else(|| {
                AgentError::Config(format!("{} tool has no scripted output left", self.kind))
            }),
        }
    }
}

/// Registry with every tool backed by the summary service.
pub fn create_default_registry(config: &AgentConfig) -> Result<ToolRegistry> {
    let api = config
        .summary_api_base_url
        .as_deref()
        .map(|url| SummaryApiClient::new(url, config.tool_timeout))
        .transpose()?;

    let mut registry = ToolRegistry::new();
    for kind in ToolName::ALL {
        registry.register(Arc::new(HttpSummaryTool::new(kind, api.clone())));
    }
    Ok(registry)
}
