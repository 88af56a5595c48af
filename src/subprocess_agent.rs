//! Subprocess Agent (C5): wraps the external code-writing assistant.
//!
//! Spawn/soft-kill/grace-period/force-kill sequencing is taken from
//! `goose-conductor::child_manager::ChildManager::stop` (`start_kill` +
//! `tokio::time::timeout` + fallback `kill().await`); the Mock variant
//! generalizes the same state-machine shape with `tokio::time::sleep`
//! standing in for the subprocess wait. NDJSON buffering generalizes the
//! line-oriented framing `ipc_server::handle_unix_connection` gets for
//! free from `BufReader::lines()` on a socket, reimplemented here over a
//! raw byte stream so a line split across two chunks is still handled
//! correctly and `flush()` at EOF is under caller control.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::error::{AidosError, AidosResult};
use crate::events::{AidosEvent, EventBus};

/// Default per-agent execution timeout (spec §4.5), overridable by config.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Grace period between the soft and hard kill signal.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// One parsed content block within an `assistant`/`user` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Thinking { thinking: String },
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// One line of the assistant's NDJSON stdout, per spec §6's wire contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireLine {
    Assistant {
        message: WireMessage,
    },
    User {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    System,
    Result {
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
}

/// Event produced by [`StreamParser::feed`]/[`StreamParser::flush`],
/// translated by the agent to outward `agent:*` events.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    Thinking(String),
    Text(String),
    ToolUse { id: String, name: String },
    ToolResult { tool_use_id: String, is_error: bool },
    Progress(u8),
    Result {
        success: bool,
        message: Option<String>,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    /// An unrecognized or invalid line, surfaced as plain text.
    Unrecognized(String),
}

/// Buffers partial lines across chunks and dispatches complete lines as
/// parsed events. A line split across `feed` calls is only ever emitted
/// once the newline is observed, or on an explicit [`flush`].
#[derive(Default)]
pub struct StreamParser {
    buffer: String,
    tool_started: u64,
    tool_completed: u64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes (as UTF-8 text); returns every event
    /// produced by complete lines found in `chunk` combined with any
    /// carried-over partial line.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.trim().is_empty() {
                continue;
            }
            events.extend(self.parse_line(&line));
        }

        events
    }

    /// Flush any remaining partial-line buffer without a trailing
    /// newline — e.g. on stdout EOF. Per spec scenario 6, a clean feed of
    /// only whole lines yields no additional event on flush.
    pub fn flush(&mut self) -> Vec<ParsedEvent> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(&line)
    }

    fn parse_line(&mut self, line: &str) -> Vec<ParsedEvent> {
        let parsed: Result<WireLine, _> = serde_json::from_str(line);
        let Ok(wire) = parsed else {
            return vec![ParsedEvent::Unrecognized(line.to_string())];
        };

        match wire {
            WireLine::Assistant { message } => self.handle_message(message),
            WireLine::User { .. } | WireLine::System => Vec::new(),
            WireLine::Result {
                success,
                message,
                cost_usd,
                duration_ms,
            } => vec![ParsedEvent::Result {
                success,
                message,
                cost_usd,
                duration_ms,
            }],
        }
    }

    fn handle_message(&mut self, message: WireMessage) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        for block in message.content {
            match block {
                ContentBlock::Thinking { thinking } => events.push(ParsedEvent::Thinking(thinking)),
                ContentBlock::Text { text } => events.push(ParsedEvent::Text(text)),
                ContentBlock::ToolUse { id, name, .. } => {
                    self.tool_started += 1;
                    events.push(ParsedEvent::ToolUse { id, name });
                    events.push(ParsedEvent::Progress(self.progress_percent()));
                }
                ContentBlock::ToolResult { tool_use_id, is_error, .. } => {
                    self.tool_completed += 1;
                    events.push(ParsedEvent::ToolResult { tool_use_id, is_error });
                    events.push(ParsedEvent::Progress(self.progress_percent()));
                }
            }
        }
        events
    }

    fn progress_percent(&self) -> u8 {
        if self.tool_started == 0 {
            return 0;
        }
        ((self.tool_completed as f64 / self.tool_started as f64) * 100.0) as u8
    }
}

/// `cost_usd` to approximate token-count conversion, per spec §4.5:
/// `round(cost_usd / 0.01 * 1000)`.
pub fn approximate_tokens(cost_usd: f64) -> u64 {
    ((cost_usd / 0.01) * 1000.0).round() as u64
}

/// Outcome of a completed agent run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub execution_time_ms: u64,
}

/// Configuration for spawning the Subprocess variant.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_budget_usd: Option<f64>,
    pub timeout: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: "assistant".to_string(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_budget_usd: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Environment variable name fragments stripped before spawn so the
/// child's own auth configuration is never overridden by ours.
const STRIPPED_ENV_PREFIXES: &[&str] = &["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "AIDOS_API"];

fn build_args(config: &SpawnConfig) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if !config.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(config.allowed_tools.join(","));
    }
    if !config.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(config.disallowed_tools.join(","));
    }
    if let Some(budget) = config.max_budget_usd {
        args.push("--max-budget-usd".to_string());
        args.push(budget.to_string());
    }
    args
}

/// Either a mocked lifecycle or a real subprocess wrapping the external
/// assistant. Both implement the same run/stop surface.
pub enum SubprocessAgent {
    Mock {
        mission: String,
    },
    Subprocess {
        config: SpawnConfig,
        mission: String,
    },
}

impl SubprocessAgent {
    pub fn mock(mission: impl Into<String>) -> Self {
        Self::Mock { mission: mission.into() }
    }

    pub fn subprocess(config: SpawnConfig, mission: impl Into<String>) -> Self {
        Self::Subprocess {
            config,
            mission: mission.into(),
        }
    }

    /// Run to completion (or timeout), emitting translated `agent:*`
    /// events as NDJSON lines are parsed.
    pub async fn run(&self, agent_id: &str, events: &EventBus<AidosEvent>) -> AidosResult<RunOutcome> {
        match self {
            SubprocessAgent::Mock { mission } => self.run_mock(agent_id, mission, events).await,
            SubprocessAgent::Subprocess { config, mission } => {
                self.run_subprocess(agent_id, config, mission, events).await
            }
        }
    }

    async fn run_mock(
        &self,
        agent_id: &str,
        mission: &str,
        events: &EventBus<AidosEvent>,
    ) -> AidosResult<RunOutcome> {
        events.publish(AidosEvent::AgentThinking { agent_id: agent_id.to_string() });
        tokio::time::sleep(Duration::from_millis(20)).await;

        events.publish(AidosEvent::AgentExecuting {
            agent_id: agent_id.to_string(),
            tool: "mock_tool".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        events.publish(AidosEvent::AgentProgress { agent_id: agent_id.to_string(), percent: 100 });

        let output = format!("mock result for: {}", mission);
        events.publish(AidosEvent::AgentOutput {
            agent_id: agent_id.to_string(),
            text: output.clone(),
        });
        events.publish(AidosEvent::AgentCompleted { agent_id: agent_id.to_string() });

        Ok(RunOutcome {
            success: true,
            output,
            tokens_used: 500,
            execution_time_ms: 40,
        })
    }

    async fn run_subprocess(
        &self,
        agent_id: &str,
        config: &SpawnConfig,
        mission: &str,
        events: &EventBus<AidosEvent>,
    ) -> AidosResult<RunOutcome> {
        let args = build_args(config);
        let mut command = Command::new(&config.program);
        command
            .args(&args)
            .arg(mission)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for key in std::env::vars().map(|(k, _)| k) {
            if STRIPPED_ENV_PREFIXES.iter().any(|p| key.starts_with(p)) {
                command.env_remove(key);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| AidosError::AgentExecution(format!("failed to spawn agent process: {}", e)))?;

        let (tx, mut rx) = mpsc::channel::<ParsedEvent>(256);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AidosError::AgentExecution("subprocess stdout unavailable".to_string()))?;

        let read_task = tokio::spawn(async move {
            let mut parser = StreamParser::new();
            let mut chunks = ReaderStream::new(stdout);
            while let Some(chunk) = chunks.next().await {
                let Ok(bytes) = chunk else { break };
                let text = String::from_utf8_lossy(&bytes);
                for ev in parser.feed(&text) {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            for ev in parser.flush() {
                let _ = tx.send(ev).await;
            }
        });

        let mut output = String::new();
        let mut tool_count: u64 = 0;
        let mut tool_completed: u64 = 0;
        let mut total_tokens: u64 = 0;
        let mut total_execution_time_ms: u64 = 0;
        let mut final_result: Option<(bool, Option<String>)> = None;

        let wait = async {
            while let Some(ev) = rx.recv().await {
                match ev {
                    ParsedEvent::Thinking(_) => {
                        events.publish(AidosEvent::AgentThinking { agent_id: agent_id.to_string() });
                    }
                    ParsedEvent::Text(t) => {
                        output.push_str(&t);
                        events.publish(AidosEvent::AgentOutput { agent_id: agent_id.to_string(), text: t });
                    }
                    ParsedEvent::ToolUse { name, .. } => {
                        tool_count += 1;
                        events.publish(AidosEvent::AgentExecuting { agent_id: agent_id.to_string(), tool: name });
                    }
                    ParsedEvent::ToolResult { is_error, .. } => {
                        tool_completed += 1;
                        if is_error {
                            events.publish(AidosEvent::AgentError {
                                agent_id: agent_id.to_string(),
                                message: "tool reported an error".to_string(),
                            });
                        }
                    }
                    ParsedEvent::Progress(p) => {
                        events.publish(AidosEvent::AgentProgress { agent_id: agent_id.to_string(), percent: p });
                    }
                    ParsedEvent::Result { success, message, cost_usd, duration_ms } => {
                        if let Some(cost) = cost_usd {
                            total_tokens += approximate_tokens(cost);
                        }
                        if let Some(duration) = duration_ms {
                            total_execution_time_ms += duration;
                        }
                        final_result = Some((success, message));
                    }
                    ParsedEvent::Unrecognized(text) => {
                        events.publish(AidosEvent::AgentOutput { agent_id: agent_id.to_string(), text });
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(config.timeout, async {
            wait.await;
            let _ = read_task.await;
            child.wait().await
        })
        .await;

        let _ = tool_count;
        let _ = tool_completed;

        match outcome {
            Err(_) => {
                Self::terminate(&mut child).await;
                events.publish(AidosEvent::AgentError {
                    agent_id: agent_id.to_string(),
                    message: "agent execution timed out".to_string(),
                });
                Err(AidosError::AgentExecution("agent execution timed out".to_string()))
            }
            Ok(Err(e)) => Err(AidosError::AgentExecution(format!("failed to wait on subprocess: {}", e))),
            Ok(Ok(status)) => {
                let success = status.success() && final_result.map(|(s, _)| s).unwrap_or(status.success());
                if success {
                    events.publish(AidosEvent::AgentCompleted { agent_id: agent_id.to_string() });
                } else {
                    events.publish(AidosEvent::AgentError {
                        agent_id: agent_id.to_string(),
                        message: "agent process exited with a nonzero status".to_string(),
                    });
                }
                Ok(RunOutcome {
                    success,
                    output,
                    tokens_used: total_tokens,
                    execution_time_ms: total_execution_time_ms,
                })
            }
        }
    }

    /// Soft kill, 5s grace period, then force kill — mirrors
    /// `ChildManager::stop`.
    async fn terminate(child: &mut Child) {
        let _ = child.start_kill();
        if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
}

/// Environment variables a caller should strip before spawning, exposed
/// for callers that build their own `Command`.
pub fn stripped_env_keys(vars: &HashMap<String, String>) -> Vec<String> {
    vars.keys()
        .filter(|k| STRIPPED_ENV_PREFIXES.iter().any(|p| k.starts_with(p)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_line_across_two_chunks_yields_two_messages() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"result","success":true,"duration_ms":10}"#;
        let (a, b) = line.split_at(line.len() / 2);

        let mut events = parser.feed(a);
        assert!(events.is_empty());

        events.extend(parser.feed(&format!("{}\n{}\n", b, r#"{"type":"system"}"#)));
        let results: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ParsedEvent::Result { .. }))
            .collect();
        assert_eq!(results.len(), 1);

        let flushed = parser.flush();
        assert!(flushed.is_empty());
    }

    #[test]
    fn tool_use_then_result_reports_complete_progress() {
        let mut parser = StreamParser::new();
        let assistant = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"1","name":"edit","input":{}}]}}"#;
        let result = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_result","tool_use_id":"1","content":"ok"}]}}"#;
        parser.feed(&format!("{}\n", assistant));
        let events = parser.feed(&format!("{}\n", result));
        let last_progress = events.iter().rev().find_map(|e| match e {
            ParsedEvent::Progress(p) => Some(*p),
            _ => None,
        });
        assert_eq!(last_progress, Some(100));
    }

    #[test]
    fn unrecognized_line_is_surfaced_as_text() {
        let mut parser = StreamParser::new();
        let events = parser.feed("not json at all\n");
        assert!(matches!(events[0], ParsedEvent::Unrecognized(_)));
    }

    #[test]
    fn system_and_user_lines_are_ignored() {
        let mut parser = StreamParser::new();
        let events = parser.feed("{\"type\":\"system\"}\n{\"type\":\"user\"}\n");
        assert!(events.is_empty());
    }

    #[test]
    fn cost_to_token_approximation_matches_spec_formula() {
        assert_eq!(approximate_tokens(0.01), 1000);
        assert_eq!(approximate_tokens(0.0), 0);
    }

    #[tokio::test]
    async fn mock_agent_completes_successfully() {
        let events = EventBus::new();
        let agent = SubprocessAgent::mock("do something");
        let outcome = agent.run("agent-1", &events).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.tokens_used > 0);
    }
}
