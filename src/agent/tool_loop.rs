//! Model ⇄ tool loop over a toolkit session.

use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::ToolSession;
use crate::error::AgentError;
use crate::llm::{ChatMessage, LlmProvider, ToolCompletionRequest};

/// Absolute upper bound on model round-trips, regardless of configuration.
pub(crate) const TOOL_LOOP_HARD_CAP: usize = 25;

const SYSTEM_PROMPT: &str = "\
You are an assistant with delegated access to the user's Google Workspace \
through the tools provided. Only use the tools you are given. If a request \
needs access that none of your tools provide, say so plainly instead of \
guessing. Use markdown to format your answers.";

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStopReason {
    /// The model answered without requesting tools.
    Completed,
    /// The iteration cap was reached; the last text is returned as-is.
    MaxIterations,
}

/// Result of one loop run.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Final assistant text, if the model produced any.
    pub content: Option<String>,
    /// Number of tool invocations executed.
    pub tool_calls: usize,
    pub iterations: usize,
    pub stop_reason: LoopStopReason,
}

/// Drives one request through the model, executing requested tools on the
/// session until the model answers.
pub struct ToolLoop {
    max_iterations: usize,
}

impl ToolLoop {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.clamp(1, TOOL_LOOP_HARD_CAP),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub async fn run(
        &self,
        llm: &dyn LlmProvider,
        session: &mut dyn ToolSession,
        message: &str,
    ) -> Result<LoopOutcome, AgentError> {
        let tools = session.list_tools().await?;
        debug!(tools = tools.len(), model = llm.model_name(), "Starting tool loop");

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(message)];
        let mut tool_calls = 0usize;

        for iteration in 1..=self.max_iterations {
            let request = ToolCompletionRequest::new(messages.clone(), tools.clone());
            let response = llm
                .complete_with_tools(request)
                .await
                .map_err(|e| AgentError::Execution(e.to_string()))?;

            debug!(
                iteration,
                finish_reason = ?response.finish_reason,
                tool_calls = response.tool_calls.len(),
                "Model responded"
            );
            if response.tool_calls.is_empty() {
                return Ok(LoopOutcome {
                    content: response.content,
                    tool_calls,
                    iterations: iteration,
                    stop_reason: LoopStopReason::Completed,
                });
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                tool_calls += 1;
                let output = session.call_tool(&call.name, normalize_arguments(&call.arguments)).await?;
                if output.is_error {
                    debug!(tool = %call.name, "Tool reported an error");
                }
                let content = if output.is_error {
                    format!("Error: {}", output.text)
                } else {
                    output.text
                };
                messages.push(ChatMessage::tool_result(&call.id, &call.name, content));
            }
        }

        warn!(
            max_iterations = self.max_iterations,
            tool_calls, "Tool loop hit its iteration cap"
        );
        Ok(LoopOutcome {
            content: last_assistant_text(&messages),
            tool_calls,
            iterations: self.max_iterations,
            stop_reason: LoopStopReason::MaxIterations,
        })
    }
}

/// Tool arguments must be an object on the wire.
fn normalize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::Null => Value::Object(Default::default()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => v,
            _ => serde_json::json!({ "input": raw }),
        },
        other => serde_json::json!({ "input": other }),
    }
}

fn last_assistant_text(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == crate::llm::Role::Assistant)
        .find_map(|m| m.content.clone().filter(|c| !c.is_empty()))
}
