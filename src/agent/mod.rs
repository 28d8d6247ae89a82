//! Agent execution: one request/response turn over a toolkit session, with
//! token accounting.

pub mod tool_loop;

pub use tool_loop::{LoopOutcome, LoopStopReason, ToolLoop};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bridge::{ToolSession, TurnHandler};
use crate::error::AgentError;
use crate::llm::LlmProvider;
use crate::tokens::{TokenCounter, TokenUsage};

/// Result of one agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub response: String,
    pub token_usage: TokenUsage,
    pub completed_at: DateTime<Utc>,
}

/// Runs a single turn: count input, run the tool loop, count output.
pub struct AgentRunner {
    llm: Arc<dyn LlmProvider>,
    counter: Arc<TokenCounter>,
    tool_loop: ToolLoop,
}

impl AgentRunner {
    pub fn new(llm: Arc<dyn LlmProvider>, counter: Arc<TokenCounter>, max_iterations: usize) -> Self {
        Self {
            llm,
            counter,
            tool_loop: ToolLoop::new(max_iterations),
        }
    }
}

#[async_trait]
impl TurnHandler for AgentRunner {
    async fn run_turn(
        &self,
        session: &mut dyn ToolSession,
        message: &str,
    ) -> Result<AgentReply, AgentError> {
        let input_tokens = self.counter.count(message);

        let outcome = self.tool_loop.run(self.llm.as_ref(), session, message).await?;
        let response = response_text(&outcome);
        let output_tokens = self.counter.count(&response);

        info!(
            input_tokens,
            output_tokens,
            tool_calls = outcome.tool_calls,
            iterations = outcome.iterations,
            stop = ?outcome.stop_reason,
            "Agent turn complete"
        );

        Ok(AgentReply {
            response,
            token_usage: TokenUsage::new(input_tokens, output_tokens),
            completed_at: Utc::now(),
        })
    }
}

/// The model's final text, or a description of the loop's end state when it
/// produced none.
fn response_text(outcome: &LoopOutcome) -> String {
    match (&outcome.content, outcome.stop_reason) {
        (Some(text), _) => text.clone(),
        (None, LoopStopReason::Completed) => String::new(),
        (None, LoopStopReason::MaxIterations) => format!(
            "Stopped after {} steps without a final answer.",
            outcome.iterations
        ),
    }
}
