//! Adapter from rig's `CompletionModel` to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message, ToolResultContent, UserContent};
use rig::one_or_many::OneOrMany;

use super::provider::{
    ChatMessage, FinishReason, LlmProvider, Role, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};
use crate::error::LlmError;

/// Wraps any rig completion model behind [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

/// Split a conversation into rig's preamble and message history.
///
/// System messages become the preamble. Assistant turns carry their tool
/// calls; tool results go back as user content keyed by call id.
fn to_rig_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Message>) {
    let mut preamble: Vec<&str> = Vec::new();
    let mut history = Vec::new();

    for msg in messages {
        let text = msg.content.as_deref().unwrap_or_default();
        match msg.role {
            Role::System => preamble.push(text),
            Role::User => history.push(Message::user(text)),
            Role::Assistant => {
                let mut content = Vec::new();
                if !text.is_empty() {
                    content.push(AssistantContent::text(text));
                }
                content.extend(msg.tool_calls.iter().map(|call| {
                    AssistantContent::tool_call(&call.id, &call.name, call.arguments.clone())
                }));
                if let Ok(content) = OneOrMany::many(content) {
                    history.push(Message::Assistant { id: None, content });
                }
            }
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                history.push(Message::User {
                    content: OneOrMany::one(UserContent::tool_result(
                        id,
                        OneOrMany::one(ToolResultContent::text(text)),
                    )),
                });
            }
        }
    }

    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
    (preamble, history)
}

fn to_rig_tool(tool: &ToolDefinition) -> rig::completion::ToolDefinition {
    rig::completion::ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

/// Collect the text and tool calls of one model turn.
fn from_rig_choice(choice: OneOrMany<AssistantContent>) -> (Option<String>, Vec<ToolCall>) {
    let mut text = Vec::new();
    let mut calls = Vec::new();
    for item in choice {
        match item {
            AssistantContent::Text(t) => text.push(t.text),
            AssistantContent::ToolCall(call) => calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            }),
            _ => {}
        }
    }
    let text = text.join("");
    ((!text.is_empty()).then_some(text), calls)
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let (preamble, mut history) = to_rig_messages(&request.messages);
        let prompt = history.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "empty conversation".to_string(),
        })?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .tools(request.tools.iter().map(to_rig_tool).collect());
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: e.to_string(),
        })?;

        let (content, tool_calls) = from_rig_choice(response.choice);
        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        };
        Ok(ToolCompletionResponse {
            content,
            tool_calls,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: "search_gmail".to_string(),
            arguments: serde_json::json!({"query": "is:unread"}),
        }
    }

    #[test]
    fn system_messages_become_preamble() {
        let (preamble, history) = to_rig_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
        ]);
        assert_eq!(preamble.as_deref(), Some("be brief"));
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], Message::User { .. }));
    }

    #[test]
    fn tool_round_trip_keeps_call_ids() {
        let (_, history) = to_rig_messages(&[
            ChatMessage::user("check mail"),
            ChatMessage::assistant_with_tool_calls(None, vec![call()]),
            ChatMessage::tool_result("call_1", "search_gmail", "3 messages"),
        ]);
        assert_eq!(history.len(), 3);

        let Message::Assistant { content, .. } = &history[1] else {
            panic!("expected assistant turn");
        };
        match content.first() {
            AssistantContent::ToolCall(tc) => {
                assert_eq!(tc.id, "call_1");
                assert_eq!(tc.function.name, "search_gmail");
                assert_eq!(tc.function.arguments["query"], "is:unread");
            }
            other => panic!("unexpected content {other:?}"),
        }

        let Message::User { content } = &history[2] else {
            panic!("expected tool result");
        };
        match content.first() {
            UserContent::ToolResult(result) => assert_eq!(result.id, "call_1"),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn assistant_text_and_calls_share_a_turn() {
        let (_, history) = to_rig_messages(&[
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls(Some("looking".to_string()), vec![call()]),
        ]);
        let Message::Assistant { content, .. } = &history[1] else {
            panic!("expected assistant turn");
        };
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn choice_splits_text_from_tool_calls() {
        let choice = OneOrMany::many(vec![
            AssistantContent::text("Checking "),
            AssistantContent::text("now."),
            AssistantContent::tool_call("call_9", "list_files", serde_json::json!({"limit": 3})),
        ])
        .unwrap();
        let (text, calls) = from_rig_choice(choice);
        assert_eq!(text.as_deref(), Some("Checking now."));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].arguments["limit"], 3);
    }

    #[test]
    fn tool_only_choice_has_no_text() {
        let choice = OneOrMany::one(AssistantContent::tool_call(
            "c",
            "t",
            serde_json::json!({}),
        ));
        let (text, calls) = from_rig_choice(choice);
        assert!(text.is_none());
        assert_eq!(calls[0].name, "t");
    }

    #[test]
    fn token_counts_saturate() {
        assert_eq!(saturate(42), 42);
        assert_eq!(saturate(u64::MAX), u32::MAX);
    }
}
