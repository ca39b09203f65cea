use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::control::RELOAD_SENTINEL;
use crate::history::History;
use crate::model::{ChatModel, Message, ModelRequest, ToolCall};
use crate::telemetry::TelemetrySink;
use crate::tools::{ToolSet, tool_error_payload};

const TOOL_RESULT_MAX_CHARS: usize = 24_000;

/// One model binding over one tool set.
pub struct AgentRunner {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolSet>,
    system_prompt: String,
    max_tool_rounds: usize,
    tool_timeout: Duration,
    telemetry: TelemetrySink,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOutput {
    pub text: String,
    pub tool_calls: usize,
}

impl AgentRunner {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolSet>,
        system_prompt: String,
        max_tool_rounds: usize,
        tool_timeout: Duration,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            model,
            tools,
            system_prompt,
            max_tool_rounds: max_tool_rounds.max(1),
            tool_timeout,
            telemetry,
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn tools(&self) -> &Arc<ToolSet> {
        &self.tools
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Runs one model turn: tool calls are executed in order until the model
    /// answers with text. A tool result carrying the reload sentinel ends the
    /// turn at once; later calls of that round are not executed.
    pub async fn invoke(&self, input: &str, history: &History) -> Result<RunnerOutput> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend(history.messages());
        messages.push(Message::user(input));

        let specs = self.tools.specs();
        let mut tool_calls = 0usize;

        for round in 0..self.max_tool_rounds {
            let request = ModelRequest {
                messages: messages.clone(),
                tools: specs.clone(),
            };
            let reply = self
                .model
                .complete(&request)
                .await
                .with_context(|| format!("model call failed ({})", self.model.name()))?;

            if reply.tool_calls.is_empty() {
                return Ok(RunnerOutput {
                    text: reply.content,
                    tool_calls,
                });
            }

            tracing::debug!(round, calls = reply.tool_calls.len(), "model requested tools");
            messages.push(Message::assistant_with_calls(
                reply.content.clone(),
                reply.tool_calls.clone(),
            ));
            for call in &reply.tool_calls {
                tool_calls += 1;
                let result = self.run_tool(call).await;
                let rendered = render_tool_result(&result);
                if rendered.contains(RELOAD_SENTINEL) {
                    tracing::debug!(tool = %call.name, round, "tool requested a reload; ending turn");
                    return Ok(RunnerOutput {
                        text: reload_reply_text(&reply.content, &result),
                        tool_calls,
                    });
                }
                messages.push(Message::tool_result(call.id.clone(), rendered));
            }
        }

        Err(anyhow::anyhow!(
            "agent stopped after {} tool rounds without a final answer",
            self.max_tool_rounds
        ))
    }

    async fn run_tool(&self, call: &ToolCall) -> Value {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            self.telemetry.emit(
                "tool.failed",
                json!({ "tool": call.name, "reason": "unknown_tool" }),
            );
            return tool_error_payload(
                "unknown_tool",
                format!("tool '{}' is not available", call.name),
            );
        };

        match tokio::time::timeout(self.tool_timeout, tool.call(call.arguments.clone())).await {
            Ok(Ok(value)) => {
                let failed = value.get("status").and_then(Value::as_str) == Some("error");
                self.telemetry.emit(
                    if failed { "tool.failed" } else { "tool.succeeded" },
                    json!({ "tool": call.name }),
                );
                value
            }
            Ok(Err(err)) => {
                tracing::warn!(tool = %call.name, error = %format!("{err:#}"), "tool call failed");
                self.telemetry.emit(
                    "tool.failed",
                    json!({ "tool": call.name, "reason": "error" }),
                );
                tool_error_payload("tool_failed", format!("{err:#}"))
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout_secs = self.tool_timeout.as_secs(), "tool call timed out");
                self.telemetry.emit(
                    "tool.failed",
                    json!({ "tool": call.name, "reason": "timeout" }),
                );
                tool_error_payload(
                    "timeout",
                    format!(
                        "tool '{}' timed out after {}s",
                        call.name,
                        self.tool_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Assistant text, else the tool's `message`, followed by the sentinel line.
fn reload_reply_text(content: &str, result: &Value) -> String {
    let lead = if content.trim().is_empty() {
        match result.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => render_tool_result(result).replace(RELOAD_SENTINEL, ""),
        }
    } else {
        content.trim().to_string()
    };
    let lead = lead.trim();
    if lead.is_empty() {
        RELOAD_SENTINEL.to_string()
    } else {
        format!("{lead}\n{RELOAD_SENTINEL}")
    }
}

fn render_tool_result(value: &Value) -> String {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= TOOL_RESULT_MAX_CHARS {
        return text;
    }
    let mut out = text.chars().take(TOOL_RESULT_MAX_CHARS).collect::<String>();
    out.push_str("\n...[truncated]");
    out
}
