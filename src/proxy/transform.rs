// Protocol transformer
// Anthropic messages <-> OpenAI chat completions, both directions lossless
// for text and tool calls. The Anthropic side is what clients speak; the
// OpenAI side is what every upstream pool speaks.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use super::anthropic::{
    AnthropicMessage, ContentBlock, MessagesRequest, MessagesResponse, ToolDefinition, Usage,
};
use super::error::ProxyError;
use super::harmony;
use super::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, FunctionCall, OpenAIFunction,
    OpenAITool, ToolCallPayload,
};
use super::overrides::OverrideEngine;
use super::schema_fallback;

/// Substituted for empty tool_result content when the option is on; some
/// upstreams reject tool messages with empty bodies.
pub const DEFAULT_EMPTY_TOOL_RESULT: &str = "Tool executed successfully with no output";

/// Per-request knobs the transformer needs; borrowed from Settings.
pub struct TransformContext<'a> {
    pub target_model: &'a str,
    pub handle_empty_tool_results: bool,
    pub tool_descriptions: &'a HashMap<String, String>,
    pub overrides: Option<&'a OverrideEngine>,
    pub stream: bool,
}

/// Serialize a JSON value with all object keys sorted, recursively. Keeps
/// tool-call arguments byte-stable across repeated transforms.
pub fn to_sorted_json_string(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_else(|_| "{}".to_string())
}

/// Every tool_use id issued by an assistant turn must be answered by a
/// tool_result before the conversation asks for more assistant output.
pub fn validate_tool_pairing(messages: &[AnthropicMessage]) -> Result<(), ProxyError> {
    let mut pending: HashSet<String> = HashSet::new();

    for msg in messages {
        if msg.role == "assistant" {
            if !pending.is_empty() {
                return Err(ProxyError::InvalidRequest(format!(
                    "assistant turn before tool results for: {}",
                    pending.into_iter().collect::<Vec<_>>().join(", ")
                )));
            }
            for block in msg.content.as_blocks() {
                if let ContentBlock::ToolUse { id, .. } = block {
                    pending.insert(id);
                }
            }
        } else {
            for block in msg.content.as_blocks() {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    pending.remove(&tool_use_id);
                }
            }
        }
    }

    if !pending.is_empty() {
        return Err(ProxyError::InvalidRequest(format!(
            "tool calls missing results: {}",
            pending.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(())
}

/// Build the upstream chat-completions request.
pub fn anthropic_to_openai(
    req: &MessagesRequest,
    ctx: &TransformContext<'_>,
) -> Result<ChatCompletionRequest, ProxyError> {
    validate_tool_pairing(&req.messages)?;

    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = &req.system {
        let mut text = system.to_plaintext();
        if let Some(engine) = ctx.overrides {
            text = engine.apply(&text);
        }
        if !text.is_empty() {
            messages.push(ChatMessage::System { content: text });
        }
    }

    for msg in &req.messages {
        match msg.role.as_str() {
            "assistant" => convert_assistant_message(msg, &mut messages)?,
            "system" => {
                // System entries inside the array fold into plain system messages.
                messages.push(ChatMessage::System {
                    content: msg.content.text(),
                });
            }
            _ => convert_user_message(msg, ctx, &mut messages),
        }
    }

    let tools = match &req.tools {
        Some(defs) if !defs.is_empty() => Some(convert_tools(defs, ctx)),
        _ => None,
    };

    Ok(ChatCompletionRequest {
        model: ctx.target_model.to_string(),
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stop: req.stop_sequences.clone(),
        stream: if ctx.stream { Some(true) } else { None },
        tools,
    })
}

fn convert_assistant_message(
    msg: &AnthropicMessage,
    out: &mut Vec<ChatMessage>,
) -> Result<(), ProxyError> {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCallPayload> = Vec::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                if !input.is_object() {
                    return Err(ProxyError::InvalidArguments(format!(
                        "tool '{}' input is {}",
                        name,
                        type_name(&input)
                    )));
                }
                tool_calls.push(ToolCallPayload {
                    id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name,
                        arguments: to_sorted_json_string(&input),
                    },
                });
            }
            // Reasoning stays on the client side of the proxy.
            ContentBlock::Thinking { .. } => {}
            ContentBlock::ToolResult { .. } => {}
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return Ok(());
    }
    out.push(ChatMessage::Assistant {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    });
    Ok(())
}

fn convert_user_message(
    msg: &AnthropicMessage,
    ctx: &TransformContext<'_>,
    out: &mut Vec<ChatMessage>,
) {
    let mut pending_text = String::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Text { text } => pending_text.push_str(&text),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                // Keep block order: flush any text seen so far first.
                if !pending_text.is_empty() {
                    out.push(ChatMessage::User {
                        content: std::mem::take(&mut pending_text),
                    });
                }
                let mut text = content.to_plaintext();
                if let Some(engine) = ctx.overrides {
                    text = engine.apply(&text);
                }
                if text.is_empty() && ctx.handle_empty_tool_results {
                    text = DEFAULT_EMPTY_TOOL_RESULT.to_string();
                }
                out.push(ChatMessage::Tool {
                    content: text,
                    tool_call_id: tool_use_id,
                });
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
        }
    }

    if !pending_text.is_empty() {
        out.push(ChatMessage::User {
            content: pending_text,
        });
    }
}

fn convert_tools(defs: &[ToolDefinition], ctx: &TransformContext<'_>) -> Vec<OpenAITool> {
    let mut defs = defs.to_vec();
    schema_fallback::restore_corrupted(&mut defs);

    defs.iter()
        .map(|def| {
            if !def.input_schema.required_covered() {
                log::warn!(
                    "tool '{}' declares required parameters missing from properties",
                    def.name
                );
            }
            let description = ctx
                .tool_descriptions
                .get(&def.name)
                .cloned()
                .unwrap_or_else(|| def.description.clone());
            OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: def.name.clone(),
                    description,
                    parameters: serde_json::to_value(&def.input_schema)
                        .unwrap_or_else(|_| Value::Object(Default::default())),
                },
            }
        })
        .collect()
}

pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    }
}

/// Convert the buffered upstream response back into the Anthropic shape,
/// extracting Harmony channels into thinking + text blocks when enabled.
pub fn openai_to_anthropic(
    resp: &ChatCompletionResponse,
    client_model: &str,
    harmony_enabled: bool,
) -> MessagesResponse {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut stop_reason = "end_turn";

    if let Some(choice) = resp.choices.first() {
        stop_reason = map_finish_reason(choice.finish_reason.as_deref());

        if let Some(content) = &choice.message.content {
            if !content.is_empty() {
                if harmony_enabled && harmony::is_harmony_formatted(content) {
                    let parsed = harmony::parse_robust(content);
                    for anomaly in &parsed.parse_errors {
                        log::warn!("harmony parse anomaly: {}", anomaly);
                    }
                    if !parsed.thinking_text.is_empty() {
                        blocks.push(ContentBlock::Thinking {
                            text: parsed.thinking_text,
                        });
                    }
                    if !parsed.response_text.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: parsed.response_text,
                        });
                    }
                } else {
                    blocks.push(ContentBlock::Text {
                        text: content.clone(),
                    });
                }
            }
        }

        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input = match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(value) if value.is_object() => value,
                    Ok(value) => {
                        log::warn!(
                            "tool call '{}' arguments are {}; substituting empty object",
                            call.function.name,
                            type_name(&value)
                        );
                        Value::Object(Default::default())
                    }
                    Err(err) => {
                        log::warn!(
                            "tool call '{}' arguments failed to parse ({}); substituting empty object",
                            call.function.name,
                            err
                        );
                        Value::Object(Default::default())
                    }
                };
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input,
                });
            }
        }
    }

    let usage = resp
        .usage
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: if resp.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            resp.id.clone()
        },
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: client_model.to_string(),
        content: blocks,
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::anthropic::{MessageContent, SystemPrompt, ToolResultContent};
    use serde_json::json;

    fn ctx<'a>(descriptions: &'a HashMap<String, String>) -> TransformContext<'a> {
        TransformContext {
            target_model: "upstream-model",
            handle_empty_tool_results: true,
            tool_descriptions: descriptions,
            overrides: None,
            stream: false,
        }
    }

    fn simple_request(messages: Vec<AnthropicMessage>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-test".to_string(),
            max_tokens: Some(1024),
            system: None,
            messages,
            tools: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: None,
        }
    }

    fn user(text: &str) -> AnthropicMessage {
        AnthropicMessage {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn test_string_roundtrip_preserves_text_exactly() {
        let descriptions = HashMap::new();
        let text = "line one\n  indented\n\ntrailing  ";
        let req = simple_request(vec![user(text)]);
        let openai_req = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();

        match &openai_req.messages[0] {
            ChatMessage::User { content } => assert_eq!(content, text),
            other => panic!("unexpected message: {:?}", other),
        }

        let upstream: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1", "model": "upstream-model",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]
        }))
        .unwrap();
        let back = openai_to_anthropic(&upstream, "claude-test", true);
        assert_eq!(back.content, vec![ContentBlock::Text { text: text.to_string() }]);
        assert_eq!(back.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(back.model, "claude-test");
    }

    #[test]
    fn test_system_array_collapses_to_single_leading_message() {
        let descriptions = HashMap::new();
        let mut req = simple_request(vec![user("hi")]);
        req.system = Some(SystemPrompt::Blocks(vec![
            serde_json::from_value(json!({"type": "text", "text": "a"})).unwrap(),
            serde_json::from_value(json!({"type": "text", "text": "b"})).unwrap(),
        ]));

        let out = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();
        assert_eq!(
            out.messages[0],
            ChatMessage::System { content: "a\nb".to_string() }
        );
    }

    #[test]
    fn test_tool_use_becomes_sorted_tool_call() {
        let descriptions = HashMap::new();
        let req = simple_request(vec![
            user("go"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![
                    ContentBlock::Text { text: "calling".to_string() },
                    ContentBlock::ToolUse {
                        id: "toolu_1".to_string(),
                        name: "Read".to_string(),
                        input: json!({"offset": 2, "file_path": "a.rs"}),
                    },
                ]),
            },
            AnthropicMessage {
                role: "user".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".to_string(),
                    content: ToolResultContent::Text("contents".to_string()),
                }]),
            },
        ]);

        let out = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();
        match &out.messages[1] {
            ChatMessage::Assistant { content, tool_calls } => {
                assert_eq!(content.as_deref(), Some("calling"));
                let calls = tool_calls.as_ref().unwrap();
                assert_eq!(calls[0].function.arguments, r#"{"file_path":"a.rs","offset":2}"#);
            }
            other => panic!("unexpected: {:?}", other),
        }
        match &out.messages[2] {
            ChatMessage::Tool { tool_call_id, content } => {
                assert_eq!(tool_call_id, "toolu_1");
                assert_eq!(content, "contents");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tool_arguments_roundtrip_deep_equal() {
        let input = json!({"nested": {"b": [1, 2, {"z": true, "a": null}], "a": "x"}, "top": 1});
        let serialized = to_sorted_json_string(&input);
        let parsed: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn test_dangling_tool_use_rejected() {
        let descriptions = HashMap::new();
        let req = simple_request(vec![
            user("go"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "Read".to_string(),
                    input: json!({"file_path": "a.rs"}),
                }]),
            },
        ]);
        let err = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        let descriptions = HashMap::new();
        let req = simple_request(vec![
            user("go"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "Bash".to_string(),
                    input: json!("ls -la"),
                }]),
            },
            AnthropicMessage {
                role: "user".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".to_string(),
                    content: ToolResultContent::Text("x".to_string()),
                }]),
            },
        ]);
        let err = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidArguments(_)));
    }

    #[test]
    fn test_empty_tool_result_gets_default() {
        let descriptions = HashMap::new();
        let req = simple_request(vec![
            user("go"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "Bash".to_string(),
                    input: json!({"command": "true"}),
                }]),
            },
            AnthropicMessage {
                role: "user".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".to_string(),
                    content: ToolResultContent::Text(String::new()),
                }]),
            },
        ]);

        let out = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();
        match &out.messages[2] {
            ChatMessage::Tool { content, .. } => assert_eq!(content, DEFAULT_EMPTY_TOOL_RESULT),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_thinking_blocks_not_forwarded() {
        let descriptions = HashMap::new();
        let req = simple_request(vec![
            user("go"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![
                    ContentBlock::Thinking { text: "private".to_string() },
                    ContentBlock::Text { text: "public".to_string() },
                ]),
            },
        ]);
        let out = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();
        match &out.messages[1] {
            ChatMessage::Assistant { content, .. } => {
                assert_eq!(content.as_deref(), Some("public"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tool_description_override_applied() {
        let mut descriptions = HashMap::new();
        descriptions.insert("Read".to_string(), "custom read description".to_string());
        let mut req = simple_request(vec![user("go")]);
        req.tools = Some(vec![ToolDefinition {
            name: "Read".to_string(),
            description: "original".to_string(),
            input_schema: serde_json::from_value(json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"]
            }))
            .unwrap(),
        }]);

        let out = anthropic_to_openai(&req, &ctx(&descriptions)).unwrap();
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].function.description, "custom read description");
    }

    #[test]
    fn test_harmony_content_split_into_thinking_and_text() {
        let content = "<|start|>assistant<|channel|>analysis<|message|>A<|end|>\
                       <|start|>assistant<|channel|>final<|message|>B<|return|>";
        let upstream: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-h", "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}]
        }))
        .unwrap();

        let back = openai_to_anthropic(&upstream, "claude-test", true);
        assert_eq!(
            back.content,
            vec![
                ContentBlock::Thinking { text: "A".to_string() },
                ContentBlock::Text { text: "B".to_string() },
            ]
        );
    }

    #[test]
    fn test_harmony_disabled_passes_verbatim() {
        let content = "<|start|>assistant<|channel|>final<|message|>B<|return|>";
        let upstream: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "c", "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}]
        }))
        .unwrap();

        let back = openai_to_anthropic(&upstream, "claude-test", false);
        assert_eq!(back.content, vec![ContentBlock::Text { text: content.to_string() }]);
    }

    #[test]
    fn test_unparseable_tool_arguments_become_empty_object() {
        let upstream: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "c", "model": "m",
            "choices": [{"index": 0, "message": {
                "role": "assistant",
                "tool_calls": [{"id": "call_1", "type": "function",
                                "function": {"name": "Read", "arguments": "{broken"}}]
            }, "finish_reason": "tool_calls"}]
        }))
        .unwrap();

        let back = openai_to_anthropic(&upstream, "claude-test", true);
        match &back.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(back.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), "end_turn");
        assert_eq!(map_finish_reason(Some("tool_calls")), "tool_use");
        assert_eq!(map_finish_reason(Some("length")), "max_tokens");
        assert_eq!(map_finish_reason(Some("content_filter")), "end_turn");
        assert_eq!(map_finish_reason(None), "end_turn");
    }

    #[test]
    fn test_usage_passthrough() {
        let upstream: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "c", "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "x"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        }))
        .unwrap();
        let back = openai_to_anthropic(&upstream, "claude-test", true);
        assert_eq!(back.usage.input_tokens, 7);
        assert_eq!(back.usage.output_tokens, 3);
    }
}
