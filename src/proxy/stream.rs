// SSE stream reassembly
// Folds a `data: <json>` chunk stream (terminated by `data: [DONE]`) into a
// single buffered ChatCompletionResponse. The fold itself is pure state so
// it can be tested without a live stream.

use std::collections::BTreeMap;

use eventsource_stream::Eventsource;
use futures::StreamExt;

use super::error::ProxyError;
use super::openai::{
    AssistantMessage, ChatCompletionChunk, ChatCompletionResponse, Choice, FunctionCall,
    OpenAIUsage, ToolCallPayload,
};

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    args_buf: String,
}

#[derive(Debug, Default)]
struct ChoiceState {
    content_buf: String,
    // Keyed by tool-call index so interleaved argument deltas stay ordered.
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
}

impl ChoiceState {
    fn apply(&mut self, choice: &super::openai::ChunkChoice) {
        if self.finish_reason.is_some() {
            // Chunks arriving after the finalizer for this choice are dropped.
            return;
        }

        if let Some(content) = &choice.delta.content {
            self.content_buf.push_str(content);
        }

        if let Some(deltas) = &choice.delta.tool_calls {
            for delta in deltas {
                let slot = self.tool_calls.entry(delta.index).or_default();
                if slot.id.is_empty() {
                    if let Some(id) = &delta.id {
                        if !id.is_empty() {
                            slot.id = id.clone();
                        }
                    }
                }
                if let Some(function) = &delta.function {
                    if slot.name.is_empty() {
                        if let Some(name) = &function.name {
                            if !name.is_empty() {
                                slot.name = name.clone();
                            }
                        }
                    }
                    if let Some(arguments) = &function.arguments {
                        slot.args_buf.push_str(arguments);
                    }
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
    }

    fn into_choice(self, index: u32) -> Choice {
        let tool_calls: Vec<ToolCallPayload> = self
            .tool_calls
            .into_values()
            .map(|partial| ToolCallPayload {
                id: partial.id,
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: partial.name,
                    arguments: partial.args_buf,
                },
            })
            .collect();

        Choice {
            index,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: if self.content_buf.is_empty() {
                    None
                } else {
                    Some(self.content_buf)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: self.finish_reason,
        }
    }
}

/// Stateful chunk fold. Feed chunks in arrival order, then `finish()`.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    id: String,
    model: String,
    choices: BTreeMap<u32, ChoiceState>,
    usage: Option<OpenAIUsage>,
    chunk_count: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        self.chunk_count += 1;
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if self.model.is_empty() && !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        for choice in &chunk.choices {
            self.choices.entry(choice.index).or_default().apply(choice);
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Realize the buffered response. Streams that closed without a
    /// finalizer are finalized with `stop` and a warning.
    pub fn finish(self) -> Result<ChatCompletionResponse, ProxyError> {
        if self.chunk_count == 0 {
            return Err(ProxyError::EmptyStream);
        }

        let mut choices = Vec::new();
        for (index, mut state) in self.choices {
            if state.finish_reason.is_none() {
                log::warn!(
                    "stream closed without finish_reason for choice {}; finalizing with stop",
                    index
                );
                state.finish_reason = Some("stop".to_string());
            }
            choices.push(state.into_choice(index));
        }

        if choices.is_empty() {
            // Chunks arrived but carried no choices (usage-only streams).
            choices.push(
                ChoiceState::default().into_choice(0),
            );
            choices[0].finish_reason = Some("stop".to_string());
        }

        Ok(ChatCompletionResponse {
            id: self.id,
            model: self.model,
            created: chrono::Utc::now().timestamp(),
            choices,
            usage: self.usage,
        })
    }
}

/// Drive the assembler over an upstream SSE body until `data: [DONE]` or
/// stream close.
pub async fn collect_sse(response: reqwest::Response) -> Result<ChatCompletionResponse, ProxyError> {
    let mut assembler = ChunkAssembler::new();
    let byte_stream = response.bytes_stream();
    let event_stream = byte_stream.eventsource();
    futures::pin_mut!(event_stream);

    while let Some(event_result) = event_stream.next().await {
        match event_result {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break;
                }
                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(chunk) => assembler.push(&chunk),
                    Err(err) => {
                        log::warn!("skipping unparseable stream chunk: {}", err);
                    }
                }
            }
            Err(err) => {
                // Truncated stream: fall through to synthetic finalization
                // if any chunks were seen, otherwise report the failure.
                log::warn!("upstream stream error: {}", err);
                if assembler.chunk_count() == 0 {
                    return Err(ProxyError::EndpointUnavailable(format!(
                        "stream failed before any chunk: {}",
                        err
                    )));
                }
                break;
            }
        }
    }

    assembler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_content_concatenation() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "chatcmpl-1", "model": "m",
            "choices": [{"index": 0, "delta": {"content": "Hello "}}]
        })));
        assembler.push(&chunk(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "delta": {"content": "world!"}}]
        })));
        assembler.push(&chunk(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })));

        let resp = assembler.finish().unwrap();
        assert_eq!(resp.id, "chatcmpl-1");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello world!"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_tool_call_argument_assembly() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "Read", "arguments": "{\"file_"}}
            ]}}]
        })));
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "path\":\"a.rs\"}"}}
            ]}}]
        })));
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]
        })));

        let resp = assembler.finish().unwrap();
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "Read");
        assert_eq!(calls[0].function.arguments, "{\"file_path\":\"a.rs\"}");
    }

    #[test]
    fn test_first_nonempty_id_and_name_win() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "", "function": {"name": ""}}
            ]}}]
        })));
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_real", "function": {"name": "Grep"}}
            ]}}]
        })));
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_late", "function": {"name": "Other"}}
            ]}, "finish_reason": "tool_calls"}]
        })));

        let resp = assembler.finish().unwrap();
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_real");
        assert_eq!(calls[0].function.name, "Grep");
    }

    #[test]
    fn test_parallel_tool_calls_keep_index_order() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "id": "call_b", "function": {"name": "Glob", "arguments": "{}"}},
                {"index": 0, "id": "call_a", "function": {"name": "Read", "arguments": "{}"}}
            ]}, "finish_reason": "tool_calls"}]
        })));

        let resp = assembler.finish().unwrap();
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn test_chunks_after_finalizer_dropped() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"content": "done"}, "finish_reason": "stop"}]
        })));
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"content": " extra"}}]
        })));

        let resp = assembler.finish().unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("done"));
    }

    #[test]
    fn test_empty_stream_fails() {
        let assembler = ChunkAssembler::new();
        assert!(matches!(assembler.finish(), Err(ProxyError::EmptyStream)));
    }

    #[test]
    fn test_missing_finalizer_synthesizes_stop() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c", "choices": [{"index": 0, "delta": {"content": "partial"}}]
        })));

        let resp = assembler.finish().unwrap();
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("partial"));
    }

    #[test]
    fn test_usage_passthrough() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&chunk(json!({
            "id": "c",
            "choices": [{"index": 0, "delta": {"content": "x"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })));

        let resp = assembler.finish().unwrap();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }
}
