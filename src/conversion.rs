use chrono::Utc;
use serde_json::Value;

use crate::models::anthropic::{MessagesRequest, MessagesResponse};
use crate::models::openai::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChatStreamChoice, ChatUsage,
};

/// `max_tokens` is mandatory on the native surface; clients that omit it
/// get this.
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Map a native stop reason onto the OpenAI finish-reason vocabulary.
/// Total: unknown reasons collapse to "stop".
pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        _ => "stop",
    }
}

/// Convert an OpenAI chat-completion request into a native messages request.
///
/// System messages are lifted out of the message list into the native
/// `system` field (the last one wins when several appear); everything else
/// is forwarded in order with roles and contents untouched.
pub fn to_messages_request(req: &ChatCompletionRequest) -> MessagesRequest {
    let mut system: Option<Value> = None;
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(req.messages.len());

    for m in &req.messages {
        if m.role == "system" {
            system = Some(m.content.clone());
        } else {
            messages.push(m.clone());
        }
    }

    // Some clients probe with system-only requests; the native API rejects
    // an empty message list.
    if messages.is_empty() {
        messages.push(ChatMessage::new("user", "Hello"));
    }

    MessagesRequest {
        model: req.model.clone(),
        system,
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stop_sequences: req.stop.clone(),
    }
}

/// Convert a native non-streaming response into an OpenAI chat completion.
///
/// All text-type content blocks are concatenated in order into the single
/// assistant message. Cache token counters are not part of the OpenAI usage
/// object and are not exposed here.
pub fn to_chat_response(resp: &MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    for block in &resp.content {
        if block.kind == "text" {
            text.push_str(&block.text);
        }
    }

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: resp.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new("assistant", text),
            finish_reason: Some(map_stop_reason(&resp.stop_reason).to_string()),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

/// What a streamed chunk carries. The wire shape is a single choice with
/// nullable delta/finish fields; internally the three cases stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// First chunk of a stream: announces the assistant role.
    Role,
    /// One text delta.
    Text(String),
    /// Terminal chunk carrying only the finish reason.
    Finish(&'static str),
}

/// Build one OpenAI streaming chunk.
///
/// `model` is the client's requested model, not the upstream's echo: alias
/// users expect their alias back in streaming chunks.
pub fn stream_chunk(message_id: &str, model: &str, payload: ChunkPayload) -> ChatCompletionChunk {
    let (delta, finish_reason) = match payload {
        ChunkPayload::Role => (
            Some(ChatDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            }),
            None,
        ),
        ChunkPayload::Text(text) => (
            Some(ChatDelta {
                role: None,
                content: Some(text),
            }),
            None,
        ),
        ChunkPayload::Finish(reason) => (None, Some(reason.to_string())),
    };

    ChatCompletionChunk {
        id: format!("chatcmpl-{message_id}"),
        object: "chat.completion.chunk".to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatStreamChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}
