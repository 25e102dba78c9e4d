//! Chat-completions response → native message response.

use serde::Deserialize;
use serde_json::Value;

use crate::protocol::anthropic::{ContentBlock, MessagesResponse, StopReason, Usage};
use crate::protocol::openai::{ChatCompletion, ChatUsage};
use crate::protocol::{new_message_id, ConversionError};

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type", default)]
    r#type: Option<String>,
}

/// `true` when the body already is a native message object.
pub fn is_native_response(body: &[u8]) -> bool {
    serde_json::from_slice::<TypeProbe>(body)
        .ok()
        .and_then(|p| p.r#type)
        .is_some_and(|t| t == "message")
}

/// Convert a whole chat-completions body. Native bodies are returned as-is.
pub fn convert_response(body: &[u8]) -> Result<Vec<u8>, ConversionError> {
    if is_native_response(body) {
        return Ok(body.to_vec());
    }
    let completion: ChatCompletion =
        serde_json::from_slice(body).map_err(ConversionError::InvalidResponse)?;
    let converted = to_messages_response(completion);
    serde_json::to_vec(&converted).map_err(ConversionError::Serialize)
}

pub fn to_messages_response(completion: ChatCompletion) -> MessagesResponse {
    let id = completion.id.unwrap_or_else(new_message_id);
    let mut response = MessagesResponse::new(id, completion.model.unwrap_or_default());

    let choice = completion.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());

    if let Some(choice) = choice {
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            response.content.push(ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            response.content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_arguments(&call.function.arguments),
            });
        }
    }
    if response.content.is_empty() {
        response.content.push(ContentBlock::Text {
            text: String::new(),
        });
    }

    response.stop_reason = Some(map_finish_reason(finish_reason.as_deref()));
    response.usage = completion.usage.as_ref().map(convert_usage).unwrap_or_default();
    response
}

/// Tool arguments arrive as a JSON string; anything unparsable becomes `{}`.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::debug!(arguments = %arguments, "Tool arguments are not a JSON object");
            Value::Object(Default::default())
        }
    }
}

pub fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("content_filter") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Cached prompt tokens are reported separately, not as fresh input.
pub fn convert_usage(usage: &ChatUsage) -> Usage {
    let cached = usage.cached_tokens();
    Usage {
        input_tokens: usage.prompt_tokens.saturating_sub(cached.unwrap_or(0)),
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: cached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn convert(value: Value) -> Value {
        let body = serde_json::to_vec(&value).unwrap();
        serde_json::from_slice(&convert_response(&body).unwrap()).unwrap()
    }

    #[test]
    fn text_completion() {
        let out = convert(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }));

        assert_eq!(
            out,
            json!({
                "id": "chatcmpl-1",
                "type": "message",
                "role": "assistant",
                "model": "gpt-4o",
                "content": [{"type": "text", "text": "Hi there"}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })
        );
    }

    #[test]
    fn tool_calls_and_cached_usage() {
        let out = convert(json!({
            "model": "gpt-4o",
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "call_1", "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}}]
            }, "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 7,
                "prompt_tokens_details": {"cached_tokens": 60}}
        }));

        assert_eq!(
            out["content"],
            json!([{"type": "tool_use", "id": "call_1", "name": "lookup", "input": {"q": "rust"}}])
        );
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(
            out["usage"],
            json!({"input_tokens": 40, "output_tokens": 7, "cache_read_input_tokens": 60})
        );
        assert!(out["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(map_finish_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(map_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(map_finish_reason(Some("content_filter")), StopReason::StopSequence);
        assert_eq!(map_finish_reason(Some("whatever")), StopReason::EndTurn);
        assert_eq!(map_finish_reason(None), StopReason::EndTurn);
    }

    #[test]
    fn native_body_passes_through_untouched() {
        let body = br#"{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude"}"#;
        assert_eq!(convert_response(body).unwrap(), body.to_vec());
    }

    #[test]
    fn bad_arguments_become_empty_object() {
        assert_eq!(parse_arguments("{\"a\":"), json!({}));
        assert_eq!(parse_arguments("[1]"), json!({}));
        assert_eq!(parse_arguments(""), json!({}));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            convert_response(b"<html>oops</html>"),
            Err(ConversionError::InvalidResponse(_))
        ));
    }
}
