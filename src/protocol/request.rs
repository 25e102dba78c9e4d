//! Native message request → chat-completions request.

use crate::protocol::anthropic::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role, ToolChoice,
};
use crate::protocol::models::map_model;
use crate::protocol::openai::{
    ChatContent, ChatMessage, ChatRequest, ChatTool, ChatToolChoice, ContentPart, FunctionCall,
    FunctionDef, FunctionName, ImageUrl, NamedToolChoice, ToolCall,
};
use crate::protocol::ConversionError;

/// Convert a raw native request body into a chat-completions body.
pub fn convert_request(body: &[u8]) -> Result<Vec<u8>, ConversionError> {
    let request: MessagesRequest =
        serde_json::from_slice(body).map_err(ConversionError::InvalidRequest)?;
    let converted = to_chat_request(request);
    serde_json::to_vec(&converted).map_err(ConversionError::Serialize)
}

pub fn to_chat_request(request: MessagesRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        let text = system.to_text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    for message in request.messages {
        convert_message(message, &mut messages);
    }

    ChatRequest {
        model: map_model(&request.model),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stop: request.stop_sequences.filter(|s| !s.is_empty()),
        tools: request.tools.filter(|t| !t.is_empty()).map(|tools| {
            tools
                .into_iter()
                .map(|tool| ChatTool {
                    r#type: "function",
                    function: FunctionDef {
                        name: tool.name,
                        description: tool.description,
                        parameters: tool.input_schema,
                    },
                })
                .collect()
        }),
        tool_choice: request.tool_choice.map(convert_tool_choice),
        user: request.metadata.and_then(|m| m.user_id),
    }
}

fn convert_tool_choice(choice: ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Auto => ChatToolChoice::Mode("auto"),
        ToolChoice::None => ChatToolChoice::Mode("none"),
        ToolChoice::Any => ChatToolChoice::Mode("required"),
        ToolChoice::Tool { name } => ChatToolChoice::Function(NamedToolChoice {
            r#type: "function",
            function: FunctionName { name },
        }),
    }
}

fn convert_message(message: Message, out: &mut Vec<ChatMessage>) {
    let blocks = match message.content {
        MessageContent::Text(text) => {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            out.push(ChatMessage::text(role, text));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    match message.role {
        Role::User => convert_user_blocks(blocks, out),
        Role::Assistant => convert_assistant_blocks(blocks, out),
    }
}

/// Tool results become `tool` messages ahead of the remaining user content,
/// since they must directly follow the assistant turn that made the calls.
fn convert_user_blocks(blocks: Vec<ContentBlock>, out: &mut Vec<ChatMessage>) {
    let mut parts = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ChatMessage {
                role: "tool",
                content: Some(ChatContent::Text(
                    content.map(|c| c.to_text()).unwrap_or_default(),
                )),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_url(source),
                },
            }),
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } | ContentBlock::Unknown => {}
        }
    }

    let content = match parts.len() {
        0 => return,
        1 => match parts.pop() {
            Some(ContentPart::Text { text }) => ChatContent::Text(text),
            Some(part) => ChatContent::Parts(vec![part]),
            None => return,
        },
        _ => ChatContent::Parts(parts),
    };
    out.push(ChatMessage {
        role: "user",
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
}

fn convert_assistant_blocks(blocks: Vec<ContentBlock>, out: &mut Vec<ChatMessage>) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                r#type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return;
    }
    out.push(ChatMessage {
        role: "assistant",
        content: (!text.is_empty()).then(|| ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    });
}

fn image_url(source: ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url,
    }
}
