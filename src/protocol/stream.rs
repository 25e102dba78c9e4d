//! Streaming chat-completions SSE → native SSE events.
//!
//! The translator is fed one line at a time and appends complete native
//! frames to an output buffer. It owns all the per-stream state:
//!
//! ```text
//! first data line        → message_start (generated msg_ id)
//! delta.content          → content_block_start(text) once, then text_delta
//! delta.tool_calls[i]    → content_block_start(tool_use) per call, then input_json_delta
//! block kind changes     → content_block_stop for the open block
//! finish_reason          → remembered, mapped at the end
//! [DONE] or end of input → content_block_stop, message_delta, message_stop
//! ```
//!
//! Data lines that already carry native events are passed through unchanged,
//! for backends flagged as chat-completions that answer natively anyway.

use serde::Deserialize;
use serde_json::Value;

use crate::protocol::anthropic::{
    BlockDelta, ContentBlock, DeltaUsage, MessageDelta, MessagesResponse, StopReason,
    StreamEvent, STREAM_EVENT_TYPES,
};
use crate::protocol::openai::{ChatChunk, ChatUsage, ToolCallDelta};
use crate::protocol::response::{convert_usage, map_finish_reason};
use crate::protocol::{new_message_id, new_tool_use_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text { index: u32 },
    Tool { index: u32, call: u32 },
}

impl OpenBlock {
    fn index(&self) -> u32 {
        match self {
            OpenBlock::Text { index } | OpenBlock::Tool { index, .. } => *index,
        }
    }
}

#[derive(Deserialize)]
struct EventProbe {
    #[serde(rename = "type")]
    r#type: Option<String>,
}

/// Per-stream translation state.
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    native: bool,
    next_index: u32,
    open: Option<OpenBlock>,
    stop_reason: Option<StopReason>,
    usage: Option<ChatUsage>,
    pending_event: Option<String>,
    text_chars: usize,
}

impl StreamTranslator {
    /// `model` is reported in `message_start`; empty means "use the upstream's".
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: new_message_id(),
            started: false,
            finished: false,
            native: false,
            next_index: 0,
            open: None,
            stop_reason: None,
            usage: None,
            pending_event: None,
            text_chars: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Characters of text emitted so far.
    pub fn text_chars(&self) -> usize {
        self.text_chars
    }

    /// Translate one SSE line (without its trailing newline).
    pub fn push_line(&mut self, line: &str, out: &mut String) {
        let line = line.trim_end_matches('\r');
        if self.finished || line.is_empty() {
            return;
        }

        if line.starts_with(':') {
            out.push_str(line);
            out.push_str("\n\n");
            return;
        }

        if let Some(event) = line.strip_prefix("event:") {
            self.pending_event = Some(event.trim().to_string());
            return;
        }

        let Some(data) = line.strip_prefix("data:") else {
            // id:, retry: and anything else carry nothing to translate.
            return;
        };
        let data = data.trim();
        let event = self.pending_event.take();

        if data == "[DONE]" {
            self.finish(out);
            return;
        }

        if let Some(kind) = native_event_type(data) {
            self.pass_through(event.as_deref().unwrap_or(&kind), &kind, data, out);
            return;
        }

        match serde_json::from_str::<ChatChunk>(data) {
            Ok(chunk) => self.push_chunk(chunk, out),
            Err(e) => tracing::debug!(error = %e, data = %data, "Skipping unparsable stream chunk"),
        }
    }

    /// Close the stream. Safe to call more than once.
    pub fn finish(&mut self, out: &mut String) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.native && !self.started {
            return;
        }

        self.ensure_started(None, out);
        self.close_block(out);

        let usage = self
            .usage
            .as_ref()
            .map(|u| {
                let converted = convert_usage(u);
                DeltaUsage {
                    input_tokens: Some(converted.input_tokens),
                    output_tokens: converted.output_tokens,
                    cache_read_input_tokens: converted.cache_read_input_tokens,
                }
            })
            .unwrap_or_default();

        emit(
            &StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage,
            },
            out,
        );
        emit(&StreamEvent::MessageStop, out);
    }

    fn pass_through(&mut self, event: &str, kind: &str, data: &str, out: &mut String) {
        self.native = true;
        out.push_str("event: ");
        out.push_str(event);
        out.push_str("\ndata: ");
        out.push_str(data);
        out.push_str("\n\n");
        if kind == "message_stop" {
            self.finished = true;
        }
    }

    fn push_chunk(&mut self, chunk: ChatChunk, out: &mut String) {
        self.ensure_started(chunk.model.as_deref(), out);

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.push_text(text, out);
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                self.push_tool_call(call, out);
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.stop_reason = Some(map_finish_reason(Some(reason)));
            }
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn push_text(&mut self, text: String, out: &mut String) {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.close_block(out);
                let index = self.open_block(
                    ContentBlock::Text {
                        text: String::new(),
                    },
                    out,
                );
                self.open = Some(OpenBlock::Text { index });
                index
            }
        };
        self.text_chars += text.chars().count();
        emit(
            &StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::TextDelta { text },
            },
            out,
        );
    }

    fn push_tool_call(&mut self, call: ToolCallDelta, out: &mut String) {
        let function = call.function.unwrap_or_default();
        let index = match self.open {
            Some(OpenBlock::Tool { index, call: open }) if open == call.index => index,
            _ => {
                self.close_block(out);
                let index = self.open_block(
                    ContentBlock::ToolUse {
                        id: call.id.unwrap_or_else(new_tool_use_id),
                        name: function.name.unwrap_or_default(),
                        input: Value::Object(Default::default()),
                    },
                    out,
                );
                self.open = Some(OpenBlock::Tool {
                    index,
                    call: call.index,
                });
                index
            }
        };

        if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
            emit(
                &StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                },
                out,
            );
        }
    }

    fn ensure_started(&mut self, upstream_model: Option<&str>, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        let model = if self.model.is_empty() {
            upstream_model.unwrap_or_default().to_string()
        } else {
            self.model.clone()
        };
        emit(
            &StreamEvent::MessageStart {
                message: MessagesResponse::new(self.message_id.clone(), model),
            },
            out,
        );
    }

    fn open_block(&mut self, block: ContentBlock, out: &mut String) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        emit(
            &StreamEvent::ContentBlockStart {
                index,
                content_block: block,
            },
            out,
        );
        index
    }

    fn close_block(&mut self, out: &mut String) {
        if let Some(block) = self.open.take() {
            emit(&StreamEvent::ContentBlockStop { index: block.index() }, out);
        }
    }
}

fn native_event_type(data: &str) -> Option<String> {
    let kind = serde_json::from_str::<EventProbe>(data).ok()?.r#type?;
    STREAM_EVENT_TYPES.contains(&kind.as_str()).then_some(kind)
}

fn emit(event: &StreamEvent, out: &mut String) {
    if let Err(e) = event.write_sse(out) {
        tracing::error!(event = event.name(), error = %e, "Failed to serialize stream event");
    }
}
