//! Provider stream events and the heuristics applied to them.

use serde::Serialize;

/// Longest event text kept; agent transcripts can be huge.
pub const EVENT_TEXT_LIMIT: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thinking,
    ToolCall,
    ToolResult,
    AssistantText,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Thinking => "thinking",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::AssistantText => "assistant_text",
        }
    }
}

/// One normalized event from a provider's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    /// Tool name for `tool_call`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub text: String,
    /// `tool_result` reported an error.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl StreamEvent {
    pub fn new(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            tool: None,
            text: clip(text.into()),
            is_error: false,
        }
    }

    pub fn tool_call(tool: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.into()),
            ..Self::new(EventKind::ToolCall, text)
        }
    }

    pub fn tool_result(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            is_error,
            ..Self::new(EventKind::ToolResult, text)
        }
    }
}

fn clip(mut text: String) -> String {
    if text.len() <= EVENT_TEXT_LIMIT {
        return text;
    }
    let mut cut = EVENT_TEXT_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("… [{dropped} bytes clipped]"));
    text
}

/// True if an assistant text chunk is really a serialized API error body.
///
/// Some CLIs surface upstream failures as the assistant's reply instead of
/// exiting nonzero, e.g. `{"error":{"code":429,"message":"quota"}}`.
pub fn looks_like_api_error(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && trimmed.contains("\"error\"")
        && ["\"code\"", "\"status\"", "\"message\""]
            .iter()
            .any(|key| trimmed.contains(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_bodies_are_detected() {
        assert!(looks_like_api_error(
            r#"  {"error":{"code":429,"message":"Resource exhausted"}} "#
        ));
        assert!(looks_like_api_error(r#"{"type":"error","error":{"status":"UNAVAILABLE"}}"#));
    }

    #[test]
    fn ordinary_text_is_not_an_api_error() {
        assert!(!looks_like_api_error("I fixed the error handling in main.rs"));
        assert!(!looks_like_api_error(r#"{"error": null}"#));
        assert!(!looks_like_api_error(r#"The body was {"error":{"code":1}} and more"#));
    }

    #[test]
    fn long_text_is_clipped_on_char_boundary() {
        let event = StreamEvent::new(EventKind::AssistantText, "é".repeat(EVENT_TEXT_LIMIT));
        assert!(event.text.ends_with("bytes clipped]"));
        assert!(event.text.len() < EVENT_TEXT_LIMIT * 2);
    }
}
