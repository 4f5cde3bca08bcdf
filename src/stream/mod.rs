use serde::Deserialize;
use serde_json::{Value, json};

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        num_turns: u32,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: String,
    },

    /// Request from the CLI that blocks it until a `control_response` with
    /// the same `request_id` arrives on stdin.
    #[serde(rename = "control_request")]
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype")]
pub enum ControlRequest {
    /// Permission check before a tool runs (`--permission-prompt-tool stdio`).
    #[serde(rename = "can_use_tool")]
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(other)]
    Other,
}

/// First line sent on stdin: the prompt as a user message.
pub fn user_text_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }]
        }
    })
}

/// Let a tool run, replacing its input with `updated_input`.
pub fn allow_tool_response(request_id: &str, updated_input: &Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "allow",
                "updatedInput": updated_input
            }
        }
    })
}

/// Reject a control request this client does not handle.
pub fn control_error_response(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error
        }
    })
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Write" => format!("Creating: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Edit" => format!("Editing: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Bash" => format!(
            "Running: {}",
            field("command")
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string())
        ),
        "Glob" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Grep" => format!(
            "Grep: {}",
            field("pattern")
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string())
        ),
        "Task" => format!("Agent: {}", field("description").unwrap_or("subagent")),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"AskUserQuestion","input":{"questions":[]},"id":"toolu_1"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();

        let StreamEvent::Assistant { message, session_id } = event else {
            panic!("Expected Assistant event");
        };
        assert_eq!(session_id, "abc");
        match &message.content[0] {
            ContentBlock::ToolUse { name, id, .. } => {
                assert_eq!(name, "AskUserQuestion");
                assert_eq!(id, "toolu_1");
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_with_usage() {
        let json = r#"{"type":"result","subtype":"success","result":"done","is_error":false,"session_id":"s1","duration_ms":1200,"total_cost_usd":0.42,"num_turns":7}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result {
                result,
                is_error,
                duration_ms,
                total_cost_usd,
                num_turns,
                ..
            } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert!(!is_error);
                assert_eq!(duration_ms, 1200);
                assert!((total_cost_usd - 0.42).abs() < f64::EPSILON);
                assert_eq!(num_turns, 7);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_and_block_types_are_tolerated() {
        let event: StreamEvent = serde_json::from_str(r#"{"type":"stream_event"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Unknown));

        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        let StreamEvent::Assistant { message, .. } = event else {
            panic!("Expected Assistant event");
        };
        assert!(matches!(message.content[0], ContentBlock::Other));
    }

    #[test]
    fn test_parse_can_use_tool_request() {
        let json = r#"{"type":"control_request","request_id":"req_1","request":{"subtype":"can_use_tool","tool_name":"AskUserQuestion","input":{"questions":[]},"permission_suggestions":[]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        let StreamEvent::ControlRequest { request_id, request } = event else {
            panic!("Expected ControlRequest event");
        };
        assert_eq!(request_id, "req_1");
        match request {
            ControlRequest::CanUseTool { tool_name, input } => {
                assert_eq!(tool_name, "AskUserQuestion");
                assert_eq!(input["questions"], json!([]));
            }
            other => panic!("Expected CanUseTool, got {:?}", other),
        }

        let json = r#"{"type":"control_request","request_id":"req_2","request":{"subtype":"hook_callback","callback_id":"h1"}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(
            event,
            StreamEvent::ControlRequest {
                request: ControlRequest::Other,
                ..
            }
        ));
    }

    #[test]
    fn test_allow_tool_response_shape() {
        let msg = allow_tool_response("req_9", &json!({"answers": {"Q?": "A"}}));
        assert_eq!(msg["type"], "control_response");
        assert_eq!(msg["response"]["subtype"], "success");
        assert_eq!(msg["response"]["request_id"], "req_9");
        assert_eq!(msg["response"]["response"]["behavior"], "allow");
        assert_eq!(msg["response"]["response"]["updatedInput"]["answers"]["Q?"], "A");

        let msg = control_error_response("req_3", "unsupported");
        assert_eq!(msg["response"]["subtype"], "error");
        assert_eq!(msg["response"]["error"], "unsupported");
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
    }
}
