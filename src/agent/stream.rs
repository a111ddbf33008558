use serde::Deserialize;
use serde_json::Value;

use super::AgentEvent;

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
    User {
        #[serde(default)]
        message: Option<UserMessage>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Value,
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

/// Map one stream-json line to agent events.
///
/// Lines that are not stream-json pass through as [`AgentEvent::Log`].
/// `tool_names` tracks tool-use ids so results can be attributed.
pub fn events_from_line(line: &str, tool_names: &mut Vec<(String, String)>) -> Vec<AgentEvent> {
    let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
        return vec![AgentEvent::Log(line.to_string())];
    };

    match event {
        StreamEvent::Assistant { message, .. } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { name, input, id } => {
                    let description = describe_tool_use(&name, &input);
                    tool_names.push((id, name.clone()));
                    Some(AgentEvent::ToolStart { name, description })
                }
                ContentBlock::Text { text } => Some(AgentEvent::TextDelta(text)),
                ContentBlock::Other => None,
            })
            .collect(),
        StreamEvent::User { message } => {
            let ids: Vec<String> = message
                .and_then(|m| m.content.as_array().cloned())
                .unwrap_or_default()
                .iter()
                .filter_map(|block| block.get("tool_use_id").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let pos = tool_names.iter().position(|(tool_id, _)| *tool_id == id)?;
                    let (_, name) = tool_names.remove(pos);
                    Some(AgentEvent::ToolEnd { name })
                })
                .collect()
        }
        StreamEvent::Result {
            result, is_error, subtype, ..
        } => {
            if is_error {
                let message = result
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| format!("Claude reported an error ({})", subtype));
                vec![AgentEvent::Error(message)]
            } else {
                result.map(AgentEvent::FinalText).into_iter().collect()
            }
        }
        StreamEvent::System { subtype } => vec![AgentEvent::Log(format!("system: {}", subtype))],
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
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
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..s.floor_char_boundary(max_len - 3)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_use_and_result() {
        let mut tools = Vec::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar/baz.rs"},"id":"t1"},{"type":"text","text":"Looking"}]},"session_id":"abc"}"#;
        let events = events_from_line(line, &mut tools);
        assert_eq!(
            events,
            vec![
                AgentEvent::ToolStart {
                    name: "Read".into(),
                    description: "Reading: bar/baz.rs".into()
                },
                AgentEvent::TextDelta("Looking".into()),
            ]
        );

        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"..."}]}}"#;
        assert_eq!(
            events_from_line(line, &mut tools),
            vec![AgentEvent::ToolEnd { name: "Read".into() }]
        );
        assert!(tools.is_empty());
    }

    #[test]
    fn test_result_success_and_error() {
        let mut tools = Vec::new();
        let ok = r#"{"type":"result","subtype":"success","result":"All done","is_error":false}"#;
        assert_eq!(
            events_from_line(ok, &mut tools),
            vec![AgentEvent::FinalText("All done".into())]
        );

        let err = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        match &events_from_line(err, &mut tools)[..] {
            [AgentEvent::Error(message)] => assert!(message.contains("error_max_turns")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_json_line_is_log() {
        let mut tools = Vec::new();
        assert_eq!(
            events_from_line("warning: something", &mut tools),
            vec![AgentEvent::Log("warning: something".into())]
        );
    }

    #[test]
    fn test_unknown_content_block_is_ignored() {
        let mut tools = Vec::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#;
        assert!(events_from_line(line, &mut tools).is_empty());
    }

    #[test]
    fn test_describe_bash_truncates() {
        let input = serde_json::json!({"command": "cargo test --workspace --all-features -- --nocapture"});
        let desc = describe_tool_use("Bash", &input);
        assert!(desc.starts_with("Running: cargo test"));
        assert!(desc.ends_with("..."));
    }
}
