//! Claude-like stream-JSON adapter.
//!
//! The agent prints one JSON object per stdout line: assistant messages
//! with text and `tool_use` blocks, user messages carrying `tool_result`
//! blocks, and a final `result` record. `TodoWrite` tool uses are rewritten
//! into canonical `todos-update`s instead of surfacing as tool calls.

use bldr_protocol::{BuildOutcome, TodoPhase, UpdatePayload};
use log::debug;
use serde_json::Value;

use super::normalize::NormalizerState;

pub struct ClaudeAdapter {
    state: NormalizerState,
    saw_terminal: bool,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            state: NormalizerState::new(),
            saw_terminal: false,
        }
    }

    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    pub fn translate_line(&mut self, line: &str) -> Vec<UpdatePayload> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let event: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                debug!("Skipping non-JSON agent line");
                return Vec::new();
            }
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => self.translate_assistant(&event),
            Some("user") => self.translate_user(&event),
            Some("result") => self.translate_result(&event),
            // init and other system records carry nothing we persist.
            _ => Vec::new(),
        }
    }

    fn translate_assistant(&mut self, event: &Value) -> Vec<UpdatePayload> {
        let message_id = event
            .get("message")
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("msg")
            .to_string();
        let content = event
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let mut updates = Vec::new();
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            updates.push(UpdatePayload::TextDelta {
                                message_id: message_id.clone(),
                                delta: text.to_string(),
                            });
                        }
                    }
                }
                Some("tool_use") => {
                    let (Some(id), Some(name)) = (
                        block.get("id").and_then(|v| v.as_str()),
                        block.get("name").and_then(|v| v.as_str()),
                    ) else {
                        continue;
                    };
                    let input = block.get("input").cloned().unwrap_or(Value::Null);

                    if name == "TodoWrite" {
                        if let Some(update) = self.todos_from_input(&input) {
                            updates.push(update);
                        }
                    } else {
                        updates.push(self.state.tool_input(id, name, None, input));
                    }
                }
                _ => {}
            }
        }
        updates
    }

    fn translate_user(&mut self, event: &Value) -> Vec<UpdatePayload> {
        let content = event
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let mut updates = Vec::new();
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let output = block.get("content").cloned().unwrap_or(Value::Null);
            let is_error = block
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if let Some(update) = self.state.tool_finish(id, output, is_error) {
                updates.push(update);
            }
        }
        updates
    }

    fn translate_result(&mut self, event: &Value) -> Vec<UpdatePayload> {
        let is_error = event
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| {
                event
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .map(|s| s != "success")
                    .unwrap_or(false)
            });
        let summary = event
            .get("result")
            .and_then(|r| r.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        self.saw_terminal = true;

        let mut updates = Vec::new();
        if let Some(summary) = &summary {
            updates.push(UpdatePayload::BuildSummary {
                summary: summary.clone(),
            });
        }
        updates.push(UpdatePayload::BuildComplete {
            status: if is_error {
                BuildOutcome::Failed
            } else {
                BuildOutcome::Completed
            },
            summary,
        });
        updates
    }

    fn todos_from_input(&mut self, input: &Value) -> Option<UpdatePayload> {
        let todos = input.get("todos").and_then(|t| t.as_array())?;
        let phase = input
            .get("phase")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
            .unwrap_or(TodoPhase::Build);
        self.state.todos_update(todos, phase)
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bldr_protocol::TodoStatus;
    use serde_json::json;

    fn assistant_line(content: Value) -> String {
        json!({
            "type": "assistant",
            "message": {"id": "msg_01", "content": content}
        })
        .to_string()
    }

    #[test]
    fn test_text_block_becomes_delta() {
        let mut adapter = ClaudeAdapter::new();
        let updates =
            adapter.translate_line(&assistant_line(json!([{"type": "text", "text": "Hello"}])));
        assert_eq!(updates.len(), 1);
        assert!(matches!(
            &updates[0],
            UpdatePayload::TextDelta { message_id, delta }
                if message_id == "msg_01" && delta == "Hello"
        ));
    }

    #[test]
    fn test_todowrite_rewritten_to_todos_update() {
        let mut adapter = ClaudeAdapter::new();
        let updates = adapter.translate_line(&assistant_line(json!([{
            "type": "tool_use",
            "id": "tu_1",
            "name": "TodoWrite",
            "input": {"todos": [
                {"content": "A", "status": "in_progress"},
                {"content": "B", "status": "pending"}
            ]}
        }])));

        assert_eq!(updates.len(), 1);
        let UpdatePayload::TodosUpdate {
            todos,
            active_index,
            ..
        } = &updates[0]
        else {
            panic!("expected todos-update");
        };
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].status, TodoStatus::InProgress);
        assert_eq!(*active_index, 0);
    }

    #[test]
    fn test_tool_use_and_result_pair() {
        let mut adapter = ClaudeAdapter::new();
        let inputs = adapter.translate_line(&assistant_line(json!([{
            "type": "tool_use", "id": "tu_2", "name": "Read", "input": {"file": "x"}
        }])));
        assert!(matches!(
            &inputs[0],
            UpdatePayload::ToolInputAvailable { tool_call_id, .. } if tool_call_id == "tu_2"
        ));

        let result_line = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result", "tool_use_id": "tu_2", "content": "file contents"
            }]}
        })
        .to_string();
        let outputs = adapter.translate_line(&result_line);
        assert!(matches!(
            &outputs[0],
            UpdatePayload::ToolOutputAvailable { tool_call_id, .. } if tool_call_id == "tu_2"
        ));
    }

    #[test]
    fn test_orphan_tool_result_dropped() {
        let mut adapter = ClaudeAdapter::new();
        let line = json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result", "tool_use_id": "never-seen", "content": "x"
            }]}
        })
        .to_string();
        assert!(adapter.translate_line(&line).is_empty());
    }

    #[test]
    fn test_result_record_terminates() {
        let mut adapter = ClaudeAdapter::new();
        let line = json!({
            "type": "result", "subtype": "success", "is_error": false, "result": "done"
        })
        .to_string();
        let updates = adapter.translate_line(&line);

        assert!(adapter.saw_terminal());
        assert!(matches!(
            &updates[0],
            UpdatePayload::BuildSummary { summary } if summary == "done"
        ));
        assert!(matches!(
            &updates[1],
            UpdatePayload::BuildComplete { status: BuildOutcome::Completed, .. }
        ));
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let mut adapter = ClaudeAdapter::new();
        assert!(adapter.translate_line("not json at all").is_empty());
        assert!(adapter.translate_line("").is_empty());
    }
}
