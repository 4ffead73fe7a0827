//! Codex-like item-event adapter.
//!
//! The agent prints thread/turn/item events as JSON lines. Tool activity
//! arrives as `command_execution` items; todo lists do NOT arrive as a
//! first-class event, so this adapter additionally recognizes two in-band
//! patterns inside assistant text and rewrites them into canonical
//! `todos-update`s:
//!
//! 1. `TodoWrite({...})` calls with JS-object syntax (unquoted keys,
//!    single quotes), read with a tolerant parser; a parse failure rejects
//!    the extraction entirely rather than emitting partial todos.
//! 2. Fenced JSON code blocks (and MCP todo-tool results) whose body
//!    shape-matches `{ "todos": [...] }`.

use bldr_protocol::{BuildOutcome, TodoPhase, UpdatePayload};
use log::debug;
use serde_json::Value;

use super::normalize::NormalizerState;
use super::tolerant::{extract_balanced, parse_tolerant_object};

pub struct CodexAdapter {
    state: NormalizerState,
    saw_terminal: bool,
    last_agent_text: Option<String>,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            state: NormalizerState::new(),
            saw_terminal: false,
            last_agent_text: None,
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
            Some("item.started") | Some("item.updated") => self.translate_item(&event, false),
            Some("item.completed") => self.translate_item(&event, true),
            Some("turn.completed") => {
                self.saw_terminal = true;
                let summary = self.last_agent_text.take();
                let mut updates = Vec::new();
                if let Some(summary) = &summary {
                    updates.push(UpdatePayload::BuildSummary {
                        summary: summary.clone(),
                    });
                }
                updates.push(UpdatePayload::BuildComplete {
                    status: BuildOutcome::Completed,
                    summary,
                });
                updates
            }
            Some("turn.failed") => {
                self.saw_terminal = true;
                let summary = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(String::from);
                vec![UpdatePayload::BuildComplete {
                    status: BuildOutcome::Failed,
                    summary,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn translate_item(&mut self, event: &Value, completed: bool) -> Vec<UpdatePayload> {
        let Some(item) = event.get("item") else {
            return Vec::new();
        };
        let item_id = item
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("item")
            .to_string();

        match item.get("type").and_then(|t| t.as_str()) {
            Some("agent_message") => {
                let Some(text) = item.get("text").and_then(|t| t.as_str()) else {
                    return Vec::new();
                };
                if !completed {
                    return Vec::new();
                }

                self.last_agent_text = Some(text.to_string());

                let mut updates = vec![UpdatePayload::TextDelta {
                    message_id: item_id,
                    delta: text.to_string(),
                }];
                updates.extend(self.extract_todos(text));
                updates
            }

            Some("command_execution") => {
                let command = item
                    .get("command")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string();

                if !completed {
                    return vec![self.state.tool_input(
                        &item_id,
                        "shell",
                        None,
                        serde_json::json!({ "command": command }),
                    )];
                }

                let output = item
                    .get("aggregated_output")
                    .cloned()
                    .unwrap_or(Value::Null);
                let is_error = item
                    .get("exit_code")
                    .and_then(|c| c.as_i64())
                    .map(|c| c != 0)
                    .unwrap_or(false);
                self.state
                    .tool_finish(&item_id, output, is_error)
                    .into_iter()
                    .collect()
            }

            Some("mcp_tool_call") => {
                // MCP todo tools shape-match { todos: [...] } in their
                // result; everything else surfaces as a regular tool call.
                if !completed {
                    let input = item.get("arguments").cloned().unwrap_or(Value::Null);
                    let name = item
                        .get("tool")
                        .and_then(|t| t.as_str())
                        .unwrap_or("mcp")
                        .to_string();
                    return vec![self.state.tool_input(&item_id, &name, None, input)];
                }

                let result = item.get("result").cloned().unwrap_or(Value::Null);
                let mut updates = Vec::new();
                if let Some(todos) = result.get("todos").and_then(|t| t.as_array()) {
                    if let Some(update) = self.state.todos_update(todos, TodoPhase::Build) {
                        updates.push(update);
                    }
                }
                updates.extend(self.state.tool_finish(&item_id, result, false));
                updates
            }

            _ => Vec::new(),
        }
    }

    /// Find in-band todo lists inside assistant text.
    fn extract_todos(&mut self, text: &str) -> Vec<UpdatePayload> {
        let mut updates = Vec::new();

        // Pattern 1: TodoWrite({...}) with JS-object syntax.
        let mut search_from = 0;
        while let Some(found) = text[search_from..].find("TodoWrite(") {
            let call_start = search_from + found;
            let after_paren = call_start + "TodoWrite(".len();
            let Some(brace) = text[after_paren..]
                .char_indices()
                .take_while(|(_, c)| c.is_whitespace() || *c == '{')
                .find(|(_, c)| *c == '{')
                .map(|(i, _)| after_paren + i)
            else {
                search_from = after_paren;
                continue;
            };

            match extract_balanced(text, brace) {
                Some(object_src) => {
                    if let Some(update) = self.todos_from_source(object_src) {
                        updates.push(update);
                    }
                    search_from = brace + object_src.len();
                }
                None => {
                    // Unbalanced call: reject this occurrence, keep
                    // scanning past it.
                    search_from = after_paren;
                }
            }
        }

        // Pattern 2: fenced JSON blocks shaped like { todos: [...] }.
        for block in fenced_blocks(text) {
            if let Some(update) = self.todos_from_source(block) {
                updates.push(update);
            }
        }

        updates
    }

    fn todos_from_source(&mut self, src: &str) -> Option<UpdatePayload> {
        let value = parse_tolerant_object(src.trim())?;
        let todos = value.get("todos")?.as_array()?;
        let phase = value
            .get("phase")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
            .unwrap_or(TodoPhase::Build);
        self.state.todos_update(todos, phase)
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bodies of ``` fenced code blocks, language tag stripped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let body_start = newline + 1;
        let Some(close) = after_fence[body_start..].find("```") else {
            break;
        };
        blocks.push(&after_fence[body_start..body_start + close]);
        rest = &after_fence[body_start + close + 3..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use bldr_protocol::TodoStatus;
    use serde_json::json;

    fn agent_message(text: &str) -> String {
        json!({
            "type": "item.completed",
            "item": {"id": "item_1", "type": "agent_message", "text": text}
        })
        .to_string()
    }

    fn todos_updates(updates: &[UpdatePayload]) -> Vec<&UpdatePayload> {
        updates
            .iter()
            .filter(|u| matches!(u, UpdatePayload::TodosUpdate { .. }))
            .collect()
    }

    #[test]
    fn test_inband_todowrite_with_unquoted_keys() {
        let mut adapter = CodexAdapter::new();
        let text = r#"Setting up the plan.

TodoWrite({todos: [
  {content: "Scaffold project", status: "completed"},
  {content: "Build hello page", status: "in progress"},
  {content: "Polish styles", status: "pending"}
]})

Starting on the page now."#;

        let updates = adapter.translate_line(&agent_message(text));
        let todo_updates = todos_updates(&updates);
        assert_eq!(todo_updates.len(), 1);

        let UpdatePayload::TodosUpdate {
            todos,
            active_index,
            ..
        } = todo_updates[0]
        else {
            unreachable!()
        };
        assert_eq!(todos.len(), 3);
        assert_eq!(todos[1].status, TodoStatus::InProgress);
        assert_eq!(*active_index, 1);

        // Round-trip: the canonical update re-serializes as strict JSON
        // with the same todo set.
        let strict = serde_json::to_value(todo_updates[0]).unwrap();
        let contents: Vec<&str> = strict["todos"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["content"].as_str().unwrap())
            .collect();
        assert_eq!(
            contents,
            vec!["Scaffold project", "Build hello page", "Polish styles"]
        );
    }

    #[test]
    fn test_malformed_todowrite_rejected_entirely() {
        let mut adapter = CodexAdapter::new();
        // Unquoted value: tolerant parsing refuses, no partial todos.
        let text = r#"TodoWrite({todos: [{content: "a", status: pending}]})"#;
        let updates = adapter.translate_line(&agent_message(text));
        assert!(todos_updates(&updates).is_empty());
    }

    #[test]
    fn test_fenced_json_todos_block() {
        let mut adapter = CodexAdapter::new();
        let text = "Here is the plan:\n```json\n{\"todos\": [{\"content\": \"A\", \"status\": \"pending\"}]}\n```\n";
        let updates = adapter.translate_line(&agent_message(text));
        assert_eq!(todos_updates(&updates).len(), 1);
    }

    #[test]
    fn test_fenced_block_without_todos_ignored() {
        let mut adapter = CodexAdapter::new();
        let text = "```json\n{\"other\": 1}\n```";
        let updates = adapter.translate_line(&agent_message(text));
        assert!(todos_updates(&updates).is_empty());
    }

    #[test]
    fn test_command_execution_lifecycle() {
        let mut adapter = CodexAdapter::new();
        let started = json!({
            "type": "item.started",
            "item": {"id": "item_2", "type": "command_execution", "command": "ls"}
        })
        .to_string();
        let updates = adapter.translate_line(&started);
        assert!(matches!(
            &updates[0],
            UpdatePayload::ToolInputAvailable { tool_name, .. } if tool_name == "shell"
        ));

        let completed = json!({
            "type": "item.completed",
            "item": {
                "id": "item_2", "type": "command_execution",
                "command": "ls", "aggregated_output": "a.txt\n", "exit_code": 0
            }
        })
        .to_string();
        let updates = adapter.translate_line(&completed);
        assert!(matches!(&updates[0], UpdatePayload::ToolOutputAvailable { .. }));
    }

    #[test]
    fn test_nonzero_exit_becomes_tool_error() {
        let mut adapter = CodexAdapter::new();
        adapter.translate_line(
            &json!({
                "type": "item.started",
                "item": {"id": "item_3", "type": "command_execution", "command": "false"}
            })
            .to_string(),
        );
        let updates = adapter.translate_line(
            &json!({
                "type": "item.completed",
                "item": {
                    "id": "item_3", "type": "command_execution",
                    "command": "false", "aggregated_output": "", "exit_code": 1
                }
            })
            .to_string(),
        );
        assert!(matches!(&updates[0], UpdatePayload::ToolError { .. }));
    }

    #[test]
    fn test_turn_completed_terminates_with_summary() {
        let mut adapter = CodexAdapter::new();
        adapter.translate_line(&agent_message("All finished."));
        let updates = adapter.translate_line(&json!({"type": "turn.completed"}).to_string());

        assert!(adapter.saw_terminal());
        assert!(matches!(
            &updates[0],
            UpdatePayload::BuildSummary { summary } if summary == "All finished."
        ));
        assert!(matches!(
            &updates[1],
            UpdatePayload::BuildComplete { status: BuildOutcome::Completed, summary: Some(s) }
                if s == "All finished."
        ));
    }
}
