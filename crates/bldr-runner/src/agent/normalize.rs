//! Shared normalizer state.
//!
//! Both adapters funnel their todo and tool bookkeeping through this one
//! struct: the active todo index inherited by tool events that name none,
//! and the table of tools whose input has been seen (an output without a
//! matching input is logged and dropped here, before it ever goes upstream).

use bldr_protocol::{TodoItem, TodoPhase, TodoStatus, UpdatePayload};
use log::warn;
use serde_json::Value;
use std::collections::HashMap;

/// Per-session translation state shared by adapters.
#[derive(Debug, Default)]
pub struct NormalizerState {
    /// Index of the first in-progress todo, -1 if none.
    pub active_todo_index: i64,
    /// Tools with input seen and no terminal state yet, id -> name.
    in_progress_tools: HashMap<String, String>,
}

impl NormalizerState {
    pub fn new() -> Self {
        Self {
            active_todo_index: -1,
            in_progress_tools: HashMap::new(),
        }
    }

    /// Build a `todos-update` from raw todo values, dropping entries with no
    /// content and normalizing status spellings. Returns `None` when
    /// nothing usable remains.
    pub fn todos_update(&mut self, raw_todos: &[Value], phase: TodoPhase) -> Option<UpdatePayload> {
        let todos: Vec<TodoItem> = raw_todos
            .iter()
            .filter_map(|raw| {
                let content = raw
                    .get("content")
                    .or_else(|| raw.get("task"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())?;
                let status = raw
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(TodoStatus::parse)
                    .unwrap_or_default();
                let active_form = raw
                    .get("activeForm")
                    .or_else(|| raw.get("active_form"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                Some(TodoItem {
                    content: content.to_string(),
                    active_form,
                    status,
                })
            })
            .collect();

        if todos.is_empty() {
            return None;
        }

        let active_index = todos
            .iter()
            .position(|t| t.status == TodoStatus::InProgress)
            .map(|i| i as i64)
            .unwrap_or(-1);
        self.active_todo_index = active_index;

        Some(UpdatePayload::TodosUpdate {
            todos,
            active_index,
            phase,
        })
    }

    /// Record a tool input and produce its canonical update. Tool events
    /// that name no todo inherit the active index.
    pub fn tool_input(
        &mut self,
        tool_call_id: &str,
        tool_name: &str,
        todo_index: Option<i64>,
        input: Value,
    ) -> UpdatePayload {
        self.in_progress_tools
            .insert(tool_call_id.to_string(), tool_name.to_string());
        UpdatePayload::ToolInputAvailable {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            todo_index: Some(todo_index.unwrap_or(self.active_todo_index)),
            input,
        }
    }

    /// Close out a tool. Returns `None` (and logs) when no input was ever
    /// seen for the id, preserving the state-machine invariants upstream.
    pub fn tool_finish(
        &mut self,
        tool_call_id: &str,
        output: Value,
        is_error: bool,
    ) -> Option<UpdatePayload> {
        if self.in_progress_tools.remove(tool_call_id).is_none() {
            warn!(
                "Dropping output for tool {} with no prior input",
                tool_call_id
            );
            return None;
        }

        Some(if is_error {
            UpdatePayload::ToolError {
                tool_call_id: tool_call_id.to_string(),
                error: output
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| output.to_string()),
            }
        } else {
            UpdatePayload::ToolOutputAvailable {
                tool_call_id: tool_call_id.to_string(),
                output,
            }
        })
    }

    /// Whether any tool inputs are still open.
    pub fn open_tool_count(&self) -> usize {
        self.in_progress_tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_todos_update_drops_empty_and_tracks_active() {
        let mut state = NormalizerState::new();
        let raw = vec![
            json!({"content": "Set up layout", "status": "completed"}),
            json!({"content": "  ", "status": "pending"}),
            json!({"content": "Wire the API", "status": "In Progress", "activeForm": "Wiring the API"}),
        ];

        let update = state.todos_update(&raw, TodoPhase::Build).unwrap();
        let UpdatePayload::TodosUpdate {
            todos,
            active_index,
            ..
        } = update
        else {
            panic!("wrong payload");
        };

        assert_eq!(todos.len(), 2);
        assert_eq!(todos[1].status, TodoStatus::InProgress);
        assert_eq!(active_index, 1);
        assert_eq!(state.active_todo_index, 1);
    }

    #[test]
    fn test_all_empty_todos_rejected() {
        let mut state = NormalizerState::new();
        let raw = vec![json!({"content": "", "status": "pending"})];
        assert!(state.todos_update(&raw, TodoPhase::Build).is_none());
    }

    #[test]
    fn test_tool_inherits_active_index() {
        let mut state = NormalizerState::new();
        state.active_todo_index = 2;

        let update = state.tool_input("tc-1", "Read", None, json!({"file": "x"}));
        let UpdatePayload::ToolInputAvailable { todo_index, .. } = update else {
            panic!("wrong payload");
        };
        assert_eq!(todo_index, Some(2));
    }

    #[test]
    fn test_output_without_input_dropped() {
        let mut state = NormalizerState::new();
        assert!(state.tool_finish("ghost", json!("out"), false).is_none());

        state.tool_input("tc-1", "Read", Some(-1), json!({}));
        assert!(state.tool_finish("tc-1", json!("out"), false).is_some());
        // Second finish for the same id is also dropped.
        assert!(state.tool_finish("tc-1", json!("out"), false).is_none());
    }
}
