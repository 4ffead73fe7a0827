//! Per-session runtime state.
//!
//! One struct per session, owned by the ingest pipeline. This replaces any
//! temptation toward module-level mutable maps: everything transient a
//! session needs between events lives here and dies with the session.

/// Transient state for one in-flight session.
#[derive(Debug)]
pub struct SessionRuntime {
    pub project_id: String,
    /// Index of the first in-progress todo, -1 if none. Tool events that
    /// omit an index inherit this.
    pub active_todo_index: i64,
    /// Todo count after the last todos-update, for shrink detection in logs.
    pub previous_todo_count: usize,
    /// Store already shows `completed` (all todos finished) but the terminal
    /// broadcast still waits for the runner's own build-complete.
    pub auto_completed: bool,
    /// A terminal update has been broadcast; everything after this is
    /// dropped.
    pub finalized: bool,
    /// A cancel was requested; the runner's own terminal event closes the
    /// session as cancelled rather than the status it reports.
    pub cancel_requested: bool,
    /// Streaming assistant text per message id, concatenated at close into
    /// one persisted chat message. Insertion order preserved.
    text_buffers: Vec<(String, String)>,
}

impl SessionRuntime {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            active_todo_index: -1,
            previous_todo_count: 0,
            auto_completed: false,
            finalized: false,
            cancel_requested: false,
            text_buffers: Vec::new(),
        }
    }

    /// Append a streamed text delta for a message.
    pub fn push_text_delta(&mut self, message_id: &str, delta: &str) {
        if let Some((_, buffer)) = self
            .text_buffers
            .iter_mut()
            .find(|(id, _)| id == message_id)
        {
            buffer.push_str(delta);
        } else {
            self.text_buffers
                .push((message_id.to_string(), delta.to_string()));
        }
    }

    /// Drain all buffered assistant text as one document, message order.
    pub fn take_assistant_text(&mut self) -> Option<String> {
        if self.text_buffers.is_empty() {
            return None;
        }
        let text = self
            .text_buffers
            .drain(..)
            .map(|(_, buffer)| buffer)
            .collect::<Vec<_>>()
            .join("\n\n");
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_deltas_concatenate_in_order() {
        let mut runtime = SessionRuntime::new("p1");
        runtime.push_text_delta("m1", "Hello");
        runtime.push_text_delta("m1", ", world");
        runtime.push_text_delta("m2", "Second message");

        let text = runtime.take_assistant_text().unwrap();
        assert_eq!(text, "Hello, world\n\nSecond message");
        assert!(runtime.take_assistant_text().is_none());
    }

    #[test]
    fn test_whitespace_only_text_discarded() {
        let mut runtime = SessionRuntime::new("p1");
        runtime.push_text_delta("m1", "  \n ");
        assert!(runtime.take_assistant_text().is_none());
    }
}
