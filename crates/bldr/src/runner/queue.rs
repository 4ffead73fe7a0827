//! Per-runner command queue.
//!
//! In-memory FIFO of build commands awaiting a transport slot. Dispatch
//! respects the runner's declared concurrency; a command stays in flight
//! until its `command-result` arrives. Retries after an ack timeout re-use
//! the same command id, keeping delivery at-most-once per
//! `(session_id, runner)` pair.

use bldr_protocol::BuildCommand;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// A dispatched command waiting on its ack or result.
#[derive(Debug)]
pub struct InFlightCommand {
    pub command: BuildCommand,
    pub acked: bool,
    pub dispatched_at: Instant,
}

/// FIFO command queue for one runner.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queued: VecDeque<BuildCommand>,
    in_flight: HashMap<String, InFlightCommand>,
    /// Sessions ever dispatched on this queue; a session is never enqueued
    /// twice.
    seen_sessions: HashSet<String>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command. Returns false when the session already has a
    /// command queued or in flight here.
    pub fn enqueue(&mut self, command: BuildCommand) -> bool {
        if self.seen_sessions.contains(&command.session_id) {
            return false;
        }
        self.seen_sessions.insert(command.session_id.clone());
        self.queued.push_back(command);
        true
    }

    /// Pop the next command for dispatch if a concurrency slot is free.
    pub fn next_dispatch(&mut self, max_builds: usize) -> Option<BuildCommand> {
        if self.in_flight.len() >= max_builds {
            return None;
        }
        let command = self.queued.pop_front()?;
        self.in_flight.insert(
            command.command_id.clone(),
            InFlightCommand {
                command: command.clone(),
                acked: false,
                dispatched_at: Instant::now(),
            },
        );
        Some(command)
    }

    /// Mark a dispatched command as acknowledged.
    pub fn ack(&mut self, command_id: &str) -> bool {
        match self.in_flight.get_mut(command_id) {
            Some(entry) => {
                entry.acked = true;
                true
            }
            None => false,
        }
    }

    /// Close out a command on its result. Returns the command, if known.
    pub fn complete(&mut self, command_id: &str) -> Option<BuildCommand> {
        self.in_flight.remove(command_id).map(|e| e.command)
    }

    /// Return an unacknowledged command to the front of the queue.
    ///
    /// The retry carries the same command id. Returns false when the
    /// command was already acknowledged or is unknown.
    pub fn requeue_unacked(&mut self, command_id: &str) -> bool {
        let unacked = self
            .in_flight
            .get(command_id)
            .map(|e| !e.acked)
            .unwrap_or(false);
        if !unacked {
            return false;
        }
        let entry = self.in_flight.remove(command_id).expect("checked above");
        self.queued.push_front(entry.command);
        true
    }

    /// Drop a still-queued command for a session, e.g. on cancel before
    /// dispatch. Returns the removed command.
    pub fn remove_queued_for_session(&mut self, session_id: &str) -> Option<BuildCommand> {
        let pos = self.queued.iter().position(|c| c.session_id == session_id)?;
        self.queued.remove(pos)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bldr_protocol::OperationType;

    fn command(id: &str, session: &str) -> BuildCommand {
        BuildCommand {
            command_id: id.to_string(),
            project_id: "p1".to_string(),
            session_id: session.to_string(),
            build_id: format!("b-{}", session),
            prompt: "build it".to_string(),
            agent_id: "claude-code".to_string(),
            model_id: "default".to_string(),
            operation: OperationType::InitialBuild,
            workspace_path: "/tmp/ws".to_string(),
            context: None,
        }
    }

    #[test]
    fn test_dispatch_respects_concurrency() {
        let mut queue = CommandQueue::new();
        assert!(queue.enqueue(command("c1", "s1")));
        assert!(queue.enqueue(command("c2", "s2")));

        assert!(queue.next_dispatch(1).is_some());
        // Slot taken until the result closes it out.
        assert!(queue.next_dispatch(1).is_none());

        queue.ack("c1");
        assert!(queue.next_dispatch(1).is_none());

        queue.complete("c1");
        let second = queue.next_dispatch(1).unwrap();
        assert_eq!(second.command_id, "c2");
    }

    #[test]
    fn test_session_enqueued_at_most_once() {
        let mut queue = CommandQueue::new();
        assert!(queue.enqueue(command("c1", "s1")));
        assert!(!queue.enqueue(command("c1-retry", "s1")));

        queue.next_dispatch(4);
        assert!(!queue.enqueue(command("c1-again", "s1")));
    }

    #[test]
    fn test_requeue_keeps_command_id() {
        let mut queue = CommandQueue::new();
        queue.enqueue(command("c1", "s1"));
        let dispatched = queue.next_dispatch(1).unwrap();
        assert_eq!(dispatched.command_id, "c1");

        // No ack in time: back to the front with the same id.
        assert!(queue.requeue_unacked("c1"));
        let retried = queue.next_dispatch(1).unwrap();
        assert_eq!(retried.command_id, "c1");

        // Acked commands stay in flight.
        queue.ack("c1");
        assert!(!queue.requeue_unacked("c1"));
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[test]
    fn test_remove_queued_for_session() {
        let mut queue = CommandQueue::new();
        queue.enqueue(command("c1", "s1"));
        queue.enqueue(command("c2", "s2"));

        let removed = queue.remove_queued_for_session("s1").unwrap();
        assert_eq!(removed.command_id, "c1");
        assert_eq!(queue.queued_count(), 1);
        assert!(queue.remove_queued_for_session("s1").is_none());
    }
}
