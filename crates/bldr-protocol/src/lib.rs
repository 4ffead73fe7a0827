//! Shared protocol types for bldr.
//!
//! Three layers, all JSON on the wire:
//! - [`update`]: the canonical build-update vocabulary produced by runner
//!   normalizers and consumed by the control plane and browsers.
//! - [`runner`]: the runner <-> control-plane transport frames.
//! - [`browser`]: the control-plane -> browser fanout frames and the
//!   recovery snapshot.
//!
//! Receivers must tolerate message kinds they do not know about. Every
//! tagged enum here is decoded through [`Incoming`], which preserves
//! unrecognized payloads verbatim instead of failing the whole frame.

pub mod browser;
pub mod runner;
pub mod update;

pub use browser::{
    ClientMessage, RecoverySnapshot, ServerMessage, SessionView, TodoView, ToolCallView,
};
pub use runner::{
    BuildCommand, ControlMessage, DevServerState, OperationType, RunnerHello, RunnerMessage,
};
pub use update::{
    BuildOutcome, Incoming, SessionStatus, TodoItem, TodoPhase, TodoStatus, ToolCallState,
    TraceContext, UpdateEnvelope, UpdatePayload,
};

/// Default heartbeat interval for the runner transport, seconds.
pub const RUNNER_HEARTBEAT_SECS: u64 = 15;

/// Default heartbeat interval for browser sockets, seconds.
pub const BROWSER_HEARTBEAT_SECS: u64 = 30;

/// Peer-silence multiplier: a channel with no traffic for this many
/// heartbeat intervals is considered dead.
pub const LIVENESS_MULTIPLIER: u32 = 3;
