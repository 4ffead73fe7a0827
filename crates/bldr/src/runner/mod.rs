//! Runner transport: registry of connected runners, per-runner command
//! queues, and the WebSocket endpoint runners dial into.

mod queue;
mod registry;
mod socket;

pub use queue::CommandQueue;
pub use registry::{RegistryConfig, RunnerInfo, RunnerRegistry};
pub use socket::runner_ws_handler;
