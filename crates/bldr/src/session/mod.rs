//! Build-session domain: models, persistence, and recovery snapshots.
//!
//! This is the event store of the control plane. Every canonical update a
//! runner streams up is applied here before it is broadcast, so a
//! `fetch_recovery_snapshot` read always reflects at least as much as any
//! browser has seen.

mod models;
mod repository;

pub use models::{Session, StoreError, TodoRow, ToolCallRow};
pub use repository::SessionRepository;
