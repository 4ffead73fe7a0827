//! Runner key domain: bearer credentials identifying runners for a user.

mod models;
mod repository;

pub use models::{RunnerKey, RunnerKeyCreated};
pub use repository::{hash_key, RunnerKeyRepository};
