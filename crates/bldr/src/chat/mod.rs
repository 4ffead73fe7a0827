//! Chat message domain: models and persistence.

mod models;
mod repository;

pub use models::{ChatMessage, ChatRole, CreateMessageRequest};
pub use repository::ChatRepository;
