//! Project domain: models and persistence.

mod models;
mod repository;

pub use models::{CreateProjectRequest, Project};
pub use repository::ProjectRepository;
