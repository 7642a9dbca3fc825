pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod shared;

pub use crate::application::use_cases::pipeline::QueryPipeline;
pub use crate::domain::entities::AskResponse;
pub use crate::domain::error::{AppError, Result};
pub use crate::infrastructure::bootstrap::EngineContext;
pub use crate::infrastructure::config::Settings;
