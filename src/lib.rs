pub mod app;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod platform;

pub use error::{Error, Result};
pub use orchestrator::{CompletionRequest, CompletionResponse, Orchestrator};
