pub mod config;
pub mod error;
pub mod logging;
pub mod module;

pub use error::{PropagationError, Result};
pub use module::engine::{EngineBuilder, PropagationEngine, UpdateReport};
pub use module::state::PropagationState;
