pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::AppConfig;
pub use error::{AstroError, AstroResult, ValidationError};
