pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
