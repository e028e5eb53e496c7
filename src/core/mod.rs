// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod local_files;
pub mod provision;
pub mod script;
pub mod secrets;
pub mod ssh;
pub mod teardown;
pub mod templates;
pub mod transfer;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
