//! Utility modules shared by the pipeline components.

pub mod errors;
pub mod logger;

pub use errors::{Result, StorageError, UplinkError};
