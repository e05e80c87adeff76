//! # Core Infrastructure

pub mod unified_error;

pub use unified_error::{ConfigErrorType, ModelErrorType, UnifiedError, UnifiedResult};
