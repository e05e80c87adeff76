//! Unified Error Types
//!
//! Single error taxonomy for the whole crate. Construction-time problems are
//! `Configuration` and are fatal; per-call contract violations are
//! `Validation` and propagate to the caller unchanged; tensor-op failures
//! surface as `Processing`. Degenerate numeric inputs (an all-zero line
//! drawing) are NOT errors - the selection stage defines a deterministic
//! fallback for them.

use std::fmt;

/// Result alias used throughout the crate
pub type UnifiedResult<T> = Result<T, UnifiedError>;

/// Configuration error detail
#[derive(Debug)]
pub enum ConfigErrorType {
    /// A configuration value is outside its documented range
    InvalidValue { field: String, reason: String },
    /// Configuration text could not be parsed
    ParseError(String),
    /// A required configuration field is missing
    MissingField(String),
}

impl fmt::Display for ConfigErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorType::InvalidValue { field, reason } => {
                write!(f, "invalid value for '{}': {}", field, reason)
            }
            ConfigErrorType::ParseError(msg) => write!(f, "parse error: {}", msg),
            ConfigErrorType::MissingField(field) => write!(f, "missing field '{}'", field),
        }
    }
}

/// Which model component an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorType {
    /// The transformer backbone (loading, surgery, blocks)
    Backbone,
    /// The patch importance scorer
    Scorer,
    /// The spatial threshold selector
    Selector,
}

impl fmt::Display for ModelErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErrorType::Backbone => write!(f, "backbone"),
            ModelErrorType::Scorer => write!(f, "scorer"),
            ModelErrorType::Selector => write!(f, "selector"),
        }
    }
}

/// Unified error type for all crate operations
#[derive(Debug)]
pub enum UnifiedError {
    /// Invalid configuration, raised at construction and never recovered
    Configuration {
        operation: String,
        source: ConfigErrorType,
        context: Option<String>,
    },
    /// Input violates a shape or value contract of the called operation
    Validation {
        field: String,
        expected: String,
        actual: String,
        context: Option<String>,
    },
    /// Model loading or structural adaptation failed
    Model {
        model_type: ModelErrorType,
        operation: String,
        source: String,
        context: Option<String>,
    },
    /// A tensor operation failed mid-pipeline
    Processing {
        operation: String,
        source: String,
        input_context: Option<String>,
    },
    /// Filesystem or network I/O failed
    IO {
        operation: String,
        path: Option<String>,
        source: std::io::Error,
    },
}

impl UnifiedError {
    /// Configuration error with an invalid-value detail
    pub fn config(operation: &str, field: &str, reason: impl Into<String>) -> Self {
        UnifiedError::Configuration {
            operation: operation.to_string(),
            source: ConfigErrorType::InvalidValue {
                field: field.to_string(),
                reason: reason.into(),
            },
            context: None,
        }
    }

    /// Shape/contract validation error
    pub fn validation(field: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        UnifiedError::Validation {
            field: field.to_string(),
            expected: expected.into(),
            actual: actual.into(),
            context: None,
        }
    }

    /// Processing error wrapping a lower-level failure
    pub fn processing(operation: &str, source: impl fmt::Display) -> Self {
        UnifiedError::Processing {
            operation: operation.to_string(),
            source: source.to_string(),
            input_context: None,
        }
    }
}

impl fmt::Display for UnifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnifiedError::Configuration {
                operation,
                source,
                context,
            } => {
                write!(f, "Configuration error during {}: {}", operation, source)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            UnifiedError::Validation {
                field,
                expected,
                actual,
                context,
            } => {
                write!(
                    f,
                    "Validation error for {}: expected {}, got {}",
                    field, expected, actual
                )?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            UnifiedError::Model {
                model_type,
                operation,
                source,
                context,
            } => {
                write!(
                    f,
                    "Model error in {} during {}: {}",
                    model_type, operation, source
                )?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            UnifiedError::Processing {
                operation,
                source,
                input_context,
            } => {
                write!(f, "Processing error during {}: {}", operation, source)?;
                if let Some(ctx) = input_context {
                    write!(f, " (input: {})", ctx)?;
                }
                Ok(())
            }
            UnifiedError::IO {
                operation,
                path,
                source,
            } => {
                write!(f, "IO error during {}", operation)?;
                if let Some(p) = path {
                    write!(f, " ({})", p)?;
                }
                write!(f, ": {}", source)
            }
        }
    }
}

impl std::error::Error for UnifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnifiedError::IO { source, .. } => Some(source),
            _ => None,
        }
    }
}
