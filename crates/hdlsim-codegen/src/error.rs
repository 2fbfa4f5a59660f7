//! Codegen error types.

use thiserror::Error;

/// Errors that can occur while laying out state or generating WASM.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// A data type or operation the generator cannot express
    /// (wide mul/div, multidimensional initializers, …).
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// The IR carries an operator the translator has no emitter for.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// The generated WASM module failed validation.
    #[error("WASM validation failed: {0}")]
    ValidationFailed(String),

    /// The state layout exceeds the configured memory cap.
    #[error("memory limit exceeded: {need} bytes needed, {cap} bytes allowed")]
    MemoryLimitExceeded { need: u64, cap: u64 },

    /// An internal consistency check failed.
    #[error("internal codegen error: {0}")]
    Internal(String),
}

/// Codegen result type alias.
pub type CodegenResult<T> = Result<T, CodegenError>;
