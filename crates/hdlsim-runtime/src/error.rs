//! Runtime error types.

use hdlsim_codegen::CodegenError;
use thiserror::Error;

/// Errors surfaced while driving a compiled module.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Codegen failed before instantiation.
    #[error(transparent)]
    Codegen(#[from] CodegenError),

    /// The powercycle settle loop ran out of iterations.
    #[error("settle did not converge after {0} iterations")]
    SettleDidNotConverge(u32),

    /// `$readmem` could not resolve a filename through the host callback.
    #[error("$readmem: missing file: {0}")]
    MissingFile(String),

    /// `$readmem` parsed more entries than the destination holds.
    /// The destination bytes are left untouched.
    #[error("$readmem: {file}: {lines} entries exceed a destination of {capacity}")]
    ReadmemOverflow {
        file: String,
        lines: usize,
        capacity: usize,
    },

    /// `load_state` was handed a blob of the wrong length.
    #[error("state blob size mismatch: expected {expected} bytes, got {got}")]
    StateSizeMismatch { expected: usize, got: usize },

    /// A proxy access referenced a name the layout does not know.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// A proxy write does not fit the signal's representation.
    #[error("value does not fit signal {0}")]
    InvalidValue(String),

    /// The module must be instantiated first.
    #[error("not initialized; call init() first")]
    NotInitialized,

    /// An unclassified trap out of the WASM engine.
    #[error("WASM trap: {0}")]
    Trap(String),
}

/// Runtime result type alias.
pub type SimResult<T> = Result<T, RuntimeError>;
