//! IR data model for the HDL simulation core.
//!
//! The HDL frontend (an external Verilog compiler) elaborates a design and
//! emits a tree of typed expressions, variable definitions, and per-clock-edge
//! evaluation blocks.  This crate defines those types as they cross the
//! frontend boundary, plus the size model the code generator builds on:
//! every signal is classified by byte size, alignment, and — for values wider
//! than 64 bits — its count of little-endian 32-bit chunks.
//!
//! All node types derive `serde` traits so a host can deserialize the
//! frontend's JSON dump directly.  Big constants serialize as hex strings.
//!
//! The [`build`] module offers constructors for assembling IR by hand, used
//! by hosts that synthesize small designs and by the test suites.

pub mod build;
mod dtype;
mod expr;
mod module;

pub use dtype::{DataType, NativeType};
pub use expr::{BinaryOp, ConstVal, Expr, ExprKind, TriOp, UnaryOp};
pub use module::{
    BlockDef, InitItem, InitValue, ModuleDef, VarDef, BLOCK_CHANGE_REQUEST,
    BLOCK_CTOR_VAR_RESET, BLOCK_EVAL, BLOCK_EVAL_INITIAL, BLOCK_EVAL_SETTLE,
};
