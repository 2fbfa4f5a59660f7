//! WASM code generator for elaborated HDL modules.
//!
//! # Architecture
//!
//! Given a [`hdlsim_ir::ModuleDef`] the generator produces a self-contained
//! `.wasm` module plus the frozen [`StateLayout`] describing where every
//! signal lives in linear memory.
//!
//! ## Imports (module `builtins`)
//! - `$finish(dataptr, line)` / `$stop(dataptr, line)`
//! - `$time(dataptr) → i64`
//! - `$rand(dataptr) → i32`
//! - `$readmem(dataptr, filename_ptr, mem_ptr, is_hex)`
//!
//! ## Exports
//! - `_ctor_var_reset`, `_eval_initial`, `_eval_settle`, `_eval`,
//!   `_change_request` — one function per IR block
//! - `eval(dataptr)` — bounded fixed point of `_eval` + `_change_request`
//! - `tick2(dataptr, iters)` — full clock cycles with trace snapshots
//! - `memory` — linear memory (minimum == maximum)
//!
//! ## Value representation
//!
//! Signals of 64 bits or fewer live in their natural 1/2/4/8-byte container;
//! wider signals are arrays of little-endian 32-bit chunks and are operated
//! on entirely in memory (see [`wide`]).

pub mod compiler;
pub mod error;
pub mod expr;
pub mod layout;
pub mod types;
pub mod wide;

pub use compiler::{compile, CompiledModule};
pub use error::{CodegenError, CodegenResult};
pub use layout::{LayoutEntry, StateLayout};
pub use types::SimConfig;
