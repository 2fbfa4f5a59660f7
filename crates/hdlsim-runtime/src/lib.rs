//! Simulation runtime for compiled HDL modules.
//!
//! Drives the WASM module produced by `hdlsim-codegen` through `wasmi`:
//!
//! ```no_run
//! use hdlsim_ir::build::{assign, binop, con, logic, vref, ModuleBuilder};
//! use hdlsim_ir::{BinaryOp, BLOCK_EVAL};
//! use hdlsim_runtime::HdlSim;
//!
//! let module = ModuleBuilder::new("adder")
//!     .input("a", logic(8))
//!     .output("y", logic(8))
//!     .block(
//!         BLOCK_EVAL,
//!         vec![assign(
//!             vref("y"),
//!             binop(BinaryOp::Add, logic(8), vref("a"), con(logic(8), 1)),
//!         )],
//!     )
//!     .build();
//!
//! let mut sim = HdlSim::new(&module, None, &Default::default()).unwrap();
//! sim.init().unwrap();
//! sim.powercycle().unwrap();
//! sim.set("a", 41u32).unwrap();
//! sim.eval().unwrap();
//! assert_eq!(sim.get("y").unwrap().as_u64(), 42);
//! ```
//!
//! The imported builtins (`$finish`, `$stop`, `$time`, `$rand`, `$readmem`)
//! are provided here; `$readmem` resolves filenames through a host callback
//! installed with [`HdlSim::set_file_provider`].

mod error;
mod proxy;
mod runtime;
mod trace;

pub use error::{RuntimeError, SimResult};
pub use hdlsim_codegen::SimConfig;
pub use proxy::SignalValue;
pub use runtime::{FileProvider, HdlSim};
