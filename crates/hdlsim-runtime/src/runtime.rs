//! Simulation driver.
//!
//! Owns the wasmi engine, store, and instance for one compiled module and
//! exposes the host lifecycle: `powercycle`, `eval`, `tick`, `tick2`,
//! `reset`, state save/restore, and the per-variable proxy.
//!
//! Everything is single-threaded and cooperative: every entry point runs to
//! completion on the caller's thread and produces the same state bytes for
//! the same inputs.  The `$finish`/`$stop` flags, the `$time` origin, and
//! the `$rand` generator are per instance, so several simulators can run
//! side by side without interference.

use std::sync::Arc;
use std::time::Instant;

use hdlsim_codegen::{compile, CodegenError, LayoutEntry, SimConfig, StateLayout};
use hdlsim_ir::{DataType, InitValue, ModuleDef};
use log::debug;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use wasmi::core::Trap;
use wasmi::{Caller, Engine, Linker, Memory, Store, TypedFunc};

use crate::error::{RuntimeError, SimResult};
use crate::proxy::{self, SignalValue};

/// Host callback resolving `$readmem` filenames to file contents.
pub type FileProvider = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Settle-loop cap inside `powercycle`.
const SETTLE_ITERATIONS: u32 = 100;
/// How many cycles `reset` holds `rst_n` low.
const RESET_HOLD_TICKS: u32 = 10;

/// Per-instance host state visible to the imported builtins.
pub(crate) struct HostState {
    finished: bool,
    stopped: bool,
    time_origin: Instant,
    rng: SmallRng,
    get_file_data: Option<FileProvider>,
    /// Structured error carried across the wasmi trap boundary.
    pending_error: Option<RuntimeError>,
}

pub(crate) struct Instantiated {
    store: Store<HostState>,
    memory: Memory,
    fn_ctor: TypedFunc<i32, ()>,
    fn_initial: TypedFunc<i32, ()>,
    fn_settle: TypedFunc<i32, ()>,
    fn_eval_blk: TypedFunc<i32, ()>,
    fn_chg: TypedFunc<i32, i32>,
    fn_eval: TypedFunc<i32, ()>,
    fn_tick2: Option<TypedFunc<(i32, i32), ()>>,
}

impl Instantiated {
    pub(crate) fn memory_data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn take_error(&mut self, fallback: String) -> RuntimeError {
        match self.store.data_mut().pending_error.take() {
            Some(err) => err,
            None => RuntimeError::Trap(fallback),
        }
    }

    fn call_void(&mut self, f: TypedFunc<i32, ()>) -> SimResult<()> {
        let r = f.call(&mut self.store, 0);
        r.map_err(|e| self.take_error(e.to_string()))
    }
}

/// One simulator instance: compiled WASM plus the runtime driving it.
pub struct HdlSim {
    layout: Arc<StateLayout>,
    wasm: Vec<u8>,
    has_clk: bool,
    file_provider: Option<FileProvider>,
    pub(crate) inst: Option<Instantiated>,
    pub(crate) trace_cursor: u32,
}

impl HdlSim {
    /// Compile `module` (plus an optional shared constant pool).  Codegen
    /// errors surface here, before any instantiation, so the host can fall
    /// back to showing source errors.
    pub fn new(
        module: &ModuleDef,
        pool: Option<&ModuleDef>,
        config: &SimConfig,
    ) -> SimResult<Self> {
        let compiled = compile(module, pool, config)?;
        let trace_cursor = compiled.layout.trace_start;
        Ok(Self {
            layout: Arc::new(compiled.layout),
            wasm: compiled.wasm,
            has_clk: compiled.has_clk,
            file_provider: None,
            inst: None,
            trace_cursor,
        })
    }

    /// The compiled WASM bytes.
    pub fn wasm(&self) -> &[u8] {
        &self.wasm
    }

    /// The frozen layout; `lookup(name)` gives raw `{offset, size, dtype}`
    /// for hosts that read memory directly (video/audio hot paths).
    pub fn globals(&self) -> &StateLayout {
        &self.layout
    }

    /// Install the `$readmem` file-lookup callback.
    pub fn set_file_provider(
        &mut self,
        provider: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) {
        let provider: FileProvider = Arc::new(provider);
        if let Some(inst) = &mut self.inst {
            inst.store.data_mut().get_file_data = Some(provider.clone());
        }
        self.file_provider = Some(provider);
    }

    /// Reseed the `$rand` generator (deterministic by default).
    pub fn seed_rand(&mut self, seed: u64) -> SimResult<()> {
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        inst.store.data_mut().rng = SmallRng::seed_from_u64(seed);
        Ok(())
    }

    // ── Instantiation ────────────────────────────────────────────────────

    /// Compile and instantiate the WASM module.  wasmi compiles
    /// synchronously, so this is the sync entry the host contract requires.
    pub fn init(&mut self) -> SimResult<()> {
        let engine = Engine::default();
        let module = wasmi::Module::new(&engine, &self.wasm[..])
            .map_err(|e| RuntimeError::Trap(format!("module parse: {e}")))?;

        let host = HostState {
            finished: false,
            stopped: false,
            time_origin: Instant::now(),
            rng: SmallRng::seed_from_u64(0),
            get_file_data: self.file_provider.clone(),
            pending_error: None,
        };
        let mut store = Store::new(&engine, host);
        let mut linker = Linker::<HostState>::new(&engine);
        self.link_builtins(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| RuntimeError::Trap(format!("instantiate: {e}")))?
            .start(&mut store)
            .map_err(|e| RuntimeError::Trap(format!("start: {e}")))?;

        let memory = instance
            .get_export(&store, "memory")
            .and_then(|e| e.into_memory())
            .ok_or_else(|| RuntimeError::Trap("missing memory export".into()))?;

        let typed = |name: &str| -> SimResult<TypedFunc<i32, ()>> {
            instance
                .get_typed_func::<i32, ()>(&store, name)
                .map_err(|e| RuntimeError::Trap(format!("export {name}: {e}")))
        };
        let fn_ctor = typed("_ctor_var_reset")?;
        let fn_initial = typed("_eval_initial")?;
        let fn_settle = typed("_eval_settle")?;
        let fn_eval_blk = typed("_eval")?;
        let fn_eval = typed("eval")?;
        let fn_chg = instance
            .get_typed_func::<i32, i32>(&store, "_change_request")
            .map_err(|e| RuntimeError::Trap(format!("export _change_request: {e}")))?;
        let fn_tick2 = if self.has_clk {
            Some(
                instance
                    .get_typed_func::<(i32, i32), ()>(&store, "tick2")
                    .map_err(|e| RuntimeError::Trap(format!("export tick2: {e}")))?,
            )
        } else {
            None
        };

        self.inst = Some(Instantiated {
            store,
            memory,
            fn_ctor,
            fn_initial,
            fn_settle,
            fn_eval_blk,
            fn_chg,
            fn_eval,
            fn_tick2,
        });
        Ok(())
    }

    /// Drop the instance; the compiled module can be re-`init`ed later.
    pub fn dispose(&mut self) {
        self.inst = None;
    }

    fn link_builtins(&self, linker: &mut Linker<HostState>) -> SimResult<()> {
        fn link_err(e: impl std::fmt::Display) -> RuntimeError {
            RuntimeError::Trap(e.to_string())
        }

        linker
            .func_wrap(
                "builtins",
                "$finish",
                |mut caller: Caller<'_, HostState>, _dp: i32, line: i32| {
                    let host = caller.data_mut();
                    if !host.finished {
                        debug!("$finish at line {line}");
                    }
                    host.finished = true;
                },
            )
            .map_err(link_err)?;

        linker
            .func_wrap(
                "builtins",
                "$stop",
                |mut caller: Caller<'_, HostState>, _dp: i32, line: i32| {
                    let host = caller.data_mut();
                    if !host.stopped {
                        debug!("$stop at line {line}");
                    }
                    host.stopped = true;
                },
            )
            .map_err(link_err)?;

        linker
            .func_wrap(
                "builtins",
                "$time",
                |caller: Caller<'_, HostState>, _dp: i32| -> i64 {
                    caller.data().time_origin.elapsed().as_millis() as i64
                },
            )
            .map_err(link_err)?;

        linker
            .func_wrap(
                "builtins",
                "$rand",
                |mut caller: Caller<'_, HostState>, _dp: i32| -> i32 {
                    caller.data_mut().rng.next_u32() as i32
                },
            )
            .map_err(link_err)?;

        let layout = self.layout.clone();
        linker
            .func_wrap(
                "builtins",
                "$readmem",
                move |mut caller: Caller<'_, HostState>,
                      dp: i32,
                      fname_ptr: i32,
                      mem_ptr: i32,
                      is_hex: i32|
                      -> Result<(), Trap> {
                    match host_readmem(&mut caller, &layout, dp, fname_ptr, mem_ptr, is_hex != 0) {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            let msg = err.to_string();
                            caller.data_mut().pending_error = Some(err);
                            Err(Trap::new(msg))
                        }
                    }
                },
            )
            .map_err(link_err)?;

        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Power-on reset: zero the mutable state, re-apply constants and
    /// initial values, run `_ctor_var_reset` and `_eval_initial`, then
    /// settle to a fixed point.
    pub fn powercycle(&mut self) -> SimResult<()> {
        let layout = self.layout.clone();
        self.trace_cursor = layout.trace_start;
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;

        {
            let host = inst.store.data_mut();
            host.finished = false;
            host.stopped = false;
            host.time_origin = Instant::now();
        }

        {
            let mem = inst.memory.data_mut(&mut inst.store);
            mem[..layout.state_bytes() as usize].fill(0);

            let meta = layout.meta_offset as usize;
            mem[meta..meta + 4].copy_from_slice(&layout.output_bytes.to_le_bytes());
            mem[meta + 4..meta + 8].copy_from_slice(&layout.trace_start.to_le_bytes());
            mem[meta + 8..meta + 12].copy_from_slice(&layout.trace_end.to_le_bytes());

            for entry in layout.entries() {
                if let Some(cv) = &entry.const_value {
                    write_raw_const(entry, cv, mem);
                }
                if let Some(init) = &entry.init_value {
                    apply_init_value(entry, init, mem)?;
                }
            }
        }

        inst.call_void(inst.fn_ctor)?;
        inst.call_void(inst.fn_initial)?;

        for i in 0..SETTLE_ITERATIONS {
            inst.call_void(inst.fn_settle)?;
            inst.call_void(inst.fn_eval_blk)?;
            let changed = inst
                .fn_chg
                .call(&mut inst.store, 0)
                .map_err(|e| RuntimeError::Trap(e.to_string()))?;
            if changed == 0 {
                debug!("powercycle settled after {} iterations", i + 1);
                return Ok(());
            }
        }
        Err(RuntimeError::SettleDidNotConverge(SETTLE_ITERATIONS))
    }

    /// Run the exported `eval` (bounded internal fixed point).
    pub fn eval(&mut self) -> SimResult<()> {
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        inst.call_void(inst.fn_eval)
    }

    /// Flip bit 0 of `clk`, then `eval`.
    pub fn tick(&mut self) -> SimResult<()> {
        let clk = self.get("clk")?.as_u64();
        self.set("clk", (clk ^ 1) as u32)?;
        self.eval()
    }

    /// Run `iters` full clock cycles through the exported `tick2`.
    /// Without a clock, `tick2` degenerates to repeated `eval`.
    pub fn tick2(&mut self, iters: u32) -> SimResult<()> {
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        match inst.fn_tick2 {
            Some(f) => {
                let r = f.call(&mut inst.store, (0, iters as i32));
                r.map_err(|e| inst.take_error(e.to_string()))
            }
            None => {
                for _ in 0..iters {
                    inst.call_void(inst.fn_eval)?;
                }
                Ok(())
            }
        }
    }

    /// Convenience reset: preserve `ui_in` across a powercycle, then hold
    /// `rst_n` low for a few cycles before releasing it.
    pub fn reset(&mut self) -> SimResult<()> {
        let ui_in = self.layout.lookup("ui_in").map(|_| self.get("ui_in")).transpose()?;
        self.powercycle()?;
        if let Some(v) = ui_in {
            self.set("ui_in", v)?;
        }
        if self.layout.lookup("rst_n").is_some() {
            self.set("rst_n", 0u32)?;
            self.tick2(RESET_HOLD_TICKS)?;
            self.set("rst_n", 1u32)?;
        }
        Ok(())
    }

    /// Whether generated code hit `$finish` / `$stop`.
    pub fn is_finished(&self) -> bool {
        self.inst
            .as_ref()
            .map(|i| i.store.data().finished)
            .unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        self.inst
            .as_ref()
            .map(|i| i.store.data().stopped)
            .unwrap_or(false)
    }

    // ── State persistence ────────────────────────────────────────────────

    /// Snapshot the persisted region: outputs + internal + constants.
    pub fn save_state(&self) -> SimResult<Vec<u8>> {
        let inst = self.inst.as_ref().ok_or(RuntimeError::NotInitialized)?;
        let mem = inst.memory.data(&inst.store);
        Ok(mem[..self.layout.state_bytes() as usize].to_vec())
    }

    /// Restore a snapshot taken by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, bytes: &[u8]) -> SimResult<()> {
        let expected = self.layout.state_bytes() as usize;
        if bytes.len() != expected {
            return Err(RuntimeError::StateSizeMismatch {
                expected,
                got: bytes.len(),
            });
        }
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        inst.memory.data_mut(&mut inst.store)[..expected].copy_from_slice(bytes);
        Ok(())
    }

    // ── State proxy ──────────────────────────────────────────────────────

    fn entry(&self, name: &str) -> SimResult<&LayoutEntry> {
        self.layout
            .lookup(name)
            .ok_or_else(|| RuntimeError::UnknownSignal(name.to_string()))
    }

    /// Read one variable through its storage representation.
    pub fn get(&self, name: &str) -> SimResult<SignalValue> {
        let entry = self.entry(name)?;
        let inst = self.inst.as_ref().ok_or(RuntimeError::NotInitialized)?;
        Ok(proxy::read(entry, 0, inst.memory.data(&inst.store)))
    }

    /// Write one variable, masked to its declared width.
    pub fn set(&mut self, name: &str, value: impl Into<SignalValue>) -> SimResult<()> {
        let value = value.into();
        let entry = self.entry(name)?.clone();
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        proxy::write(&entry, 0, inst.memory.data_mut(&mut inst.store), &value)
    }

    /// Borrowed byte view over one variable (arrays and hot paths).
    pub fn signal_bytes(&self, name: &str) -> SimResult<&[u8]> {
        let entry = self.entry(name)?;
        let range = entry.offset as usize..(entry.offset + entry.size) as usize;
        let inst = self.inst.as_ref().ok_or(RuntimeError::NotInitialized)?;
        Ok(&inst.memory.data(&inst.store)[range])
    }

    /// Mutable byte view for in-place array mutation.
    pub fn signal_bytes_mut(&mut self, name: &str) -> SimResult<&mut [u8]> {
        let entry = self.entry(name)?;
        let range = entry.offset as usize..(entry.offset + entry.size) as usize;
        let inst = self.inst.as_mut().ok_or(RuntimeError::NotInitialized)?;
        Ok(&mut inst.memory.data_mut(&mut inst.store)[range])
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Constants & initial values
// ══════════════════════════════════════════════════════════════════════════════

fn write_raw_const(entry: &LayoutEntry, cv: &hdlsim_ir::ConstVal, mem: &mut [u8]) {
    let width = entry.dtype.width();
    let mut big = cv.value_big();
    big &= (num_bigint::BigUint::from(1u8) << width) - 1u8;
    let bytes = big.to_bytes_le();
    let at = entry.offset as usize;
    let size = entry.size as usize;
    let n = bytes.len().min(size);
    mem[at..at + n].copy_from_slice(&bytes[..n]);
    mem[at + n..at + size].fill(0);
}

/// Element size used by array initializers and `$readmem`: array element
/// bytes, 32-bit chunks for wide logic, the whole container otherwise.
fn element_size(dtype: &DataType) -> u32 {
    match dtype {
        DataType::Array { subtype, .. } => subtype.size_bytes(),
        DataType::Logic { .. } if dtype.is_wide() => 4,
        DataType::Logic { .. } => dtype.size_bytes(),
    }
}

fn apply_init_value(entry: &LayoutEntry, init: &InitValue, mem: &mut [u8]) -> SimResult<()> {
    let InitValue::Array(items) = init;
    let elsize = element_size(&entry.dtype) as usize;
    let capacity = entry.size as usize / elsize;
    for item in items {
        if item.nested.is_some() {
            return Err(CodegenError::UnsupportedDataType(format!(
                "multidimensional initializer on {}",
                entry.name
            ))
            .into());
        }
        let v = item
            .value
            .as_ref()
            .map(|c| c.value_u64())
            .unwrap_or(0);
        let idx = item.index as usize;
        if idx >= capacity {
            return Err(RuntimeError::InvalidValue(entry.name.clone()));
        }
        let at = entry.offset as usize + idx * elsize;
        let bytes = v.to_le_bytes();
        let n = elsize.min(8);
        mem[at..at + n].copy_from_slice(&bytes[..n]);
        if elsize > 8 {
            mem[at + 8..at + elsize].fill(0);
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// $readmem
// ══════════════════════════════════════════════════════════════════════════════

/// Resolve and parse a `$readmem` file, then write its entries into
/// successive elements of the destination.  All parsing happens before the
/// first write so a failure leaves the destination untouched.
fn host_readmem(
    caller: &mut Caller<'_, HostState>,
    layout: &StateLayout,
    dp: i32,
    fname_ptr: i32,
    mem_ptr: i32,
    is_hex: bool,
) -> Result<(), RuntimeError> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| RuntimeError::Trap("missing memory export".into()))?;

    let file = {
        let data = memory.data(&caller);
        read_cstr(data, fname_ptr as usize)
    };

    let offset = (mem_ptr - dp) as u32;
    let entry = layout
        .entries()
        .iter()
        .find(|e| e.offset == offset)
        .ok_or_else(|| RuntimeError::UnknownSignal(format!("$readmem target @{offset}")))?;

    let content = caller
        .data()
        .get_file_data
        .as_ref()
        .and_then(|f| f(&file))
        .ok_or_else(|| RuntimeError::MissingFile(file.clone()))?;

    let radix = if is_hex { 16 } else { 2 };
    let mut values = Vec::new();
    for line in content.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let v = u64::from_str_radix(line, radix)
            .map_err(|_| RuntimeError::InvalidValue(format!("{file}: {line}")))?;
        values.push(v);
    }

    let elsize = element_size(&entry.dtype) as usize;
    let capacity = entry.size as usize / elsize;
    if values.len() > capacity {
        return Err(RuntimeError::ReadmemOverflow {
            file,
            lines: values.len(),
            capacity,
        });
    }

    debug!("$readmem {file}: {} entries into {}", values.len(), entry.name);
    let mem = memory.data_mut(caller);
    for (i, v) in values.iter().enumerate() {
        let at = mem_ptr as usize + i * elsize;
        let bytes = v.to_le_bytes();
        let n = elsize.min(8);
        mem[at..at + n].copy_from_slice(&bytes[..n]);
        if elsize > 8 {
            mem[at + 8..at + elsize].fill(0);
        }
    }
    Ok(())
}

fn read_cstr(data: &[u8], at: usize) -> String {
    let end = data[at..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| at + p)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[at..end]).into_owned()
}
