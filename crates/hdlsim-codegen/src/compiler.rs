//! Main WASM module assembler.
//!
//! Orchestrates the code generation pipeline:
//! 1. Lay out the state buffer (outputs first, then internal state,
//!    constants, the metadata trailer, and the trace ring)
//! 2. Emit one WASM function per IR block, translating expressions
//!    recursively (wide operands dispatch to the chunked path)
//! 3. Emit the helper functions (`copy_trace_rec`, `eval`, `tick2`)
//! 4. Assemble all sections into a module, with constants and ring metadata
//!    as active data segments
//! 5. Validate with `wasmparser`

use std::collections::HashMap;

use hdlsim_ir::{
    BlockDef, DataType, Expr, ExprKind, ModuleDef, NativeType, BLOCK_CHANGE_REQUEST, BLOCK_CTOR_VAR_RESET,
    BLOCK_EVAL, BLOCK_EVAL_INITIAL, BLOCK_EVAL_SETTLE,
};
use log::debug;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, ImportSection, Instruction, MemorySection, MemoryType, Module,
    TypeSection, ValType,
};

use crate::error::{CodegenError, CodegenResult};
use crate::expr::emit_statement;
use crate::layout::{LayoutEntry, StateLayout};
use crate::types::*;

// ══════════════════════════════════════════════════════════════════════════════
// Public API
// ══════════════════════════════════════════════════════════════════════════════

/// The result of compiling one module: the WASM bytes and the frozen layout
/// the runtime drives the module through.
#[derive(Debug)]
pub struct CompiledModule {
    pub wasm: Vec<u8>,
    pub layout: StateLayout,
    /// Whether the design has a `clk` signal (drives the `tick2` shape).
    pub has_clk: bool,
}

/// Compile an elaborated module (plus an optional shared constant pool)
/// into a WASM binary.
pub fn compile(
    module: &ModuleDef,
    pool: Option<&ModuleDef>,
    config: &SimConfig,
) -> CodegenResult<CompiledModule> {
    let compiler = Compiler::new(module, pool, config)?;
    compiler.compile()
}

// ══════════════════════════════════════════════════════════════════════════════
// Compiler
// ══════════════════════════════════════════════════════════════════════════════

struct Compiler<'a> {
    module: &'a ModuleDef,
    config: &'a SimConfig,
    layout: StateLayout,
    /// Block name → absolute WASM function index.
    function_table: HashMap<String, u32>,
    /// Names of the special blocks the module does not define; they get
    /// empty stub functions so the export contract always holds.
    missing_specials: Vec<&'static str>,
}

const SPECIAL_BLOCKS: [&str; 5] = [
    BLOCK_CTOR_VAR_RESET,
    BLOCK_EVAL_INITIAL,
    BLOCK_EVAL_SETTLE,
    BLOCK_EVAL,
    BLOCK_CHANGE_REQUEST,
];

impl<'a> Compiler<'a> {
    fn new(
        module: &'a ModuleDef,
        pool: Option<&'a ModuleDef>,
        config: &'a SimConfig,
    ) -> CodegenResult<Self> {
        let layout = StateLayout::build(module, pool)?;

        let mut function_table = HashMap::new();
        let mut next = IMPORT_COUNT;
        for block in &module.blocks {
            function_table.insert(block.name.clone(), next);
            next += 1;
        }
        let mut missing_specials = Vec::new();
        for name in SPECIAL_BLOCKS {
            if !function_table.contains_key(name) {
                function_table.insert(name.to_string(), next);
                missing_specials.push(name);
                next += 1;
            }
        }

        Ok(Self {
            module,
            config,
            layout,
            function_table,
            missing_specials,
        })
    }

    fn compile(mut self) -> CodegenResult<CompiledModule> {
        let mut func_section = FunctionSection::new();
        let mut code_section = CodeSection::new();

        // ── IR block functions ───────────────────────────────────────────
        let module = self.module;
        for block in &module.blocks {
            let returns_i32 = block.name == BLOCK_CHANGE_REQUEST;
            func_section.function(if returns_i32 { TYPE_DP_I32 } else { TYPE_DP_VOID });
            let body = self.emit_block_fn(block, returns_i32)?;
            code_section.function(&body);
        }
        let missing = std::mem::take(&mut self.missing_specials);
        for name in &missing {
            let returns_i32 = *name == BLOCK_CHANGE_REQUEST;
            func_section.function(if returns_i32 { TYPE_DP_I32 } else { TYPE_DP_VOID });
            let mut f = Function::new(vec![]);
            if returns_i32 {
                f.instruction(&Instruction::I32Const(0));
            }
            f.instruction(&Instruction::End);
            code_section.function(&f);
        }

        // All promotions and string interning happened above; the trailer
        // and ring can now be appended and the layout frozen.
        self.layout.finalize(self.config)?;

        let copy_trace_idx = IMPORT_COUNT + func_section.len();
        func_section.function(TYPE_DP_VOID);
        code_section.function(&self.emit_copy_trace_rec());

        let eval_idx = copy_trace_idx + 1;
        func_section.function(TYPE_DP_VOID);
        code_section.function(&self.emit_eval());

        let has_clk = self.layout.lookup("clk").is_some();
        let tick2_idx = if has_clk {
            func_section.function(TYPE_DP_I32_VOID);
            code_section.function(&self.emit_tick2(eval_idx, copy_trace_idx)?);
            eval_idx + 1
        } else {
            // Without a clock, `tick2` is an alias of `eval`.
            eval_idx
        };

        // ── Assemble the module ──────────────────────────────────────────
        let mut module = Module::new();
        module.section(&self.emit_types());
        module.section(&self.emit_imports());
        module.section(&func_section);
        module.section(&self.emit_memory());
        module.section(&self.emit_exports(eval_idx, tick2_idx));
        module.section(&code_section);
        module.section(&self.emit_data());

        let wasm = module.finish();
        wasmparser::validate(&wasm)
            .map_err(|e| CodegenError::ValidationFailed(format!("{e}")))?;

        debug!(
            "compiled {}: {} bytes of WASM, {} functions",
            self.module.name,
            wasm.len(),
            func_section.len()
        );

        Ok(CompiledModule {
            wasm,
            layout: self.layout,
            has_clk,
        })
    }

    // ── Type section ─────────────────────────────────────────────────────

    fn emit_types(&self) -> TypeSection {
        let mut types = TypeSection::new();
        // TYPE_DP_VOID: (i32) -> ()
        types.function(vec![ValType::I32], vec![]);
        // TYPE_DP_I32: (i32) -> i32
        types.function(vec![ValType::I32], vec![ValType::I32]);
        // TYPE_DP_I64: (i32) -> i64
        types.function(vec![ValType::I32], vec![ValType::I64]);
        // TYPE_DP_I32_VOID: (i32, i32) -> ()
        types.function(vec![ValType::I32, ValType::I32], vec![]);
        // TYPE_DP_I32X3_VOID: (i32, i32, i32, i32) -> ()
        types.function(
            vec![ValType::I32, ValType::I32, ValType::I32, ValType::I32],
            vec![],
        );
        types
    }

    // ── Import section ───────────────────────────────────────────────────

    fn emit_imports(&self) -> ImportSection {
        let mut imports = ImportSection::new();
        imports.import(BUILTINS_MODULE, "$finish", EntityType::Function(TYPE_DP_I32_VOID));
        imports.import(BUILTINS_MODULE, "$stop", EntityType::Function(TYPE_DP_I32_VOID));
        imports.import(BUILTINS_MODULE, "$time", EntityType::Function(TYPE_DP_I64));
        imports.import(BUILTINS_MODULE, "$rand", EntityType::Function(TYPE_DP_I32));
        imports.import(
            BUILTINS_MODULE,
            "$readmem",
            EntityType::Function(TYPE_DP_I32X3_VOID),
        );
        imports
    }

    // ── Memory section ───────────────────────────────────────────────────

    fn emit_memory(&self) -> MemorySection {
        let mut memory = MemorySection::new();
        memory.memory(MemoryType {
            minimum: self.layout.total_pages as u64,
            maximum: Some(self.layout.total_pages as u64),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        memory
    }

    // ── Export section ───────────────────────────────────────────────────

    fn emit_exports(&self, eval_idx: u32, tick2_idx: u32) -> ExportSection {
        let mut exports = ExportSection::new();
        for name in SPECIAL_BLOCKS {
            exports.export(name, ExportKind::Func, self.function_table[name]);
        }
        exports.export("eval", ExportKind::Func, eval_idx);
        exports.export("tick2", ExportKind::Func, tick2_idx);
        exports.export("memory", ExportKind::Memory, 0);
        exports
    }

    // ── Data section ─────────────────────────────────────────────────────

    /// Constants, interned strings, and the ring metadata ship as active
    /// segments so a fresh instance is coherent before the first powercycle.
    fn emit_data(&self) -> DataSection {
        let mut data = DataSection::new();
        for entry in self.layout.entries() {
            if let Some(cv) = &entry.const_value {
                let bytes = const_bytes(cv, &entry.dtype, entry.size);
                data.active(0, &ConstExpr::i32_const(entry.offset as i32), bytes);
            }
        }
        for (offset, s) in self.layout.strings() {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            data.active(0, &ConstExpr::i32_const(*offset as i32), bytes);
        }
        let mut meta = Vec::with_capacity(TRACE_META_BYTES as usize);
        meta.extend_from_slice(&self.layout.output_bytes.to_le_bytes());
        meta.extend_from_slice(&self.layout.trace_start.to_le_bytes());
        meta.extend_from_slice(&self.layout.trace_end.to_le_bytes());
        data.active(
            0,
            &ConstExpr::i32_const(self.layout.meta_offset as i32),
            meta,
        );
        data
    }

    // ── Block functions ──────────────────────────────────────────────────

    fn emit_block_fn(&mut self, block: &BlockDef, returns_i32: bool) -> CodegenResult<Function> {
        let mut scratch = Function::new(vec![]);
        let mut ctx = FuncContext::new(
            &mut self.layout,
            &self.function_table,
            self.config,
            1,
            returns_i32,
        );
        for e in &block.exprs {
            emit_statement(e, &mut ctx, &mut scratch)?;
        }
        if returns_i32 {
            let changed = ctx.changed_local()?;
            scratch.instruction(&Instruction::LocalGet(changed));
        }
        scratch.instruction(&Instruction::End);
        Ok(finalize_function(scratch, &ctx))
    }

    // ── copy_trace_rec ───────────────────────────────────────────────────

    /// Copy the first `TRACERECLEN` bytes of the state region to the trace
    /// ring at `TRACEOFS`, advance, and wrap at `TRACEEND`.  The record is
    /// a multiple of 8 so the copy runs on 64-bit loads/stores.
    fn emit_copy_trace_rec(&self) -> Function {
        let reclen = self.layout.output_bytes;
        let meta = self.layout.meta_offset as u64;
        if reclen == 0 || self.config.trace_depth == 0 {
            let mut f = Function::new(vec![]);
            f.instruction(&Instruction::End);
            return f;
        }
        // local 1: TRACEOFS, local 2: byte index
        let mut f = Function::new(vec![(2, ValType::I32)]);
        let (dp, ofs, i) = (0, 1, 2);

        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::I32Load(memarg(meta + 4, 2)));
        f.instruction(&Instruction::LocalSet(ofs));

        f.instruction(&Instruction::Block(BlockType::Empty));
        f.instruction(&Instruction::Loop(BlockType::Empty));
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Const(reclen as i32));
        f.instruction(&Instruction::I32GeU);
        f.instruction(&Instruction::BrIf(1));
        // ring[ofs + i] = state[i]
        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::LocalGet(ofs));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::I64Load(memarg(0, 3)));
        f.instruction(&Instruction::I64Store(memarg(0, 3)));
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Const(8));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalSet(i));
        f.instruction(&Instruction::Br(0));
        f.instruction(&Instruction::End);
        f.instruction(&Instruction::End);

        // TRACEOFS = advanced offset, wrapped to the ring start.
        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::I32Const(self.layout.trace_start as i32));
        f.instruction(&Instruction::LocalGet(ofs));
        f.instruction(&Instruction::I32Const(reclen as i32));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalTee(ofs));
        f.instruction(&Instruction::LocalGet(ofs));
        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::I32Load(memarg(meta + 8, 2)));
        f.instruction(&Instruction::I32GeU);
        f.instruction(&Instruction::Select);
        f.instruction(&Instruction::I32Store(memarg(meta + 4, 2)));
        f.instruction(&Instruction::End);
        f
    }

    // ── eval ─────────────────────────────────────────────────────────────

    /// Fixed-point helper: run `_eval`, check `_change_request`, recurse up
    /// to the configured depth.  Generated as nested `if`s, not a loop, so
    /// an optimizer can inline it; on exhaustion it silently stops.
    fn emit_eval(&self) -> Function {
        let mut f = Function::new(vec![]);
        let eval_blk = self.function_table[BLOCK_EVAL];
        let chg_blk = self.function_table[BLOCK_CHANGE_REQUEST];
        let depth = self.config.max_eval_iterations.max(1);
        for _ in 0..depth {
            f.instruction(&Instruction::LocalGet(0));
            f.instruction(&Instruction::Call(eval_blk));
            f.instruction(&Instruction::LocalGet(0));
            f.instruction(&Instruction::Call(chg_blk));
            f.instruction(&Instruction::If(BlockType::Empty));
        }
        for _ in 0..depth {
            f.instruction(&Instruction::End);
        }
        f.instruction(&Instruction::End);
        f
    }

    // ── tick2 ────────────────────────────────────────────────────────────

    /// `tick2(dataptr, iters)`: each iteration drives a full clock cycle
    /// (`clk=0; eval; clk=1; eval`) and then snapshots the trace record.
    fn emit_tick2(&self, eval_idx: u32, copy_trace_idx: u32) -> CodegenResult<Function> {
        let clk = self
            .layout
            .lookup("clk")
            .ok_or_else(|| CodegenError::Internal("tick2 without clk".into()))?;
        let (clk_offset, clk_size) = (clk.offset as u64, clk.size);
        let mut f = Function::new(vec![(1, ValType::I32)]);
        let (dp, iters, i) = (0, 1, 2);

        f.instruction(&Instruction::Block(BlockType::Empty));
        f.instruction(&Instruction::Loop(BlockType::Empty));
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::LocalGet(iters));
        f.instruction(&Instruction::I32GeU);
        f.instruction(&Instruction::BrIf(1));

        for clk_value in [0, 1] {
            f.instruction(&Instruction::LocalGet(dp));
            f.instruction(&Instruction::I32Const(clk_value));
            f.instruction(&store_sized(clk_size, clk_offset));
            f.instruction(&Instruction::LocalGet(dp));
            f.instruction(&Instruction::Call(eval_idx));
        }
        f.instruction(&Instruction::LocalGet(dp));
        f.instruction(&Instruction::Call(copy_trace_idx));

        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Const(1));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalSet(i));
        f.instruction(&Instruction::Br(0));
        f.instruction(&Instruction::End);
        f.instruction(&Instruction::End);
        f.instruction(&Instruction::End);
        Ok(f)
    }
}

fn store_sized(size: u32, offset: u64) -> Instruction<'static> {
    match size {
        1 => Instruction::I32Store8(memarg(offset, 0)),
        2 => Instruction::I32Store16(memarg(offset, 1)),
        _ => Instruction::I32Store(memarg(offset, 2)),
    }
}

/// Little-endian bytes of a constant, masked to its declared width and
/// padded to the entry size.
fn const_bytes(cv: &hdlsim_ir::ConstVal, dtype: &DataType, size: u32) -> Vec<u8> {
    let width = dtype.width();
    let mut big = cv.value_big();
    if width < 64 || width % 8 != 0 {
        let mask = (num_bigint::BigUint::from(1u8) << width) - 1u8;
        big &= mask;
    }
    let mut bytes = big.to_bytes_le();
    bytes.resize(size as usize, 0);
    bytes
}

/// Finalize a scratch function: rebuild with the locals collected during
/// codegen.  `Function::new(vec![])` declares zero locals, so its raw body
/// starts with a single LEB128 zero byte we strip before prepending the
/// real declarations.
fn finalize_function(scratch: Function, ctx: &FuncContext) -> Function {
    let raw = scratch.into_raw_body();
    let instr_bytes = &raw[1..];
    let mut f = Function::new(ctx.locals.clone());
    f.raw(instr_bytes.iter().copied());
    f
}

// ══════════════════════════════════════════════════════════════════════════════
// FuncContext — per-function codegen state
// ══════════════════════════════════════════════════════════════════════════════

/// A block-local declaration that became a WASM local.
#[derive(Debug, Clone)]
pub struct NamedLocal {
    pub index: u32,
    pub dtype: DataType,
}

/// Where a referenced variable lives.
pub enum VarLoc {
    Local(NamedLocal),
    Global(LayoutEntry),
}

impl VarLoc {
    pub fn dtype(&self) -> &DataType {
        match self {
            VarLoc::Local(l) => &l.dtype,
            VarLoc::Global(e) => &e.dtype,
        }
    }
}

/// State maintained while generating code for a single function body.
pub struct FuncContext<'a> {
    layout: &'a mut StateLayout,
    function_table: &'a HashMap<String, u32>,
    pub config: &'a SimConfig,
    /// Additional locals declared during codegen: (count, type).
    pub locals: Vec<(u32, ValType)>,
    next_local: u32,
    named: HashMap<String, NamedLocal>,
    /// Changed-flag local of `_change_request`, allocated on first use.
    changed: Option<u32>,
    pub returns_i32: bool,
}

impl<'a> FuncContext<'a> {
    fn new(
        layout: &'a mut StateLayout,
        function_table: &'a HashMap<String, u32>,
        config: &'a SimConfig,
        param_count: u32,
        returns_i32: bool,
    ) -> Self {
        Self {
            layout,
            function_table,
            config,
            locals: Vec::new(),
            next_local: param_count,
            named: HashMap::new(),
            changed: None,
            returns_i32,
        }
    }

    /// Local index of the data pointer parameter.
    pub fn dp(&self) -> u32 {
        0
    }

    /// Allocate a new local of the given type.  Returns the local index.
    pub fn alloc_local(&mut self, ty: ValType) -> u32 {
        let idx = self.next_local;
        self.next_local += 1;
        self.locals.push((1, ty));
        idx
    }

    /// The changed-flag local (WASM locals are zero-initialized).
    pub fn changed_local(&mut self) -> CodegenResult<u32> {
        if let Some(idx) = self.changed {
            return Ok(idx);
        }
        let idx = self.alloc_local(ValType::I32);
        self.changed = Some(idx);
        Ok(idx)
    }

    /// Declare a block-local variable: small ones become WASM locals,
    /// reference-sized ones are promoted into the state region.
    pub fn declare(&mut self, name: &str, dtype: DataType) -> CodegenResult<()> {
        match dtype.native() {
            NativeType::I32 => {
                let index = self.alloc_local(ValType::I32);
                self.named.insert(name.to_string(), NamedLocal { index, dtype });
            }
            NativeType::I64 => {
                let index = self.alloc_local(ValType::I64);
                self.named.insert(name.to_string(), NamedLocal { index, dtype });
            }
            NativeType::Ref => {
                // Re-declaration across blocks shares the promoted entry.
                if self.layout.lookup(name).is_none() {
                    self.layout.promote(name, dtype)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a variable name: function locals shadow globals.
    pub fn resolve_var(&self, name: &str) -> CodegenResult<VarLoc> {
        if let Some(local) = self.named.get(name) {
            return Ok(VarLoc::Local(local.clone()));
        }
        self.layout
            .lookup(name)
            .map(|e| VarLoc::Global(e.clone()))
            .ok_or_else(|| CodegenError::Internal(format!("unresolved variable: {name}")))
    }

    /// Resolve an expression that must be a reference to a laid-out global.
    pub fn global_entry(&self, e: &Expr) -> CodegenResult<LayoutEntry> {
        let name = match &e.kind {
            ExprKind::VarRef { name } => name,
            _ => {
                return Err(CodegenError::Internal(
                    "expected a variable reference".into(),
                ))
            }
        };
        self.layout
            .lookup(name)
            .cloned()
            .ok_or_else(|| CodegenError::Internal(format!("unresolved variable: {name}")))
    }

    /// Record that `_ctor_var_reset` zeroes this entry.
    pub fn mark_reset(&mut self, name: &str) {
        if let Some(entry) = self.layout.lookup_mut(name) {
            entry.reset_flag = true;
        }
    }

    /// Intern a NUL-terminated string into the state region.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        self.layout.intern_string(s)
    }

    /// Intern an inline wide constant into the constant region.
    pub fn intern_const(
        &mut self,
        dtype: DataType,
        cv: &hdlsim_ir::ConstVal,
    ) -> CodegenResult<u32> {
        self.layout.intern_const(dtype, cv)
    }

    /// Absolute index of a previously registered function.
    pub fn function_index(&self, name: &str) -> CodegenResult<u32> {
        self.function_table
            .get(name)
            .copied()
            .ok_or_else(|| CodegenError::UnknownOperator(name.to_string()))
    }
}
