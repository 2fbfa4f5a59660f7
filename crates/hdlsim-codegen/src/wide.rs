//! Wide-integer code generation (width > 64).
//!
//! Wide values live in memory as arrays of little-endian `u32` chunks and
//! never appear in locals or on the WASM value stack — only their addresses
//! do.  Every wide operation lowers to a sequence of `i32` loads/stores over
//! the chunk array.  WASM has no add-with-carry, so add/sub recompute both
//! overflow conditions at each chunk.
//!
//! Unsupported here: wide `mul`/`div`/`moddiv` (and signed forms) fail with
//! a clear error instead of producing wrong bits.

use hdlsim_ir::{BinaryOp, DataType, Expr, ExprKind, NativeType, TriOp, UnaryOp};
use wasm_encoder::{BlockType, Function, Instruction, ValType};

use crate::compiler::FuncContext;
use crate::error::{CodegenError, CodegenResult};
use crate::expr::{dtype_of, emit_rvalue_as, fold_const, Stack};
use crate::types::memarg;

/// Where a wide operand lives.  `Static` is a fixed offset from the data
/// pointer; `Dyn` is an absolute address already computed into a local
/// (dynamic array-element selection).
#[derive(Clone, Copy)]
enum WideLoc {
    Static(u32),
    Dyn(u32),
}

impl WideLoc {
    /// Push the base address operand for a chunk access.
    fn push_base(self, ctx: &FuncContext, f: &mut Function) {
        match self {
            WideLoc::Static(_) => f.instruction(&Instruction::LocalGet(ctx.dp())),
            WideLoc::Dyn(local) => f.instruction(&Instruction::LocalGet(local)),
        };
    }

    fn chunk_offset(self, i: u32) -> u64 {
        match self {
            WideLoc::Static(ofs) => (ofs + 4 * i) as u64,
            WideLoc::Dyn(_) => (4 * i) as u64,
        }
    }

    /// Load chunk `i` onto the stack.
    fn load_chunk(self, i: u32, ctx: &FuncContext, f: &mut Function) {
        self.push_base(ctx, f);
        f.instruction(&Instruction::I32Load(memarg(self.chunk_offset(i), 2)));
    }

    /// Store instruction for chunk `i` (address and value already pushed).
    fn store_chunk(self, i: u32, f: &mut Function) {
        f.instruction(&Instruction::I32Store(memarg(self.chunk_offset(i), 2)));
    }

    /// Push the address of a runtime-indexed chunk: `base + (idx << 2)`.
    fn push_dyn_addr(self, idx_local: u32, ctx: &FuncContext, f: &mut Function) {
        self.push_base(ctx, f);
        f.instruction(&Instruction::LocalGet(idx_local));
        f.instruction(&Instruction::I32Const(2));
        f.instruction(&Instruction::I32Shl);
        f.instruction(&Instruction::I32Add);
    }

    /// Load the chunk at a runtime index.
    fn load_chunk_dyn(self, idx_local: u32, ctx: &FuncContext, f: &mut Function) {
        self.push_dyn_addr(idx_local, ctx, f);
        f.instruction(&Instruction::I32Load(memarg(self.static_offset(), 2)));
    }

    fn static_offset(self) -> u64 {
        match self {
            WideLoc::Static(ofs) => ofs as u64,
            WideLoc::Dyn(_) => 0,
        }
    }
}

/// Resolve a wide operand to an address.  Only variable references and
/// array-element selections are addressable; anything else must have been
/// assigned to a variable by the frontend.
fn resolve_wide(e: &Expr, ctx: &mut FuncContext, f: &mut Function) -> CodegenResult<(WideLoc, DataType)> {
    match &e.kind {
        ExprKind::VarRef { .. } => {
            let entry = ctx.global_entry(e)?;
            Ok((WideLoc::Static(entry.offset), entry.dtype.clone()))
        }
        ExprKind::Binop {
            binop: BinaryOp::ArraySel,
            left: arr,
            right: index,
        } => {
            let entry = ctx.global_entry(arr)?;
            let eldt = match &entry.dtype {
                DataType::Array { subtype, .. } => (**subtype).clone(),
                _ => {
                    return Err(CodegenError::UnsupportedDataType(format!(
                        "arraysel on non-array {}",
                        entry.name
                    )))
                }
            };
            let elsize = eldt.size_bytes();
            match fold_const(index) {
                Some(i) => Ok((WideLoc::Static(entry.offset + i as u32 * elsize), eldt)),
                None => {
                    let addr = ctx.alloc_local(ValType::I32);
                    f.instruction(&Instruction::LocalGet(ctx.dp()));
                    emit_rvalue_as(index, ctx, f, Stack::I32)?;
                    f.instruction(&Instruction::I32Const(elsize as i32));
                    f.instruction(&Instruction::I32Mul);
                    f.instruction(&Instruction::I32Add);
                    f.instruction(&Instruction::I32Const(entry.offset as i32));
                    f.instruction(&Instruction::I32Add);
                    f.instruction(&Instruction::LocalSet(addr));
                    Ok((WideLoc::Dyn(addr), eldt))
                }
            }
        }
        // An inline wide constant gets a slot in the constant region so it
        // can be addressed like any other wide operand.
        ExprKind::Const { value } => {
            let dt = e.dtype.clone().ok_or_else(|| {
                CodegenError::Internal("wide constant without a type".into())
            })?;
            let offset = ctx.intern_const(dt.clone(), value)?;
            Ok((WideLoc::Static(offset), dt))
        }
        _ => Err(CodegenError::UnsupportedDataType(
            "wide operand is not addressable; expected a variable or array element".into(),
        )),
    }
}

/// Wide binop operands must agree with the destination's chunk count; the
/// frontend inserts casts, so a mismatch is a malformed tree, not data.
fn ensure_chunks(dt: &DataType, n: u32) -> CodegenResult<()> {
    if dt.chunks() < n {
        return Err(CodegenError::UnsupportedDataType(format!(
            "wide operand of width {} under a {}-chunk operation",
            dt.width(),
            n
        )));
    }
    Ok(())
}

/// Chunk `i` of a big constant, masked to `dtype`'s width.
fn const_chunk(value: &hdlsim_ir::ConstVal, dtype: &DataType, i: u32) -> u32 {
    let big = value.value_big();
    let mut chunk = big.iter_u32_digits().nth(i as usize).unwrap_or(0);
    if i == dtype.chunks() - 1 {
        chunk &= dtype.last_chunk_mask();
    }
    chunk
}

// ══════════════════════════════════════════════════════════════════════════════
// Assignment
// ══════════════════════════════════════════════════════════════════════════════

/// Store `value` into the wide destination `dest`.
pub fn emit_wide_assign(
    dest: &Expr,
    value: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let (dloc, ddt) = resolve_wide(dest, ctx, f)?;
    let n = ddt.chunks();
    let vdt = dtype_of(value, ctx)?;

    // A scalar right-hand side (e.g. a 1-bit comparison result) fills the
    // low chunks; the rest are cleared.
    if vdt.native() != NativeType::Ref {
        let v64 = ctx.alloc_local(ValType::I64);
        emit_rvalue_as(value, ctx, f, Stack::I64)?;
        f.instruction(&Instruction::LocalSet(v64));
        for i in 0..n {
            dloc.push_base(ctx, f);
            match i {
                0 => {
                    f.instruction(&Instruction::LocalGet(v64));
                    f.instruction(&Instruction::I32WrapI64);
                }
                1 => {
                    f.instruction(&Instruction::LocalGet(v64));
                    f.instruction(&Instruction::I64Const(32));
                    f.instruction(&Instruction::I64ShrU);
                    f.instruction(&Instruction::I32WrapI64);
                }
                _ => {
                    f.instruction(&Instruction::I32Const(0));
                }
            }
            dloc.store_chunk(i, f);
        }
        return Ok(());
    }

    match &value.kind {
        ExprKind::Const { value: cv } => {
            for i in 0..n {
                dloc.push_base(ctx, f);
                f.instruction(&Instruction::I32Const(const_chunk(cv, &ddt, i) as i32));
                dloc.store_chunk(i, f);
            }
            Ok(())
        }

        ExprKind::VarRef { .. }
        | ExprKind::Binop {
            binop: BinaryOp::ArraySel,
            ..
        } => {
            let (sloc, sdt) = resolve_wide(value, ctx, f)?;
            emit_chunk_copy(dloc, sloc, &ddt, &sdt, ctx, f);
            Ok(())
        }

        ExprKind::Unop { unop, arg } => emit_wide_unop(dloc, &ddt, *unop, arg, ctx, f),

        ExprKind::Binop { binop, left, right } => {
            emit_wide_binop(dloc, &ddt, *binop, left, right, ctx, f)
        }

        ExprKind::Triop {
            triop: TriOp::Cond,
            cond,
            left,
            right,
        } => {
            emit_rvalue_as(cond, ctx, f, Stack::I32)?;
            f.instruction(&Instruction::If(BlockType::Empty));
            emit_wide_assign(dest, left, ctx, f)?;
            f.instruction(&Instruction::Else);
            emit_wide_assign(dest, right, ctx, f)?;
            f.instruction(&Instruction::End);
            Ok(())
        }

        _ => Err(CodegenError::UnsupportedDataType(
            "wide assignment right-hand side".into(),
        )),
    }
}

/// Chunk-by-chunk copy, zero-filling when the source is narrower and masking
/// the top chunk when it is wider.
fn emit_chunk_copy(
    dloc: WideLoc,
    sloc: WideLoc,
    ddt: &DataType,
    sdt: &DataType,
    ctx: &FuncContext,
    f: &mut Function,
) {
    let n = ddt.chunks();
    let sn = sdt.chunks();
    for i in 0..n {
        dloc.push_base(ctx, f);
        if i < sn {
            sloc.load_chunk(i, ctx, f);
        } else {
            f.instruction(&Instruction::I32Const(0));
        }
        if i == n - 1 && sdt.width() > ddt.width() {
            f.instruction(&Instruction::I32Const(ddt.last_chunk_mask() as i32));
            f.instruction(&Instruction::I32And);
        }
        dloc.store_chunk(i, f);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Unary
// ══════════════════════════════════════════════════════════════════════════════

fn emit_wide_unop(
    dloc: WideLoc,
    ddt: &DataType,
    op: UnaryOp,
    arg: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let n = ddt.chunks();
    let mask = ddt.last_chunk_mask();
    match op {
        UnaryOp::Not => {
            let (sloc, _) = resolve_wide(arg, ctx, f)?;
            for i in 0..n {
                dloc.push_base(ctx, f);
                sloc.load_chunk(i, ctx, f);
                f.instruction(&Instruction::I32Const(-1));
                f.instruction(&Instruction::I32Xor);
                if i == n - 1 && mask != u32::MAX {
                    f.instruction(&Instruction::I32Const(mask as i32));
                    f.instruction(&Instruction::I32And);
                }
                dloc.store_chunk(i, f);
            }
            Ok(())
        }

        // negate = not + 1, with the carry rippling through the chunks.
        UnaryOp::Negate => {
            let (sloc, _) = resolve_wide(arg, ctx, f)?;
            let s = ctx.alloc_local(ValType::I32);
            let carry = ctx.alloc_local(ValType::I32);
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::LocalSet(carry));
            for i in 0..n {
                dloc.push_base(ctx, f);
                sloc.load_chunk(i, ctx, f);
                f.instruction(&Instruction::I32Const(-1));
                f.instruction(&Instruction::I32Xor);
                f.instruction(&Instruction::LocalGet(carry));
                f.instruction(&Instruction::I32Add);
                f.instruction(&Instruction::LocalTee(s));
                if i == n - 1 && mask != u32::MAX {
                    f.instruction(&Instruction::I32Const(mask as i32));
                    f.instruction(&Instruction::I32And);
                }
                dloc.store_chunk(i, f);
                if i < n - 1 {
                    // carry out iff the sum wrapped to zero.
                    f.instruction(&Instruction::LocalGet(s));
                    f.instruction(&Instruction::I32Eqz);
                    f.instruction(&Instruction::LocalGet(carry));
                    f.instruction(&Instruction::I32And);
                    f.instruction(&Instruction::LocalSet(carry));
                }
            }
            Ok(())
        }

        UnaryOp::CCast => {
            let (sloc, sdt) = resolve_wide(arg, ctx, f)?;
            if sdt.width() != ddt.width() {
                return Err(CodegenError::UnsupportedDataType(format!(
                    "ccast between widths {} and {}",
                    sdt.width(),
                    ddt.width()
                )));
            }
            emit_chunk_copy(dloc, sloc, ddt, &sdt, ctx, f);
            Ok(())
        }

        _ => Err(CodegenError::UnsupportedDataType(format!(
            "wide {op}"
        ))),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Binary
// ══════════════════════════════════════════════════════════════════════════════

fn emit_wide_binop(
    dloc: WideLoc,
    ddt: &DataType,
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    match op {
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
            let n = ddt.chunks();
            let (lloc, ldt) = resolve_wide(left, ctx, f)?;
            let (rloc, rdt) = resolve_wide(right, ctx, f)?;
            ensure_chunks(&ldt, n)?;
            ensure_chunks(&rdt, n)?;
            let mask = ddt.last_chunk_mask();
            for i in 0..n {
                dloc.push_base(ctx, f);
                lloc.load_chunk(i, ctx, f);
                rloc.load_chunk(i, ctx, f);
                f.instruction(&match op {
                    BinaryOp::And => Instruction::I32And,
                    BinaryOp::Or => Instruction::I32Or,
                    _ => Instruction::I32Xor,
                });
                if i == n - 1 && mask != u32::MAX {
                    f.instruction(&Instruction::I32Const(mask as i32));
                    f.instruction(&Instruction::I32And);
                }
                dloc.store_chunk(i, f);
            }
            Ok(())
        }

        BinaryOp::Add => emit_wide_add(dloc, ddt, left, right, ctx, f),
        BinaryOp::Sub => emit_wide_sub(dloc, ddt, left, right, ctx, f),

        BinaryOp::Shl => emit_wide_shift(dloc, ddt, left, right, Shift::Left, ctx, f),
        BinaryOp::ShrU => emit_wide_shift(dloc, ddt, left, right, Shift::RightU, ctx, f),
        BinaryOp::ShrS => emit_wide_shift(dloc, ddt, left, right, Shift::RightS, ctx, f),

        BinaryOp::Mul
        | BinaryOp::MulS
        | BinaryOp::Div
        | BinaryOp::DivS
        | BinaryOp::ModDiv
        | BinaryOp::ModDivS => Err(CodegenError::UnsupportedDataType(format!(
            "wide {} (width {})",
            op.name(),
            ddt.width()
        ))),

        _ => Err(CodegenError::UnknownOperator(op.name().to_string())),
    }
}

/// Wide add with carry recomputed at each chunk:
///
/// ```text
/// sum  = l + r           ; overflow1 = sum <u l
/// sum2 = sum + carry     ; overflow2 = sum2 == 0 && carry
/// dst[i] = sum2
/// carry  = overflow1 | overflow2
/// ```
fn emit_wide_add(
    dloc: WideLoc,
    ddt: &DataType,
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let n = ddt.chunks();
    let mask = ddt.last_chunk_mask();
    let (lloc, ldt) = resolve_wide(left, ctx, f)?;
    let (rloc, rdt) = resolve_wide(right, ctx, f)?;
    ensure_chunks(&ldt, n)?;
    ensure_chunks(&rdt, n)?;

    let a = ctx.alloc_local(ValType::I32);
    let s = ctx.alloc_local(ValType::I32);
    let s2 = ctx.alloc_local(ValType::I32);
    let carry = ctx.alloc_local(ValType::I32);
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalSet(carry));

    for i in 0..n {
        dloc.push_base(ctx, f);
        lloc.load_chunk(i, ctx, f);
        f.instruction(&Instruction::LocalTee(a));
        rloc.load_chunk(i, ctx, f);
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalTee(s));
        f.instruction(&Instruction::LocalGet(carry));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalTee(s2));
        if i == n - 1 && mask != u32::MAX {
            f.instruction(&Instruction::I32Const(mask as i32));
            f.instruction(&Instruction::I32And);
        }
        dloc.store_chunk(i, f);
        if i < n - 1 {
            f.instruction(&Instruction::LocalGet(s));
            f.instruction(&Instruction::LocalGet(a));
            f.instruction(&Instruction::I32LtU);
            f.instruction(&Instruction::LocalGet(s2));
            f.instruction(&Instruction::I32Eqz);
            f.instruction(&Instruction::LocalGet(carry));
            f.instruction(&Instruction::I32And);
            f.instruction(&Instruction::I32Or);
            f.instruction(&Instruction::LocalSet(carry));
        }
    }
    Ok(())
}

/// Mirror of [`emit_wide_add`] with a borrow:
///
/// ```text
/// borrow1 = l <u r
/// diff    = l - r - borrow
/// borrow2 = l - r == 0 && borrow
/// ```
fn emit_wide_sub(
    dloc: WideLoc,
    ddt: &DataType,
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let n = ddt.chunks();
    let mask = ddt.last_chunk_mask();
    let (lloc, ldt) = resolve_wide(left, ctx, f)?;
    let (rloc, rdt) = resolve_wide(right, ctx, f)?;
    ensure_chunks(&ldt, n)?;
    ensure_chunks(&rdt, n)?;

    let a = ctx.alloc_local(ValType::I32);
    let b = ctx.alloc_local(ValType::I32);
    let s = ctx.alloc_local(ValType::I32);
    let borrow = ctx.alloc_local(ValType::I32);
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalSet(borrow));

    for i in 0..n {
        dloc.push_base(ctx, f);
        lloc.load_chunk(i, ctx, f);
        f.instruction(&Instruction::LocalSet(a));
        rloc.load_chunk(i, ctx, f);
        f.instruction(&Instruction::LocalSet(b));
        f.instruction(&Instruction::LocalGet(a));
        f.instruction(&Instruction::LocalGet(b));
        f.instruction(&Instruction::I32Sub);
        f.instruction(&Instruction::LocalTee(s));
        f.instruction(&Instruction::LocalGet(borrow));
        f.instruction(&Instruction::I32Sub);
        if i == n - 1 && mask != u32::MAX {
            f.instruction(&Instruction::I32Const(mask as i32));
            f.instruction(&Instruction::I32And);
        }
        dloc.store_chunk(i, f);
        if i < n - 1 {
            f.instruction(&Instruction::LocalGet(a));
            f.instruction(&Instruction::LocalGet(b));
            f.instruction(&Instruction::I32LtU);
            f.instruction(&Instruction::LocalGet(s));
            f.instruction(&Instruction::I32Eqz);
            f.instruction(&Instruction::LocalGet(borrow));
            f.instruction(&Instruction::I32And);
            f.instruction(&Instruction::I32Or);
            f.instruction(&Instruction::LocalSet(borrow));
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Shifts
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, PartialEq)]
enum Shift {
    Left,
    RightU,
    RightS,
}

fn emit_wide_shift(
    dloc: WideLoc,
    ddt: &DataType,
    value: &Expr,
    amount: &Expr,
    kind: Shift,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let (sloc, sdt) = resolve_wide(value, ctx, f)?;
    ensure_chunks(&sdt, ddt.chunks())?;
    match fold_const(amount) {
        Some(s) => emit_shift_imm(dloc, sloc, ddt, s as u32, kind, ctx, f),
        None => emit_shift_var(dloc, sloc, ddt, amount, kind, ctx, f),
    }
}

/// Immediate shift, fully unrolled.  Left shifts process MSB→LSB and right
/// shifts LSB→MSB so destination/source aliasing is safe.
fn emit_shift_imm(
    dloc: WideLoc,
    sloc: WideLoc,
    ddt: &DataType,
    s: u32,
    kind: Shift,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let n = ddt.chunks();
    let mask = ddt.last_chunk_mask();
    let cs = (s / 32) as i64;
    let bs = s % 32;

    let sign = if kind == Shift::RightS {
        let l = ctx.alloc_local(ValType::I32);
        sloc.load_chunk(n - 1, ctx, f);
        f.instruction(&Instruction::I32Const(31));
        f.instruction(&Instruction::I32ShrS);
        f.instruction(&Instruction::LocalSet(l));
        Some(l)
    } else {
        None
    };

    let order: Vec<u32> = if kind == Shift::Left {
        (0..n).rev().collect()
    } else {
        (0..n).collect()
    };

    for i in order {
        dloc.push_base(ctx, f);
        let srcidx = match kind {
            Shift::Left => i as i64 - cs,
            _ => i as i64 + cs,
        };
        let in_range = srcidx >= 0 && srcidx < n as i64;
        if !in_range {
            match sign {
                Some(l) => {
                    f.instruction(&Instruction::LocalGet(l));
                }
                None => {
                    f.instruction(&Instruction::I32Const(0));
                }
            }
        } else if bs == 0 {
            sloc.load_chunk(srcidx as u32, ctx, f);
        } else {
            let srcidx = srcidx as u32;
            sloc.load_chunk(srcidx, ctx, f);
            f.instruction(&Instruction::I32Const(bs as i32));
            f.instruction(&match kind {
                Shift::Left => Instruction::I32Shl,
                _ => Instruction::I32ShrU,
            });
            // The neighbouring chunk supplies the bits crossing the boundary.
            let neighbour_pushed = match kind {
                Shift::Left => {
                    if srcidx > 0 {
                        sloc.load_chunk(srcidx - 1, ctx, f);
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    if srcidx + 1 < n {
                        sloc.load_chunk(srcidx + 1, ctx, f);
                        true
                    } else if let Some(l) = sign {
                        f.instruction(&Instruction::LocalGet(l));
                        true
                    } else {
                        false
                    }
                }
            };
            if neighbour_pushed {
                f.instruction(&Instruction::I32Const((32 - bs) as i32));
                f.instruction(&match kind {
                    Shift::Left => Instruction::I32ShrU,
                    _ => Instruction::I32Shl,
                });
                f.instruction(&Instruction::I32Or);
            }
        }
        if i == n - 1 && mask != u32::MAX {
            f.instruction(&Instruction::I32Const(mask as i32));
            f.instruction(&Instruction::I32And);
        }
        dloc.store_chunk(i, f);
    }
    Ok(())
}

/// Shift by a runtime amount.  The chunk loop becomes a WASM `loop` with
/// dynamically computed chunk addresses.  The bit-shift-by-zero case is
/// special-cased with `select`: the companion `32 - bs` shift would
/// otherwise execute with an amount of 32, which the i32 op reduces mod 32.
fn emit_shift_var(
    dloc: WideLoc,
    sloc: WideLoc,
    ddt: &DataType,
    amount: &Expr,
    kind: Shift,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let n = ddt.chunks();
    let mask = ddt.last_chunk_mask();

    let cs = ctx.alloc_local(ValType::I32);
    let bs = ctx.alloc_local(ValType::I32);
    let i = ctx.alloc_local(ValType::I32);
    let srcidx = ctx.alloc_local(ValType::I32);
    let val = ctx.alloc_local(ValType::I32);
    let nb = ctx.alloc_local(ValType::I32);

    emit_rvalue_as(amount, ctx, f, Stack::I32)?;
    f.instruction(&Instruction::LocalTee(cs));
    f.instruction(&Instruction::I32Const(31));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::LocalSet(bs));
    f.instruction(&Instruction::LocalGet(cs));
    f.instruction(&Instruction::I32Const(5));
    f.instruction(&Instruction::I32ShrU);
    f.instruction(&Instruction::LocalSet(cs));

    let sign = if kind == Shift::RightS {
        let l = ctx.alloc_local(ValType::I32);
        sloc.load_chunk(n - 1, ctx, f);
        f.instruction(&Instruction::I32Const(31));
        f.instruction(&Instruction::I32ShrS);
        f.instruction(&Instruction::LocalSet(l));
        Some(l)
    } else {
        None
    };

    // Left shifts run i = N-1 → 0, right shifts i = 0 → N-1.
    f.instruction(&Instruction::I32Const(match kind {
        Shift::Left => n as i32 - 1,
        _ => 0,
    }));
    f.instruction(&Instruction::LocalSet(i));

    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Loop(BlockType::Empty));

    // srcidx = i ∓ cs
    f.instruction(&Instruction::LocalGet(i));
    f.instruction(&Instruction::LocalGet(cs));
    f.instruction(&match kind {
        Shift::Left => Instruction::I32Sub,
        _ => Instruction::I32Add,
    });
    f.instruction(&Instruction::LocalSet(srcidx));

    // Out-of-range source chunks read as zero (or the sign fill).
    match kind {
        Shift::Left => {
            f.instruction(&Instruction::LocalGet(srcidx));
            f.instruction(&Instruction::I32Const(0));
            f.instruction(&Instruction::I32LtS);
        }
        _ => {
            f.instruction(&Instruction::LocalGet(srcidx));
            f.instruction(&Instruction::I32Const(n as i32 - 1));
            f.instruction(&Instruction::I32GtS);
        }
    }
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    match sign {
        Some(l) => {
            f.instruction(&Instruction::LocalGet(l));
        }
        None => {
            f.instruction(&Instruction::I32Const(0));
        }
    }
    f.instruction(&Instruction::Else);
    {
        // Low part: src[srcidx] shifted by bs.
        sloc.load_chunk_dyn(srcidx, ctx, f);
        f.instruction(&Instruction::LocalGet(bs));
        f.instruction(&match kind {
            Shift::Left => Instruction::I32Shl,
            _ => Instruction::I32ShrU,
        });

        // Neighbour chunk: srcidx-1 for left, srcidx+1 (or sign) for right.
        match kind {
            Shift::Left => {
                f.instruction(&Instruction::LocalGet(srcidx));
                f.instruction(&Instruction::I32Const(0));
                f.instruction(&Instruction::I32GtS);
                f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
                f.instruction(&Instruction::LocalGet(srcidx));
                f.instruction(&Instruction::I32Const(1));
                f.instruction(&Instruction::I32Sub);
                f.instruction(&Instruction::LocalSet(nb));
                sloc.load_chunk_dyn(nb, ctx, f);
                f.instruction(&Instruction::Else);
                f.instruction(&Instruction::I32Const(0));
                f.instruction(&Instruction::End);
            }
            _ => {
                f.instruction(&Instruction::LocalGet(srcidx));
                f.instruction(&Instruction::I32Const(n as i32 - 1));
                f.instruction(&Instruction::I32LtS);
                f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
                f.instruction(&Instruction::LocalGet(srcidx));
                f.instruction(&Instruction::I32Const(1));
                f.instruction(&Instruction::I32Add);
                f.instruction(&Instruction::LocalSet(nb));
                sloc.load_chunk_dyn(nb, ctx, f);
                f.instruction(&Instruction::Else);
                match sign {
                    Some(l) => {
                        f.instruction(&Instruction::LocalGet(l));
                    }
                    None => {
                        f.instruction(&Instruction::I32Const(0));
                    }
                }
                f.instruction(&Instruction::End);
            }
        }
        f.instruction(&Instruction::I32Const(32));
        f.instruction(&Instruction::LocalGet(bs));
        f.instruction(&Instruction::I32Sub);
        f.instruction(&match kind {
            Shift::Left => Instruction::I32ShrU,
            _ => Instruction::I32Shl,
        });
        // bs == 0 would make the companion shift amount 32; force zero.
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::LocalGet(bs));
        f.instruction(&Instruction::I32Eqz);
        f.instruction(&Instruction::Select);
        f.instruction(&Instruction::I32Or);
    }
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalSet(val));

    // dst[i] = val, masked on the top chunk.
    dloc.push_dyn_addr(i, ctx, f);
    f.instruction(&Instruction::LocalGet(val));
    if mask != u32::MAX {
        f.instruction(&Instruction::I32Const(mask as i32));
        f.instruction(&Instruction::I32Const(-1));
        f.instruction(&Instruction::LocalGet(i));
        f.instruction(&Instruction::I32Const(n as i32 - 1));
        f.instruction(&Instruction::I32Eq);
        f.instruction(&Instruction::Select);
        f.instruction(&Instruction::I32And);
    }
    f.instruction(&Instruction::I32Store(memarg(dloc.static_offset(), 2)));

    // Advance and loop.
    match kind {
        Shift::Left => {
            f.instruction(&Instruction::LocalGet(i));
            f.instruction(&Instruction::I32Eqz);
            f.instruction(&Instruction::BrIf(1));
            f.instruction(&Instruction::LocalGet(i));
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::I32Sub);
            f.instruction(&Instruction::LocalSet(i));
        }
        _ => {
            f.instruction(&Instruction::LocalGet(i));
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::LocalTee(i));
            f.instruction(&Instruction::I32Const(n as i32));
            f.instruction(&Instruction::I32GeU);
            f.instruction(&Instruction::BrIf(1));
        }
    }
    f.instruction(&Instruction::Br(0));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Comparisons
// ══════════════════════════════════════════════════════════════════════════════

/// Wide comparison producing a single i32 on the stack.
///
/// `eq`/`neq` reduce per-chunk equality; the orderings build a nested
/// `select` chain from the LSB up so the MSB decides last.  `lte`/`gte`
/// derive as `!gt`/`!lt`.
pub fn emit_wide_compare(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let (lloc, ldt) = resolve_wide(left, ctx, f)?;
    let (rloc, rdt) = resolve_wide(right, ctx, f)?;
    let n = ldt.chunks();
    ensure_chunks(&rdt, n)?;

    match op {
        BinaryOp::Eq | BinaryOp::Neq => {
            f.instruction(&Instruction::I32Const((op == BinaryOp::Eq) as i32));
            for i in 0..n {
                lloc.load_chunk(i, ctx, f);
                rloc.load_chunk(i, ctx, f);
                if op == BinaryOp::Eq {
                    f.instruction(&Instruction::I32Eq);
                    f.instruction(&Instruction::I32And);
                } else {
                    f.instruction(&Instruction::I32Ne);
                    f.instruction(&Instruction::I32Or);
                }
            }
            Ok(())
        }

        BinaryOp::Lt
        | BinaryOp::LtS
        | BinaryOp::Gt
        | BinaryOp::GtS
        | BinaryOp::Lte
        | BinaryOp::LteS
        | BinaryOp::Gte
        | BinaryOp::GteS => {
            let signed = matches!(
                op,
                BinaryOp::LtS | BinaryOp::GtS | BinaryOp::LteS | BinaryOp::GteS
            );
            // lte/gte negate the strict opposite ordering.
            let (favour_lt, negate) = match op {
                BinaryOp::Lt | BinaryOp::LtS => (true, false),
                BinaryOp::Gt | BinaryOp::GtS => (false, false),
                BinaryOp::Lte | BinaryOp::LteS => (false, true),
                _ => (true, true),
            };

            let res = ctx.alloc_local(ValType::I32);
            let tmp = ctx.alloc_local(ValType::I32);
            f.instruction(&Instruction::I32Const(0));
            f.instruction(&Instruction::LocalSet(res));

            for i in 0..n {
                let top = i == n - 1;
                let lt_instr = if top && signed {
                    Instruction::I32LtS
                } else {
                    Instruction::I32LtU
                };
                let gt_instr = if top && signed {
                    Instruction::I32GtS
                } else {
                    Instruction::I32GtU
                };
                let (favoured, opposed) = if favour_lt {
                    (lt_instr, gt_instr)
                } else {
                    (gt_instr, lt_instr)
                };

                // res = select(favoured_i, 1, select(opposed_i, 0, res))
                f.instruction(&Instruction::I32Const(0));
                f.instruction(&Instruction::LocalGet(res));
                lloc.load_chunk(i, ctx, f);
                rloc.load_chunk(i, ctx, f);
                f.instruction(&opposed);
                f.instruction(&Instruction::Select);
                f.instruction(&Instruction::LocalSet(tmp));

                f.instruction(&Instruction::I32Const(1));
                f.instruction(&Instruction::LocalGet(tmp));
                lloc.load_chunk(i, ctx, f);
                rloc.load_chunk(i, ctx, f);
                f.instruction(&favoured);
                f.instruction(&Instruction::Select);
                f.instruction(&Instruction::LocalSet(res));
            }

            f.instruction(&Instruction::LocalGet(res));
            if negate {
                f.instruction(&Instruction::I32Eqz);
            }
            Ok(())
        }

        _ => Err(CodegenError::UnknownOperator(op.name().to_string())),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Change detection
// ══════════════════════════════════════════════════════════════════════════════

/// Wide `changedet`: any differing chunk raises the changed flag, then the
/// shadow copy is refreshed.
pub fn emit_wide_changedet(
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let (lloc, ldt) = resolve_wide(left, ctx, f)?;
    let (rloc, rdt) = resolve_wide(right, ctx, f)?;
    let n = ldt.chunks();
    ensure_chunks(&rdt, n)?;

    f.instruction(&Instruction::I32Const(0));
    for i in 0..n {
        lloc.load_chunk(i, ctx, f);
        rloc.load_chunk(i, ctx, f);
        f.instruction(&Instruction::I32Ne);
        f.instruction(&Instruction::I32Or);
    }
    f.instruction(&Instruction::If(BlockType::Empty));
    let changed = ctx.changed_local()?;
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::LocalSet(changed));
    for i in 0..n {
        rloc.push_base(ctx, f);
        lloc.load_chunk(i, ctx, f);
        rloc.store_chunk(i, f);
    }
    f.instruction(&Instruction::End);
    Ok(())
}
