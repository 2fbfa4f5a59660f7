//! Scalar expression translation (operand width ≤ 64).
//!
//! Every value on the WASM operand stack is in *storage form*: zero-extended
//! to its i32/i64 container.  Operators work on the common container and
//! masking to the declared width happens at stores, driven by the
//! destination.  Sign extension is explicit in the IR (`extends`), never
//! implicit.
//!
//! Wide operands (width > 64) never reach the value stack; the assignment and
//! comparison paths route them to [`crate::wide`].

use hdlsim_ir::{BinaryOp, DataType, Expr, ExprKind, NativeType, TriOp, UnaryOp};
use wasm_encoder::{BlockType, Function, Instruction, ValType};

use crate::compiler::{FuncContext, VarLoc};
use crate::error::{CodegenError, CodegenResult};
use crate::types::{memarg, IMPORT_FINISH, IMPORT_RAND, IMPORT_READMEM, IMPORT_STOP, IMPORT_TIME};
use crate::wide;

/// What one scalar expression leaves on the WASM stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    I32,
    I64,
}

impl Stack {
    pub fn of(dtype: &DataType) -> CodegenResult<Stack> {
        match dtype.native() {
            NativeType::I32 => Ok(Stack::I32),
            NativeType::I64 => Ok(Stack::I64),
            NativeType::Ref => Err(CodegenError::UnsupportedDataType(format!(
                "width {} in scalar context",
                dtype.width()
            ))),
        }
    }
}

/// Result type of an expression, from its node or inferred from operands.
pub fn dtype_of(e: &Expr, ctx: &FuncContext) -> CodegenResult<DataType> {
    if let Some(dt) = &e.dtype {
        return Ok(dt.clone());
    }
    match &e.kind {
        ExprKind::VarRef { name } => Ok(ctx.resolve_var(name)?.dtype().clone()),
        ExprKind::Const { .. } => Ok(hdlsim_ir::build::logic(32)),
        ExprKind::Unop { arg, .. } => dtype_of(arg, ctx),
        ExprKind::Binop { binop, left, right } => {
            if binop.is_compare() {
                return Ok(hdlsim_ir::build::logic(1));
            }
            match binop {
                // An element selection has the element's type; `wordsel`
                // always selects a 32-bit chunk.
                BinaryOp::ArraySel => match dtype_of(left, ctx)? {
                    DataType::Array { subtype, .. } => Ok(*subtype),
                    other => Ok(other),
                },
                BinaryOp::WordSel => Ok(hdlsim_ir::build::logic(32)),
                _ => {
                    let lt = dtype_of(left, ctx)?;
                    let rt = dtype_of(right, ctx)?;
                    Ok(if rt.width() > lt.width() { rt } else { lt })
                }
            }
        }
        ExprKind::Triop { left, .. } => dtype_of(left, ctx),
        _ => Err(CodegenError::Internal(
            "expression has no result type".into(),
        )),
    }
}

/// Fold a pure constant scalar expression to its value, masked to `width`
/// when one is known.  This is the whole peephole pass: it exists so shift
/// amounts written as expressions still take the immediate-shift path.
pub fn fold_const(e: &Expr) -> Option<u64> {
    let mask = e
        .dtype
        .as_ref()
        .filter(|dt| dt.width() < 64)
        .map(|dt| (1u64 << dt.width()) - 1);
    let raw = match &e.kind {
        ExprKind::Const { value } => value.bigvalue.is_none().then(|| value.cvalue as u64)?,
        ExprKind::Binop { binop, left, right } => {
            let l = fold_const(left)?;
            let r = fold_const(right)?;
            match binop {
                BinaryOp::Add => l.wrapping_add(r),
                BinaryOp::Sub => l.wrapping_sub(r),
                BinaryOp::Mul => l.wrapping_mul(r),
                BinaryOp::And => l & r,
                BinaryOp::Or => l | r,
                BinaryOp::Xor => l ^ r,
                BinaryOp::Shl => l.checked_shl(r as u32).unwrap_or(0),
                BinaryOp::ShrU => l.checked_shr(r as u32).unwrap_or(0),
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(match mask {
        Some(m) => raw & m,
        None => raw,
    })
}

/// Convert the value on the stack between containers (zero-extending up).
fn convert(from: Stack, to: Stack, f: &mut Function) {
    match (from, to) {
        (Stack::I32, Stack::I64) => {
            f.instruction(&Instruction::I64ExtendI32U);
        }
        (Stack::I64, Stack::I32) => {
            f.instruction(&Instruction::I32WrapI64);
        }
        _ => {}
    }
}

/// Emit an expression, leaving its value on the stack in the container of
/// its own type.
pub fn emit_rvalue(e: &Expr, ctx: &mut FuncContext, f: &mut Function) -> CodegenResult<Stack> {
    match &e.kind {
        ExprKind::Const { value } => {
            let dt = dtype_of(e, ctx)?;
            match Stack::of(&dt)? {
                Stack::I32 => {
                    let mut v = value.value_u64() as u32;
                    if dt.width() < 32 {
                        v &= (1u32 << dt.width()) - 1;
                    }
                    f.instruction(&Instruction::I32Const(v as i32));
                    Ok(Stack::I32)
                }
                Stack::I64 => {
                    let mut v = value.value_u64();
                    if dt.width() < 64 {
                        v &= (1u64 << dt.width()) - 1;
                    }
                    f.instruction(&Instruction::I64Const(v as i64));
                    Ok(Stack::I64)
                }
            }
        }

        ExprKind::VarRef { name } => match ctx.resolve_var(name)? {
            VarLoc::Local(local) => {
                f.instruction(&Instruction::LocalGet(local.index));
                Stack::of(&local.dtype)
            }
            VarLoc::Global(entry) => {
                f.instruction(&Instruction::LocalGet(ctx.dp()));
                let offset = entry.offset as u64;
                match entry.size {
                    1 => {
                        f.instruction(&Instruction::I32Load8U(memarg(offset, 0)));
                        Ok(Stack::I32)
                    }
                    2 => {
                        f.instruction(&Instruction::I32Load16U(memarg(offset, 1)));
                        Ok(Stack::I32)
                    }
                    4 => {
                        f.instruction(&Instruction::I32Load(memarg(offset, 2)));
                        Ok(Stack::I32)
                    }
                    8 => {
                        f.instruction(&Instruction::I64Load(memarg(offset, 3)));
                        Ok(Stack::I64)
                    }
                    _ => Err(CodegenError::UnsupportedDataType(format!(
                        "wide load of {name} in scalar context"
                    ))),
                }
            }
        },

        ExprKind::Unop { unop, arg } => emit_unop(e, *unop, arg, ctx, f),
        ExprKind::Binop { binop, left, right } => emit_binop(e, *binop, left, right, ctx, f),

        ExprKind::Triop {
            triop: TriOp::Cond,
            cond,
            left,
            right,
        } => {
            let dt = dtype_of(e, ctx)?;
            let want = Stack::of(&dt)?;
            emit_rvalue_as(left, ctx, f, want)?;
            emit_rvalue_as(right, ctx, f, want)?;
            emit_rvalue_as(cond, ctx, f, Stack::I32)?;
            f.instruction(&Instruction::Select);
            Ok(want)
        }

        ExprKind::FuncCall { name, .. } if name == "$time" => {
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::Call(IMPORT_TIME));
            Ok(Stack::I64)
        }
        ExprKind::FuncCall { name, .. } if name == "$rand" => {
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::Call(IMPORT_RAND));
            Ok(Stack::I32)
        }

        _ => Err(CodegenError::Internal(format!(
            "expression not legal in value position: {:?}",
            std::mem::discriminant(&e.kind)
        ))),
    }
}

/// Emit an expression and convert it to the wanted container.
pub fn emit_rvalue_as(
    e: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
    want: Stack,
) -> CodegenResult<()> {
    let got = emit_rvalue(e, ctx, f)?;
    convert(got, want, f);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Unary operators
// ══════════════════════════════════════════════════════════════════════════════

fn emit_unop(
    node: &Expr,
    op: UnaryOp,
    arg: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<Stack> {
    match op {
        UnaryOp::Not => {
            let dt = dtype_of(node, ctx)?;
            let s = Stack::of(&dt)?;
            emit_rvalue_as(arg, ctx, f, s)?;
            let w = dt.width();
            match s {
                Stack::I32 => {
                    let mask = if w >= 32 { u32::MAX } else { (1u32 << w) - 1 };
                    f.instruction(&Instruction::I32Const(mask as i32));
                    f.instruction(&Instruction::I32Xor);
                }
                Stack::I64 => {
                    let mask = if w >= 64 { u64::MAX } else { (1u64 << w) - 1 };
                    f.instruction(&Instruction::I64Const(mask as i64));
                    f.instruction(&Instruction::I64Xor);
                }
            }
            Ok(s)
        }

        UnaryOp::Negate => {
            let dt = dtype_of(node, ctx)?;
            let s = Stack::of(&dt)?;
            match s {
                Stack::I32 => f.instruction(&Instruction::I32Const(0)),
                Stack::I64 => f.instruction(&Instruction::I64Const(0)),
            };
            emit_rvalue_as(arg, ctx, f, s)?;
            f.instruction(&match s {
                Stack::I32 => Instruction::I32Sub,
                Stack::I64 => Instruction::I64Sub,
            });
            Ok(s)
        }

        UnaryOp::Extends => {
            let dst = dtype_of(node, ctx)?;
            let s = Stack::of(&dst)?;
            let w = dtype_of(arg, ctx)?.width();
            emit_rvalue_as(arg, ctx, f, s)?;
            match (s, w) {
                (Stack::I32, 8) => {
                    f.instruction(&Instruction::I32Extend8S);
                }
                (Stack::I32, 16) => {
                    f.instruction(&Instruction::I32Extend16S);
                }
                (Stack::I32, 32) => {}
                (Stack::I32, _) => {
                    let sh = 32 - w;
                    f.instruction(&Instruction::I32Const(sh as i32));
                    f.instruction(&Instruction::I32Shl);
                    f.instruction(&Instruction::I32Const(sh as i32));
                    f.instruction(&Instruction::I32ShrS);
                }
                (Stack::I64, 8) => {
                    f.instruction(&Instruction::I64Extend8S);
                }
                (Stack::I64, 16) => {
                    f.instruction(&Instruction::I64Extend16S);
                }
                (Stack::I64, 32) => {
                    f.instruction(&Instruction::I64Extend32S);
                }
                (Stack::I64, 64) => {}
                (Stack::I64, _) => {
                    let sh = 64 - w;
                    f.instruction(&Instruction::I64Const(sh as i64));
                    f.instruction(&Instruction::I64Shl);
                    f.instruction(&Instruction::I64Const(sh as i64));
                    f.instruction(&Instruction::I64ShrS);
                }
            }
            Ok(s)
        }

        UnaryOp::CCast => {
            let dst = dtype_of(node, ctx)?;
            let src = dtype_of(arg, ctx)?;
            if dst.native() == NativeType::Ref || src.native() == NativeType::Ref {
                return Err(CodegenError::UnsupportedDataType(format!(
                    "ccast between widths {} and {}",
                    src.width(),
                    dst.width()
                )));
            }
            let from = Stack::of(&src)?;
            let to = Stack::of(&dst)?;
            emit_rvalue(arg, ctx, f)?;
            match (from, to) {
                (Stack::I32, Stack::I64) => {
                    f.instruction(&if src.is_signed() {
                        Instruction::I64ExtendI32S
                    } else {
                        Instruction::I64ExtendI32U
                    });
                }
                (Stack::I64, Stack::I32) => {
                    f.instruction(&Instruction::I32WrapI64);
                }
                // Same container: storage is already zero-padded, and a
                // narrow-to-wider signed cast is the frontend's `extends`.
                _ => {}
            }
            Ok(to)
        }

        UnaryOp::RedXor => {
            let src = dtype_of(arg, ctx)?;
            let s = Stack::of(&src)?;
            emit_rvalue(arg, ctx, f)?;
            match s {
                Stack::I32 => {
                    f.instruction(&Instruction::I32Popcnt);
                    f.instruction(&Instruction::I32Const(1));
                    f.instruction(&Instruction::I32And);
                }
                Stack::I64 => {
                    f.instruction(&Instruction::I64Popcnt);
                    f.instruction(&Instruction::I64Const(1));
                    f.instruction(&Instruction::I64And);
                }
            }
            let dst = dtype_of(node, ctx)?;
            let want = Stack::of(&dst)?;
            convert(s, want, f);
            Ok(want)
        }

        UnaryOp::CReset | UnaryOp::CReturn => Err(CodegenError::Internal(format!(
            "{op} is not a value expression"
        ))),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Binary operators
// ══════════════════════════════════════════════════════════════════════════════

fn emit_binop(
    node: &Expr,
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<Stack> {
    if op.is_assign() || op == BinaryOp::ChangeDet {
        return Err(CodegenError::Internal(format!(
            "{op} is not a value expression"
        )));
    }

    match op {
        BinaryOp::ArraySel => return emit_arraysel_load(left, right, ctx, f),
        BinaryOp::WordSel => return emit_wordsel_load(left, right, ctx, f),
        _ => {}
    }

    let lt = dtype_of(left, ctx)?;
    let rt = dtype_of(right, ctx)?;

    if op.is_compare() {
        if lt.native() == NativeType::Ref || rt.native() == NativeType::Ref {
            wide::emit_wide_compare(op, left, right, ctx, f)?;
            return Ok(Stack::I32);
        }
        let common = common_container(&lt, &rt)?;
        emit_rvalue_as(left, ctx, f, common)?;
        emit_rvalue_as(right, ctx, f, common)?;
        f.instruction(&compare_instruction(op, common)?);
        return Ok(Stack::I32);
    }

    // Shifts: the amount is a scalar even when folded from an expression.
    if matches!(op, BinaryOp::Shl | BinaryOp::ShrU | BinaryOp::ShrS) {
        let common = Stack::of(&dtype_of(node, ctx)?)?;
        emit_rvalue_as(left, ctx, f, common)?;
        match fold_const(right) {
            Some(amount) => match common {
                Stack::I32 => {
                    f.instruction(&Instruction::I32Const(amount as i32));
                }
                Stack::I64 => {
                    f.instruction(&Instruction::I64Const(amount as i64));
                }
            },
            None => emit_rvalue_as(right, ctx, f, common)?,
        }
        f.instruction(&match (op, common) {
            (BinaryOp::Shl, Stack::I32) => Instruction::I32Shl,
            (BinaryOp::Shl, Stack::I64) => Instruction::I64Shl,
            (BinaryOp::ShrU, Stack::I32) => Instruction::I32ShrU,
            (BinaryOp::ShrU, Stack::I64) => Instruction::I64ShrU,
            (BinaryOp::ShrS, Stack::I32) => Instruction::I32ShrS,
            (_, Stack::I64) => Instruction::I64ShrS,
            _ => unreachable!(),
        });
        return Ok(common);
    }

    let common = common_container(&lt, &rt)?;
    emit_rvalue_as(left, ctx, f, common)?;
    emit_rvalue_as(right, ctx, f, common)?;

    // Generic mul/div/moddiv dispatch signedness by the wider operand.
    let wider_signed = if rt.width() > lt.width() {
        rt.is_signed()
    } else {
        lt.is_signed()
    };

    let instr = match (op, common) {
        (BinaryOp::Add, Stack::I32) => Instruction::I32Add,
        (BinaryOp::Add, Stack::I64) => Instruction::I64Add,
        (BinaryOp::Sub, Stack::I32) => Instruction::I32Sub,
        (BinaryOp::Sub, Stack::I64) => Instruction::I64Sub,
        (BinaryOp::Mul | BinaryOp::MulS, Stack::I32) => Instruction::I32Mul,
        (BinaryOp::Mul | BinaryOp::MulS, Stack::I64) => Instruction::I64Mul,
        (BinaryOp::Div, Stack::I32) if !wider_signed => Instruction::I32DivU,
        (BinaryOp::Div, Stack::I32) => Instruction::I32DivS,
        (BinaryOp::Div, Stack::I64) if !wider_signed => Instruction::I64DivU,
        (BinaryOp::Div, Stack::I64) => Instruction::I64DivS,
        (BinaryOp::DivS, Stack::I32) => Instruction::I32DivS,
        (BinaryOp::DivS, Stack::I64) => Instruction::I64DivS,
        (BinaryOp::ModDiv, Stack::I32) if !wider_signed => Instruction::I32RemU,
        (BinaryOp::ModDiv, Stack::I32) => Instruction::I32RemS,
        (BinaryOp::ModDiv, Stack::I64) if !wider_signed => Instruction::I64RemU,
        (BinaryOp::ModDiv, Stack::I64) => Instruction::I64RemS,
        (BinaryOp::ModDivS, Stack::I32) => Instruction::I32RemS,
        (BinaryOp::ModDivS, Stack::I64) => Instruction::I64RemS,
        (BinaryOp::And, Stack::I32) => Instruction::I32And,
        (BinaryOp::And, Stack::I64) => Instruction::I64And,
        (BinaryOp::Or, Stack::I32) => Instruction::I32Or,
        (BinaryOp::Or, Stack::I64) => Instruction::I64Or,
        (BinaryOp::Xor, Stack::I32) => Instruction::I32Xor,
        (BinaryOp::Xor, Stack::I64) => Instruction::I64Xor,
        _ => return Err(CodegenError::UnknownOperator(op.name().to_string())),
    };
    f.instruction(&instr);
    Ok(common)
}

fn common_container(lt: &DataType, rt: &DataType) -> CodegenResult<Stack> {
    let l = Stack::of(lt)?;
    let r = Stack::of(rt)?;
    Ok(if l == Stack::I64 || r == Stack::I64 {
        Stack::I64
    } else {
        Stack::I32
    })
}

fn compare_instruction(op: BinaryOp, common: Stack) -> CodegenResult<Instruction<'static>> {
    Ok(match (op, common) {
        (BinaryOp::Eq, Stack::I32) => Instruction::I32Eq,
        (BinaryOp::Eq, Stack::I64) => Instruction::I64Eq,
        (BinaryOp::Neq, Stack::I32) => Instruction::I32Ne,
        (BinaryOp::Neq, Stack::I64) => Instruction::I64Ne,
        (BinaryOp::Lt, Stack::I32) => Instruction::I32LtU,
        (BinaryOp::Lt, Stack::I64) => Instruction::I64LtU,
        (BinaryOp::LtS, Stack::I32) => Instruction::I32LtS,
        (BinaryOp::LtS, Stack::I64) => Instruction::I64LtS,
        (BinaryOp::Gt, Stack::I32) => Instruction::I32GtU,
        (BinaryOp::Gt, Stack::I64) => Instruction::I64GtU,
        (BinaryOp::GtS, Stack::I32) => Instruction::I32GtS,
        (BinaryOp::GtS, Stack::I64) => Instruction::I64GtS,
        (BinaryOp::Lte, Stack::I32) => Instruction::I32LeU,
        (BinaryOp::Lte, Stack::I64) => Instruction::I64LeU,
        (BinaryOp::LteS, Stack::I32) => Instruction::I32LeS,
        (BinaryOp::LteS, Stack::I64) => Instruction::I64LeS,
        (BinaryOp::Gte, Stack::I32) => Instruction::I32GeU,
        (BinaryOp::Gte, Stack::I64) => Instruction::I64GeU,
        (BinaryOp::GteS, Stack::I32) => Instruction::I32GeS,
        (BinaryOp::GteS, Stack::I64) => Instruction::I64GeS,
        _ => return Err(CodegenError::UnknownOperator(op.name().to_string())),
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Array element access
// ══════════════════════════════════════════════════════════════════════════════

/// Push `dataptr + index * elsize` and load one element.
fn emit_arraysel_load(
    arr: &Expr,
    index: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<Stack> {
    let entry = ctx.global_entry(arr)?;
    let elsize = match &entry.dtype {
        DataType::Array { subtype, .. } => subtype.size_bytes(),
        _ => {
            return Err(CodegenError::UnsupportedDataType(format!(
                "arraysel on non-array {}",
                entry.name
            )))
        }
    };
    if elsize > 8 {
        return Err(CodegenError::UnsupportedDataType(format!(
            "wide array element load of {} in scalar context",
            entry.name
        )));
    }
    emit_element_addr(index, elsize, ctx, f)?;
    let offset = entry.offset as u64;
    match elsize {
        1 => {
            f.instruction(&Instruction::I32Load8U(memarg(offset, 0)));
            Ok(Stack::I32)
        }
        2 => {
            f.instruction(&Instruction::I32Load16U(memarg(offset, 1)));
            Ok(Stack::I32)
        }
        4 => {
            f.instruction(&Instruction::I32Load(memarg(offset, 2)));
            Ok(Stack::I32)
        }
        _ => {
            f.instruction(&Instruction::I64Load(memarg(offset, 3)));
            Ok(Stack::I64)
        }
    }
}

/// `wordsel` selects a 32-bit chunk of a wide parent regardless of its width.
fn emit_wordsel_load(
    parent: &Expr,
    index: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<Stack> {
    let entry = ctx.global_entry(parent)?;
    emit_element_addr(index, 4, ctx, f)?;
    f.instruction(&Instruction::I32Load(memarg(entry.offset as u64, 2)));
    Ok(Stack::I32)
}

/// Push the dynamic part of an element address: `dataptr + index * elsize`.
/// The entry's own offset travels in the load/store memarg.
pub(crate) fn emit_element_addr(
    index: &Expr,
    elsize: u32,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    f.instruction(&Instruction::LocalGet(ctx.dp()));
    match fold_const(index) {
        Some(i) => {
            f.instruction(&Instruction::I32Const((i as u32 * elsize) as i32));
        }
        None => {
            emit_rvalue_as(index, ctx, f, Stack::I32)?;
            f.instruction(&Instruction::I32Const(elsize as i32));
            f.instruction(&Instruction::I32Mul);
        }
    }
    f.instruction(&Instruction::I32Add);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

/// Emit one statement-position expression.
pub fn emit_statement(e: &Expr, ctx: &mut FuncContext, f: &mut Function) -> CodegenResult<()> {
    match &e.kind {
        ExprKind::Block { exprs, .. } => {
            for sub in exprs {
                emit_statement(sub, ctx, f)?;
            }
            Ok(())
        }

        ExprKind::VarDecl { name, decltype } => ctx.declare(name, decltype.clone()),

        ExprKind::Binop { binop, left, right } if binop.is_assign() => {
            // The frontend puts the value on the left and the destination on
            // the right; all timing variants store identically.
            emit_assign(right, left, ctx, f)
        }

        ExprKind::Binop {
            binop: BinaryOp::ChangeDet,
            left,
            right,
        } => emit_changedet(left, right, ctx, f),

        ExprKind::Triop {
            triop: TriOp::If,
            cond,
            left,
            right,
        } => {
            emit_rvalue_as(cond, ctx, f, Stack::I32)?;
            f.instruction(&Instruction::If(BlockType::Empty));
            emit_statement(left, ctx, f)?;
            if !is_empty_block(right) {
                f.instruction(&Instruction::Else);
                emit_statement(right, ctx, f)?;
            }
            f.instruction(&Instruction::End);
            Ok(())
        }

        ExprKind::While {
            precond,
            loopcond,
            body,
            inc,
        } => emit_while(precond.as_deref(), loopcond, body, inc.as_deref(), ctx, f),

        ExprKind::Unop {
            unop: UnaryOp::CReset,
            arg,
        } => emit_creset(arg, ctx, f),

        ExprKind::Unop {
            unop: UnaryOp::CReturn,
            arg,
        } => {
            if ctx.returns_i32 {
                emit_rvalue_as(arg, ctx, f, Stack::I32)?;
            }
            f.instruction(&Instruction::Return);
            Ok(())
        }

        ExprKind::FuncCall { name, args, line } => emit_call(name, args, *line, ctx, f),

        // A bare value in statement position has no effect.
        ExprKind::Const { .. } | ExprKind::VarRef { .. } | ExprKind::StrConst { .. } => Ok(()),

        _ => {
            emit_rvalue(e, ctx, f)?;
            f.instruction(&Instruction::Drop);
            Ok(())
        }
    }
}

fn is_empty_block(e: &Expr) -> bool {
    matches!(&e.kind, ExprKind::Block { exprs, .. } if exprs.is_empty())
}

/// Store `value` into `dest`, masking to the destination's declared width.
pub fn emit_assign(
    dest: &Expr,
    value: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    // A wordsel destination writes one 32-bit chunk of a wide parent.
    if let ExprKind::Binop {
        binop: BinaryOp::WordSel,
        left: parent,
        right: index,
    } = &dest.kind
    {
        let entry = ctx.global_entry(parent)?;
        emit_element_addr(index, 4, ctx, f)?;
        emit_rvalue_as(value, ctx, f, Stack::I32)?;
        f.instruction(&Instruction::I32Store(memarg(entry.offset as u64, 2)));
        return Ok(());
    }

    let ddt = dtype_of(dest, ctx)?;
    if ddt.native() == NativeType::Ref && !matches!(ddt, DataType::Array { .. }) {
        return wide::emit_wide_assign(dest, value, ctx, f);
    }

    match &dest.kind {
        ExprKind::VarRef { name } => match ctx.resolve_var(name)? {
            VarLoc::Local(local) => {
                let want = Stack::of(&local.dtype)?;
                emit_rvalue_as(value, ctx, f, want)?;
                emit_mask(&local.dtype, want, f);
                f.instruction(&Instruction::LocalSet(local.index));
                Ok(())
            }
            VarLoc::Global(entry) => {
                f.instruction(&Instruction::LocalGet(ctx.dp()));
                emit_store_at(&entry.dtype, entry.offset, value, ctx, f)
            }
        },

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
                        "arraysel store on non-array {}",
                        entry.name
                    )))
                }
            };
            if eldt.size_bytes() > 8 {
                return Err(CodegenError::UnsupportedDataType(format!(
                    "wide array element store on {}",
                    entry.name
                )));
            }
            emit_element_addr(index, eldt.size_bytes(), ctx, f)?;
            emit_store_at(&eldt, entry.offset, value, ctx, f)
        }

        _ => Err(CodegenError::Internal(
            "assignment destination must be a variable or element".into(),
        )),
    }
}

/// With the store address already on the stack, emit the value (masked to
/// the destination width) and the sized store at `offset`.
fn emit_store_at(
    dtype: &DataType,
    offset: u32,
    value: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let want = Stack::of(dtype)?;
    emit_rvalue_as(value, ctx, f, want)?;
    emit_mask(dtype, want, f);
    let offset = offset as u64;
    f.instruction(&match dtype.size_bytes() {
        1 => Instruction::I32Store8(memarg(offset, 0)),
        2 => Instruction::I32Store16(memarg(offset, 1)),
        4 => Instruction::I32Store(memarg(offset, 2)),
        _ => Instruction::I64Store(memarg(offset, 3)),
    });
    Ok(())
}

/// Mask the value on the stack to the declared width, when the width does
/// not fill its container.
fn emit_mask(dtype: &DataType, s: Stack, f: &mut Function) {
    if let Some(mask) = dtype.narrow_mask_u64() {
        match s {
            Stack::I32 => {
                f.instruction(&Instruction::I32Const(mask as i32));
                f.instruction(&Instruction::I32And);
            }
            Stack::I64 => {
                f.instruction(&Instruction::I64Const(mask as i64));
                f.instruction(&Instruction::I64And);
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Change detection
// ══════════════════════════════════════════════════════════════════════════════

/// `if (left != right) { changed = 1; right = left; }`
///
/// `right` is the previous-cycle shadow; the flag is the function-local
/// returned from `_change_request`.
fn emit_changedet(
    left: &Expr,
    right: &Expr,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    let lt = dtype_of(left, ctx)?;
    if lt.native() == NativeType::Ref {
        return wide::emit_wide_changedet(left, right, ctx, f);
    }
    let common = common_container(&lt, &dtype_of(right, ctx)?)?;
    emit_rvalue_as(left, ctx, f, common)?;
    emit_rvalue_as(right, ctx, f, common)?;
    f.instruction(&match common {
        Stack::I32 => Instruction::I32Ne,
        Stack::I64 => Instruction::I64Ne,
    });
    f.instruction(&Instruction::If(BlockType::Empty));
    let changed = ctx.changed_local()?;
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::LocalSet(changed));
    emit_assign(right, left, ctx, f)?;
    f.instruction(&Instruction::End);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Loops
// ══════════════════════════════════════════════════════════════════════════════

/// `while` with optional precondition and increment.  Every emitted loop
/// carries an iteration counter that exits after the configured limit so a
/// runaway user program cannot lock the caller.
fn emit_while(
    precond: Option<&Expr>,
    loopcond: &Expr,
    body: &Expr,
    inc: Option<&Expr>,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    if let Some(pre) = precond {
        emit_statement(pre, ctx, f)?;
    }
    let counter = ctx.alloc_local(ValType::I32);
    let limit = ctx.config.loop_limit;
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalSet(counter));

    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Loop(BlockType::Empty));

    emit_rvalue_as(loopcond, ctx, f, Stack::I32)?;
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::BrIf(1));

    f.instruction(&Instruction::LocalGet(counter));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalTee(counter));
    f.instruction(&Instruction::I32Const(limit as i32));
    f.instruction(&Instruction::I32GtU);
    f.instruction(&Instruction::BrIf(1));

    emit_statement(body, ctx, f)?;
    if let Some(inc) = inc {
        emit_statement(inc, ctx, f)?;
    }
    f.instruction(&Instruction::Br(0));

    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Variable reset
// ══════════════════════════════════════════════════════════════════════════════

/// `creset` zeroes its operand and marks the layout entry.
fn emit_creset(arg: &Expr, ctx: &mut FuncContext, f: &mut Function) -> CodegenResult<()> {
    let name = arg.as_varref().ok_or_else(|| {
        CodegenError::Internal("creset operand must be a variable reference".into())
    })?;
    match ctx.resolve_var(name)? {
        VarLoc::Local(local) => {
            match Stack::of(&local.dtype)? {
                Stack::I32 => f.instruction(&Instruction::I32Const(0)),
                Stack::I64 => f.instruction(&Instruction::I64Const(0)),
            };
            f.instruction(&Instruction::LocalSet(local.index));
        }
        VarLoc::Global(entry) => {
            ctx.mark_reset(name);
            emit_zero_region(entry.offset, entry.size, ctx, f);
        }
    }
    Ok(())
}

/// Zero `size` bytes at `dataptr + offset`.  Small regions unroll into
/// sized stores; large ones (memories) run a 64-bit store loop.
pub(crate) fn emit_zero_region(offset: u32, size: u32, ctx: &mut FuncContext, f: &mut Function) {
    let mut at = offset;
    let end = offset + size;

    let words = size / 8;
    if words >= 8 {
        let ptr = ctx.alloc_local(ValType::I32);
        let cnt = ctx.alloc_local(ValType::I32);
        f.instruction(&Instruction::LocalGet(ctx.dp()));
        f.instruction(&Instruction::I32Const(offset as i32));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalSet(ptr));
        f.instruction(&Instruction::I32Const(words as i32));
        f.instruction(&Instruction::LocalSet(cnt));
        f.instruction(&Instruction::Block(BlockType::Empty));
        f.instruction(&Instruction::Loop(BlockType::Empty));
        f.instruction(&Instruction::LocalGet(cnt));
        f.instruction(&Instruction::I32Eqz);
        f.instruction(&Instruction::BrIf(1));
        f.instruction(&Instruction::LocalGet(ptr));
        f.instruction(&Instruction::I64Const(0));
        f.instruction(&Instruction::I64Store(memarg(0, 0)));
        f.instruction(&Instruction::LocalGet(ptr));
        f.instruction(&Instruction::I32Const(8));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::LocalSet(ptr));
        f.instruction(&Instruction::LocalGet(cnt));
        f.instruction(&Instruction::I32Const(1));
        f.instruction(&Instruction::I32Sub);
        f.instruction(&Instruction::LocalSet(cnt));
        f.instruction(&Instruction::Br(0));
        f.instruction(&Instruction::End);
        f.instruction(&Instruction::End);
        at += words * 8;
    }

    while at + 8 <= end {
        f.instruction(&Instruction::LocalGet(ctx.dp()));
        f.instruction(&Instruction::I64Const(0));
        f.instruction(&Instruction::I64Store(memarg(at as u64, 0)));
        at += 8;
    }
    while at + 4 <= end {
        f.instruction(&Instruction::LocalGet(ctx.dp()));
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::I32Store(memarg(at as u64, 0)));
        at += 4;
    }
    while at + 2 <= end {
        f.instruction(&Instruction::LocalGet(ctx.dp()));
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::I32Store16(memarg(at as u64, 0)));
        at += 2;
    }
    while at < end {
        f.instruction(&Instruction::LocalGet(ctx.dp()));
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::I32Store8(memarg(at as u64, 0)));
        at += 1;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Calls
// ══════════════════════════════════════════════════════════════════════════════

/// Direct call to a previously emitted function, or to an imported builtin.
fn emit_call(
    name: &str,
    args: &[Expr],
    line: u32,
    ctx: &mut FuncContext,
    f: &mut Function,
) -> CodegenResult<()> {
    match name {
        "$finish" | "$stop" => {
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::I32Const(line as i32));
            f.instruction(&Instruction::Call(if name == "$finish" {
                IMPORT_FINISH
            } else {
                IMPORT_STOP
            }));
            Ok(())
        }
        "$time" => {
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::Call(IMPORT_TIME));
            f.instruction(&Instruction::Drop);
            Ok(())
        }
        "$rand" => {
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::Call(IMPORT_RAND));
            f.instruction(&Instruction::Drop);
            Ok(())
        }
        "$readmem" | "$readmemh" | "$readmemb" => {
            let is_hex = name != "$readmemb";
            let (filename, target) = match args {
                [fname, mem] => (fname, mem),
                _ => {
                    return Err(CodegenError::Internal(
                        "$readmem takes (filename, memory)".into(),
                    ))
                }
            };
            let fname = match &filename.kind {
                ExprKind::StrConst { value } => value.clone(),
                _ => {
                    return Err(CodegenError::UnsupportedDataType(
                        "$readmem filename must be a string constant".into(),
                    ))
                }
            };
            let str_ofs = ctx.intern_string(&fname);
            let entry = ctx.global_entry(target)?;
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            // Absolute addresses for the host: dataptr + offset.
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::I32Const(str_ofs as i32));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::I32Const(entry.offset as i32));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::I32Const(is_hex as i32));
            f.instruction(&Instruction::Call(IMPORT_READMEM));
            Ok(())
        }
        _ => {
            let idx = ctx.function_index(name)?;
            f.instruction(&Instruction::LocalGet(ctx.dp()));
            f.instruction(&Instruction::Call(idx));
            Ok(())
        }
    }
}
