//! IR construction helpers.
//!
//! Hosts that synthesize small designs (and the test suites) assemble IR
//! through these constructors instead of hand-writing node structs.

use num_bigint::BigUint;

use crate::{
    BinaryOp, BlockDef, ConstVal, DataType, Expr, ExprKind, InitItem, InitValue, ModuleDef,
    TriOp, UnaryOp, VarDef,
};

/// An unsigned logic type of `width` bits.
pub fn logic(width: u32) -> DataType {
    DataType::Logic {
        left: width - 1,
        right: 0,
        signed: false,
    }
}

/// A signed logic type of `width` bits.
pub fn logic_s(width: u32) -> DataType {
    DataType::Logic {
        left: width - 1,
        right: 0,
        signed: true,
    }
}

/// An array of `count` elements of `subtype`, indexed from 0.
pub fn array(subtype: DataType, count: u32) -> DataType {
    DataType::Array {
        subtype: Box::new(subtype),
        low: 0,
        high: count - 1,
    }
}

/// A numeric constant of the given type.
pub fn con(dtype: DataType, v: u64) -> Expr {
    Expr::new(
        ExprKind::Const {
            value: ConstVal::new(v),
        },
        Some(dtype),
    )
}

/// A big-integer constant of the given type.
pub fn bigcon(dtype: DataType, v: BigUint) -> Expr {
    Expr::new(
        ExprKind::Const {
            value: ConstVal::big(v),
        },
        Some(dtype),
    )
}

/// A string constant (for `$readmem` filenames).
pub fn strcon(s: &str) -> Expr {
    Expr::new(
        ExprKind::StrConst {
            value: s.to_string(),
        },
        None,
    )
}

/// A variable reference.
pub fn vref(name: &str) -> Expr {
    Expr::new(
        ExprKind::VarRef {
            name: name.to_string(),
        },
        None,
    )
}

/// A local variable declaration.
pub fn vdecl(name: &str, dtype: DataType) -> Expr {
    Expr::new(
        ExprKind::VarDecl {
            name: name.to_string(),
            decltype: dtype,
        },
        None,
    )
}

/// A unary operation with a result type.
pub fn unop(op: UnaryOp, dtype: DataType, arg: Expr) -> Expr {
    Expr::new(
        ExprKind::Unop {
            unop: op,
            arg: Box::new(arg),
        },
        Some(dtype),
    )
}

/// A binary operation with a result type.
pub fn binop(op: BinaryOp, dtype: DataType, left: Expr, right: Expr) -> Expr {
    Expr::new(
        ExprKind::Binop {
            binop: op,
            left: Box::new(left),
            right: Box::new(right),
        },
        Some(dtype),
    )
}

/// `lhs = rhs` (blocking form; the timing variants lower identically).
pub fn assign(lhs: Expr, rhs: Expr) -> Expr {
    Expr::new(
        ExprKind::Binop {
            binop: BinaryOp::Assign,
            // The frontend puts the destination on the right for assignments.
            left: Box::new(rhs),
            right: Box::new(lhs),
        },
        None,
    )
}

/// `array[index]` selection.
pub fn arraysel(dtype: DataType, arr: Expr, index: Expr) -> Expr {
    binop(BinaryOp::ArraySel, dtype, arr, index)
}

/// A statement-position `if` (no result value).
pub fn ifop(cond: Expr, then: Expr, els: Option<Expr>) -> Expr {
    Expr::new(
        ExprKind::Triop {
            triop: TriOp::If,
            cond: Box::new(cond),
            left: Box::new(then),
            right: Box::new(els.unwrap_or_else(|| block(None, vec![]))),
        },
        None,
    )
}

/// A value-producing conditional.
pub fn condop(dtype: DataType, cond: Expr, then: Expr, els: Expr) -> Expr {
    Expr::new(
        ExprKind::Triop {
            triop: TriOp::Cond,
            cond: Box::new(cond),
            left: Box::new(then),
            right: Box::new(els),
        },
        Some(dtype),
    )
}

/// A `while` loop.
pub fn whileop(precond: Option<Expr>, loopcond: Expr, body: Expr, inc: Option<Expr>) -> Expr {
    Expr::new(
        ExprKind::While {
            precond: precond.map(Box::new),
            loopcond: Box::new(loopcond),
            body: Box::new(body),
            inc: inc.map(Box::new),
        },
        None,
    )
}

/// A function call with a source line.
pub fn call(name: &str, args: Vec<Expr>, line: u32) -> Expr {
    Expr::new(
        ExprKind::FuncCall {
            name: name.to_string(),
            args,
            line,
        },
        None,
    )
}

/// An expression block.
pub fn block(name: Option<&str>, exprs: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::Block {
            name: name.map(str::to_string),
            exprs,
        },
        None,
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// ModuleBuilder
// ══════════════════════════════════════════════════════════════════════════════

/// Fluent builder for a [`ModuleDef`].
pub struct ModuleBuilder {
    name: String,
    vardefs: Vec<VarDef>,
    blocks: Vec<BlockDef>,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vardefs: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn var(mut self, def: VarDef) -> Self {
        self.vardefs.push(def);
        self
    }

    pub fn input(self, name: &str, dtype: DataType) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: true,
            is_output: false,
            is_param: false,
            init_value: None,
            const_value: None,
        })
    }

    pub fn output(self, name: &str, dtype: DataType) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: false,
            is_output: true,
            is_param: false,
            init_value: None,
            const_value: None,
        })
    }

    /// An internal (non-port) signal.
    pub fn signal(self, name: &str, dtype: DataType) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: false,
            is_output: false,
            is_param: false,
            init_value: None,
            const_value: None,
        })
    }

    pub fn constant(self, name: &str, dtype: DataType, v: u64) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: false,
            is_output: false,
            is_param: true,
            init_value: None,
            const_value: Some(ConstVal::new(v)),
        })
    }

    pub fn big_constant(self, name: &str, dtype: DataType, v: BigUint) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: false,
            is_output: false,
            is_param: true,
            init_value: None,
            const_value: Some(ConstVal::big(v)),
        })
    }

    /// An internal signal with an array initializer.
    pub fn init_signal(self, name: &str, dtype: DataType, items: Vec<(u32, u64)>) -> Self {
        self.var(VarDef {
            name: name.to_string(),
            dtype,
            is_input: false,
            is_output: false,
            is_param: false,
            init_value: Some(InitValue::Array(
                items
                    .into_iter()
                    .map(|(index, v)| InitItem {
                        index,
                        value: Some(ConstVal::new(v)),
                        nested: None,
                    })
                    .collect(),
            )),
            const_value: None,
        })
    }

    pub fn block(mut self, name: &str, exprs: Vec<Expr>) -> Self {
        self.blocks.push(BlockDef {
            name: name.to_string(),
            exprs,
        });
        self
    }

    pub fn build(self) -> ModuleDef {
        ModuleDef {
            name: self.name,
            vardefs: self.vardefs,
            blocks: self.blocks,
        }
    }
}
