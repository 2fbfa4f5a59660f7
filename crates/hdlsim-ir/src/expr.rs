//! Expression nodes.
//!
//! The IR is a tree of tagged variants.  Operator kinds carry the frontend's
//! string names across the serde boundary; an unrecognized name fails
//! deserialization rather than slipping through to codegen.

use std::fmt;

use num_bigint::BigUint;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::DataType;

/// A constant value.
///
/// `cvalue` always holds the low 32 bits.  For constants wider than 32 bits
/// the frontend also provides `bigvalue`, which is authoritative for the full
/// value.  `cvalue: 0` with no `bigvalue` is a real zero — absence of the
/// whole constant is modeled as `Option<ConstVal>` at the use site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstVal {
    pub cvalue: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_biguint_hex"
    )]
    pub bigvalue: Option<BigUint>,
}

impl ConstVal {
    pub fn new(v: u64) -> Self {
        if v <= u32::MAX as u64 {
            Self {
                cvalue: v as u32,
                bigvalue: None,
            }
        } else {
            Self {
                cvalue: v as u32,
                bigvalue: Some(BigUint::from(v)),
            }
        }
    }

    pub fn big(v: BigUint) -> Self {
        let cvalue = v.iter_u32_digits().next().unwrap_or(0);
        Self {
            cvalue,
            bigvalue: Some(v),
        }
    }

    /// The value as a u64 (low 64 bits of `bigvalue` when present).
    pub fn value_u64(&self) -> u64 {
        match &self.bigvalue {
            Some(b) => {
                let mut digits = b.iter_u64_digits();
                digits.next().unwrap_or(0)
            }
            None => self.cvalue as u64,
        }
    }

    /// The full value as a big integer.
    pub fn value_big(&self) -> BigUint {
        match &self.bigvalue {
            Some(b) => b.clone(),
            None => BigUint::from(self.cvalue),
        }
    }
}

mod serde_biguint_hex {
    use super::*;

    pub fn serialize<S: Serializer>(v: &Option<BigUint>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_some(&format!("{b:x}")),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<BigUint>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            None => Ok(None),
            Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid hex constant: {hex}"))),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Operators
// ══════════════════════════════════════════════════════════════════════════════

macro_rules! named_op {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// The frontend's name for this operator.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse a frontend operator name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                Self::from_name(&s)
                    .ok_or_else(|| D::Error::custom(format!("unknown operator: {s}")))
            }
        }
    };
}

named_op! {
    /// Unary operator kinds.
    UnaryOp {
        Not => "not",
        Negate => "negate",
        Extends => "extends",
        CCast => "ccast",
        RedXor => "redxor",
        CReset => "creset",
        CReturn => "creturn",
    }
}

named_op! {
    /// Binary operator kinds.
    BinaryOp {
        Add => "add",
        Sub => "sub",
        Mul => "mul",
        MulS => "mul_s",
        Div => "div",
        DivS => "div_s",
        ModDiv => "moddiv",
        ModDivS => "moddiv_s",
        And => "and",
        Or => "or",
        Xor => "xor",
        Shl => "shl",
        ShrU => "shr",
        ShrS => "shr_s",
        Eq => "eq",
        Neq => "neq",
        Lt => "lt",
        LtS => "lt_s",
        Gt => "gt",
        GtS => "gt_s",
        Lte => "lte",
        LteS => "lte_s",
        Gte => "gte",
        GteS => "gte_s",
        Assign => "assign",
        AssignPre => "assignpre",
        AssignDly => "assigndly",
        AssignPost => "assignpost",
        ContAssign => "contassign",
        ArraySel => "arraysel",
        WordSel => "wordsel",
        ChangeDet => "changedet",
    }
}

named_op! {
    /// Ternary operator kinds.
    TriOp {
        If => "if",
        Cond => "cond",
    }
}

impl BinaryOp {
    /// All four assignment timing variants plus continuous assignment.
    /// The blocking/non-blocking delta is resolved by the frontend into
    /// separate blocks, so they lower identically.
    pub fn is_assign(self) -> bool {
        matches!(
            self,
            Self::Assign
                | Self::AssignPre
                | Self::AssignDly
                | Self::AssignPost
                | Self::ContAssign
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Self::Eq
                | Self::Neq
                | Self::Lt
                | Self::LtS
                | Self::Gt
                | Self::GtS
                | Self::Lte
                | Self::LteS
                | Self::Gte
                | Self::GteS
        )
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

/// An IR expression.  `dtype` is the node's result type where the frontend
/// provides one; variable references are resolved against the module's name
/// table instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DataType>,
}

/// Expression kinds, tagged by the frontend's `op` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ExprKind {
    /// A numeric constant (scalar or big-integer).
    Const { value: ConstVal },
    /// A string constant (only legal as a `$readmem` filename argument).
    StrConst { value: String },
    /// A reference to a named variable.
    VarRef { name: String },
    /// A local variable declaration inside a block.
    VarDecl { name: String, decltype: DataType },
    Unop {
        unop: UnaryOp,
        arg: Box<Expr>,
    },
    Binop {
        binop: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Triop {
        triop: TriOp,
        cond: Box<Expr>,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    While {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precond: Option<Box<Expr>>,
        loopcond: Box<Expr>,
        body: Box<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inc: Option<Box<Expr>>,
    },
    FuncCall {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
        /// Source line, forwarded to `$finish`/`$stop`.
        #[serde(default)]
        line: u32,
    },
    Block {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        exprs: Vec<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, dtype: Option<DataType>) -> Self {
        Self { kind, dtype }
    }

    /// The constant value, if this node is a constant.
    pub fn as_const(&self) -> Option<&ConstVal> {
        match &self.kind {
            ExprKind::Const { value } => Some(value),
            _ => None,
        }
    }

    /// The referenced variable name, if this node is a variable reference.
    pub fn as_varref(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::VarRef { name } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{con, logic};

    #[test]
    fn op_name_round_trip() {
        for op in [
            BinaryOp::Add,
            BinaryOp::ShrS,
            BinaryOp::AssignDly,
            BinaryOp::ChangeDet,
            BinaryOp::ModDivS,
        ] {
            assert_eq!(BinaryOp::from_name(op.name()), Some(op));
        }
        assert_eq!(BinaryOp::from_name("frobnicate"), None);
        assert_eq!(UnaryOp::from_name("redxor"), Some(UnaryOp::RedXor));
    }

    #[test]
    fn const_val_splits_halves() {
        let c = ConstVal::new(0x1_2345_6789);
        assert_eq!(c.cvalue, 0x2345_6789);
        assert_eq!(c.value_u64(), 0x1_2345_6789);
        let small = ConstVal::new(7);
        assert_eq!(small.bigvalue, None);
        assert_eq!(small.value_u64(), 7);
    }

    #[test]
    fn big_const_hex_serde() {
        let v = BigUint::parse_bytes(b"123456789abcdef0123456789", 16).unwrap();
        let c = ConstVal::big(v.clone());
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("123456789abcdef0123456789"));
        let back: ConstVal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value_big(), v);
    }

    #[test]
    fn expr_json_round_trip() {
        let e = Expr::new(
            ExprKind::Binop {
                binop: BinaryOp::Add,
                left: Box::new(con(logic(8), 1)),
                right: Box::new(con(logic(8), 2)),
            },
            Some(logic(8)),
        );
        let json = serde_json::to_string(&e).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn unknown_operator_fails_deserialization() {
        let json = r#"{"op":"binop","binop":"bogus","left":{"op":"const","value":{"cvalue":0}},"right":{"op":"const","value":{"cvalue":0}}}"#;
        assert!(serde_json::from_str::<Expr>(json).is_err());
    }
}
