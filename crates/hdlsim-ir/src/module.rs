//! Variable and module definitions.

use serde::{Deserialize, Serialize};

use crate::{ConstVal, DataType, Expr};

/// Block evaluated once at construction to reset variables.
pub const BLOCK_CTOR_VAR_RESET: &str = "_ctor_var_reset";
/// Block holding `initial` processes, run once after reset.
pub const BLOCK_EVAL_INITIAL: &str = "_eval_initial";
/// Block re-run during the post-reset settle loop.
pub const BLOCK_EVAL_SETTLE: &str = "_eval_settle";
/// The main evaluation block.
pub const BLOCK_EVAL: &str = "_eval";
/// Change-detection block; returns a changed flag.
pub const BLOCK_CHANGE_REQUEST: &str = "_change_request";

/// An element of an array initializer: `memory[index] = value`.
///
/// A nested initializer marks a multidimensional init, which this core
/// rejects during initial-value application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitItem {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConstVal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Vec<InitItem>>,
}

/// An initial value attached to a variable definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitValue {
    Array(Vec<InitItem>),
}

/// A variable definition.
///
/// `const_value` present (even when zero) marks the variable as a constant;
/// absence marks ordinary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDef {
    pub name: String,
    pub dtype: DataType,
    #[serde(default)]
    pub is_input: bool,
    #[serde(default)]
    pub is_output: bool,
    #[serde(default)]
    pub is_param: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_value: Option<InitValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<ConstVal>,
}

/// A named evaluation block: a list of top-level expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    pub name: String,
    pub exprs: Vec<Expr>,
}

/// An elaborated module: its variables (insertion-ordered, keyed by name)
/// and evaluation blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    pub vardefs: Vec<VarDef>,
    pub blocks: Vec<BlockDef>,
}

impl ModuleDef {
    /// Look up a variable definition by name.
    pub fn vardef(&self, name: &str) -> Option<&VarDef> {
        self.vardefs.iter().find(|v| v.name == name)
    }

    /// Look up a block by name.
    pub fn block(&self, name: &str) -> Option<&BlockDef> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{con, logic, ModuleBuilder};
    use crate::BinaryOp;

    #[test]
    fn vardef_lookup() {
        let m = ModuleBuilder::new("top")
            .input("clk", logic(1))
            .output("q", logic(8))
            .build();
        assert!(m.vardef("clk").is_some());
        assert!(m.vardef("q").unwrap().is_output);
        assert!(m.vardef("nope").is_none());
    }

    #[test]
    fn const_zero_distinct_from_absent() {
        let m = ModuleBuilder::new("top")
            .constant("ZERO", logic(8), 0)
            .signal("s", logic(8))
            .build();
        assert!(m.vardef("ZERO").unwrap().const_value.is_some());
        assert!(m.vardef("s").unwrap().const_value.is_none());
    }

    #[test]
    fn module_json_round_trip() {
        let m = ModuleBuilder::new("top")
            .input("a", logic(8))
            .output("y", logic(8))
            .block(
                crate::BLOCK_EVAL,
                vec![crate::build::assign(
                    crate::build::vref("y"),
                    crate::build::binop(
                        BinaryOp::Add,
                        logic(8),
                        crate::build::vref("a"),
                        con(logic(8), 1),
                    ),
                )],
            )
            .build();
        let json = serde_json::to_string(&m).unwrap();
        let back: ModuleDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
