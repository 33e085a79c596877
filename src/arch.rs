//! Architecture descriptions, as far as the stack-variable passes need them.

use crate::ir::{BinOp, Expr, ExprId, Flow};

/// Operand classification queries about the target architecture. All of these are pure.
pub trait Architecture {
    /// Short name, as used in listings (e.g., `x86`)
    fn name(&self) -> &str;

    /// Name of the stack pointer register
    fn stack_register(&self) -> &str;

    /// Whether `op` is the bare stack pointer register, with any SSA index
    fn is_stack_register(&self, flow: &Flow, op: ExprId) -> bool {
        matches!(flow.expr(op), Expr::Register { name, .. } if name == self.stack_register())
    }

    /// Whether `op` is a stack-relative address `sp + c` or `sp - c`, with `c` a constant
    fn is_stack_variable(&self, flow: &Flow, op: ExprId) -> bool {
        match flow.expr(op) {
            Expr::Binary {
                op: BinOp::Add | BinOp::Sub,
                lhs,
                rhs,
            } => {
                self.is_stack_register(flow, *lhs) && matches!(flow.expr(*rhs), Expr::Value(_))
            }
            _ => false,
        }
    }
}

/// An architecture described only by its name and stack pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterArch {
    name: String,
    stack_register: String,
}

impl RegisterArch {
    pub fn new(name: &str, stack_register: &str) -> Self {
        Self {
            name: name.to_owned(),
            stack_register: stack_register.to_owned(),
        }
    }

    /// 32-bit x86
    pub fn x86() -> Self {
        Self::new("x86", "esp")
    }

    /// AMD64
    pub fn x86_64() -> Self {
        Self::new("x86_64", "rsp")
    }

    /// Look up a preset by its listing name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "x86" | "i386" => Some(Self::x86()),
            "x86_64" | "amd64" => Some(Self::x86_64()),
            _ => None,
        }
    }
}

impl Architecture for RegisterArch {
    fn name(&self) -> &str {
        &self.name
    }

    fn stack_register(&self) -> &str {
        &self.stack_register
    }
}
