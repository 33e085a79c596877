//! Renaming of operands, and its specialization to stack locations.
//!
//! [`rename`] is the generic driver: it walks every operand of the function in a fixed order and
//! lets a [`RenamePolicy`] pick which operands to replace, and with what. [`StackRenamer`] is the
//! policy that turns stack-frame accesses into synthesized variables `s0`, `s1`, ...

use crate::arch::Architecture;
use crate::config::CONFIG;
use crate::decompiler::SessionState;
use crate::error::{DecompileError, Result};
use crate::ir::{BinOp, Expr, ExprId, Flow, SsaLink};
use crate::log::*;

/// Chooses operands to rename, and builds their replacements.
pub trait RenamePolicy {
    /// Whether `op` should be replaced
    fn should_rename(&self, flow: &Flow, op: ExprId) -> bool;
    /// The replacement for `op`. Only called when [`Self::should_rename`] holds. Any nodes the
    /// returned expression refers to must already be allocated in `flow`.
    fn rename_with(&mut self, flow: &mut Flow, op: ExprId) -> Result<Expr>;
}

/// Visit every operand of every live statement (blocks in address order, statements in block
/// order, and each expression outer-to-inner, left-to-right), replacing in place each operand the
/// policy selects. Replaced operands are not descended into. Returns the number of replacements.
pub fn rename(flow: &mut Flow, policy: &mut dyn RenamePolicy) -> Result<usize> {
    let mut count = 0;
    for stmt in flow.statements() {
        let root = flow.statement(stmt).expr;
        for op in flow.children(root) {
            visit(flow, policy, op, &mut count)?;
        }
    }
    Ok(count)
}

fn visit(
    flow: &mut Flow,
    policy: &mut dyn RenamePolicy,
    op: ExprId,
    count: &mut usize,
) -> Result<()> {
    if policy.should_rename(flow, op) {
        let before = flow.display(op).to_string();
        let new = policy.rename_with(flow, op)?;
        for c in flow.children(op) {
            flow.unlink_subtree(c);
        }
        if !new.is_assignable() {
            // Only assignable operands can carry SSA links
            flow.unlink(op);
        }
        flow.replace(op, new);
        trace!("Renamed operand"; "from" => before, "to" => flow.display(op).to_string());
        *count += 1;
        return Ok(());
    }
    for c in flow.children(op) {
        visit(flow, policy, c, count)?;
    }
    Ok(())
}

fn is_assignment_target(flow: &Flow, op: ExprId) -> bool {
    matches!(
        flow.parent_expr(op).map(|p| flow.expr(p)),
        Some(Expr::Assign { lhs, .. }) if *lhs == op
    )
}

fn is_theta_input(flow: &Flow, op: ExprId) -> bool {
    matches!(
        flow.parent_expr(op).map(|p| flow.expr(p)),
        Some(Expr::Theta(_))
    )
}

/// The shapes [`StackRenamer::find_stack_location`] understands
const STACK_LOCATION_SHAPES: &str =
    "`sp`, `sp + c`, `sp - c`, or a dereference of one of those";

/// Renames stack locations to synthesized variables.
///
/// Every distinct stack offset gets exactly one variable for the whole session, numbered in the
/// order offsets are first seen. Dereferences of a stack location become the variable itself,
/// indexed at definition sites only; bare stack addresses become the address of the variable.
/// Theta operands are left alone.
pub struct StackRenamer<'a> {
    arch: &'a dyn Architecture,
    session: &'a mut SessionState,
}

impl<'a> StackRenamer<'a> {
    pub fn new(arch: &'a dyn Architecture, session: &'a mut SessionState) -> Self {
        Self { arch, session }
    }

    fn is_stack_address(&self, flow: &Flow, op: ExprId) -> bool {
        self.arch.is_stack_register(flow, op) || self.arch.is_stack_variable(flow, op)
    }

    /// The canonical frame offset denoted by `op`.
    ///
    /// One level of dereference is looked through. The bare stack pointer is offset 0, and `sp + c`
    /// is `c`. `sp - c` is `-c`, unless configured to use the raw constant. Anything else is an
    /// [`DecompileError::UnrecognizedStackLocation`].
    pub fn find_stack_location(&self, flow: &Flow, op: ExprId) -> Result<i64> {
        let inner = match flow.expr(op) {
            Expr::Deref { inner, .. } => *inner,
            _ => op,
        };
        if self.arch.is_stack_register(flow, inner) {
            return Ok(0);
        }
        if let Expr::Binary { op: bop, lhs, rhs } = flow.expr(inner) {
            if let (true, Expr::Value(c)) = (self.arch.is_stack_register(flow, *lhs), flow.expr(*rhs))
            {
                match bop {
                    BinOp::Add => return Ok(*c),
                    BinOp::Sub if CONFIG.negate_subtracted_stack_offsets => {
                        return Ok(c.wrapping_neg())
                    }
                    BinOp::Sub => return Ok(*c),
                    _ => {}
                }
            }
        }
        Err(DecompileError::UnrecognizedStackLocation {
            operand: flow.display(op).to_string(),
            address: flow
                .statement_of(op)
                .map(|s| flow.statement(s).address)
                .unwrap_or(flow.entry),
            expected: STACK_LOCATION_SHAPES,
        })
    }
}

impl RenamePolicy for StackRenamer<'_> {
    fn should_rename(&self, flow: &Flow, op: ExprId) -> bool {
        // Theta operands name the definitions being merged and must stay registers
        if is_theta_input(flow, op) {
            return false;
        }
        match flow.expr(op) {
            Expr::Deref { inner, .. } => self.is_stack_address(flow, *inner),
            // Stack pointer definitions that survive pruning stay registers
            Expr::Register { .. } if is_assignment_target(flow, op) => false,
            _ => self.is_stack_address(flow, op),
        }
    }

    fn rename_with(&mut self, flow: &mut Flow, op: ExprId) -> Result<Expr> {
        let offset = self.find_stack_location(flow, op)?;
        let slot = self.session.stack_slot(offset);
        let origin = flow.snapshot(op);
        let name = SessionState::variable_name(slot);
        Ok(match flow.expr(op) {
            // Only definition sites carry an index; reads stay linked through their SSA use
            Expr::Deref { index, .. } => Expr::Var {
                name,
                index: match flow.link(op) {
                    SsaLink::Definition { .. } => *index,
                    _ => None,
                },
                origin,
            },
            _ => {
                let var = flow.alloc(Expr::Var {
                    name,
                    index: None,
                    origin,
                });
                Expr::Address(var)
            }
        })
    }
}
