//! Propagation of definitions into their uses.
//!
//! The engine is generic: it walks every SSA definition and asks a [`PropagationPolicy`] whether
//! the defined value may be substituted at each of its uses. Policies only decide; the engine
//! performs the substitution and keeps the use bookkeeping consistent.

use crate::arch::Architecture;
use crate::error::{DecompileError, Result};
use crate::ir::{Expr, ExprId, Flow, SsaLink};
use crate::log::*;
use crate::simplify::simplify_statement;

/// Decides whether a definition's value may replace one of its uses.
pub trait PropagationPolicy {
    /// Whether `value`, assigned at `definition`, should be substituted at `use_site`. The default
    /// is to never substitute.
    fn replace_with(&self, flow: &Flow, definition: ExprId, value: ExprId, use_site: ExprId) -> bool {
        let _ = (flow, definition, value, use_site);
        false
    }
}

/// The default policy, which never substitutes anything
pub struct NoPropagation;

impl PropagationPolicy for NoPropagation {}

/// Substitutes definitions of the stack pointer register into their uses, so that stack-relative
/// addresses become visible as `sp + c` in terms of the entry value of the stack pointer.
pub struct StackPropagationPolicy<'a> {
    arch: &'a dyn Architecture,
}

impl<'a> StackPropagationPolicy<'a> {
    pub fn new(arch: &'a dyn Architecture) -> Self {
        Self { arch }
    }
}

/// Whether `value` can be duplicated at a use without changing meaning: registers, constants,
/// variables, and address-of, composed with arithmetic. Never memory reads, calls, or thetas.
pub fn is_replaceable(flow: &Flow, value: ExprId) -> bool {
    match flow.expr(value) {
        Expr::Register { .. } | Expr::Value(_) | Expr::Var { .. } | Expr::Address(_) => true,
        Expr::Binary { lhs, rhs, .. } => is_replaceable(flow, *lhs) && is_replaceable(flow, *rhs),
        Expr::Unary { operand, .. } => is_replaceable(flow, *operand),
        Expr::Deref { .. }
        | Expr::Call { .. }
        | Expr::Theta(_)
        | Expr::Assign { .. }
        | Expr::Branch { .. }
        | Expr::Goto(_)
        | Expr::Return(_) => false,
    }
}

impl PropagationPolicy for StackPropagationPolicy<'_> {
    fn replace_with(&self, flow: &Flow, definition: ExprId, value: ExprId, use_site: ExprId) -> bool {
        if !self.arch.is_stack_register(flow, definition) {
            return false;
        }
        let in_theta = matches!(
            flow.parent_expr(use_site).map(|p| flow.expr(p)),
            Some(Expr::Theta(_))
        );
        if in_theta {
            trace!("Not propagating into theta"; "use" => flow.display(use_site).to_string());
            return false;
        }
        if matches!(flow.expr(value), Expr::Theta(_)) {
            trace!("Not propagating theta value"; "definition" => flow.display(definition).to_string());
            return false;
        }
        is_replaceable(flow, value)
    }
}

/// Counts of what a propagation pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagationStats {
    /// Definition/use pairs presented to the policy
    pub considered: usize,
    /// Uses actually replaced
    pub substitutions: usize,
}

/// Run the propagation engine over `flow` with the given policy.
pub fn propagate(flow: &mut Flow, policy: &dyn PropagationPolicy) -> Result<PropagationStats> {
    let mut stats = PropagationStats::default();
    for stmt in flow.statements() {
        let (definition, value) = match flow.expr(flow.statement(stmt).expr) {
            Expr::Assign { lhs, rhs } => (*lhs, *rhs),
            _ => continue,
        };
        if flow.expr(definition).index().is_none() {
            continue;
        }
        for use_site in flow.uses_of(definition).to_vec() {
            let expected = SsaLink::Use {
                definition: Some(definition),
            };
            if *flow.link(use_site) != expected {
                return Err(DecompileError::InconsistentUses {
                    definition: flow.display(definition).to_string(),
                    message: format!(
                        "use `{}` does not refer back to its definition",
                        flow.display(use_site)
                    ),
                });
            }
            let use_stmt = match flow.statement_of(use_site) {
                Some(s) if !flow.statement(s).removed => s,
                _ => continue,
            };
            stats.considered += 1;
            // The value may itself have been rewritten by an earlier substitution
            let value = match flow.expr(flow.statement(stmt).expr) {
                Expr::Assign { rhs, .. } => *rhs,
                _ => value,
            };
            if !policy.replace_with(flow, definition, value, use_site) {
                continue;
            }
            let copy = flow.copy_subtree(value);
            trace!("Propagating definition";
                   "definition" => flow.display(definition).to_string(),
                   "value" => flow.display(copy).to_string(),
                   "use" => flow.display(use_site).to_string());
            flow.unlink(use_site);
            flow.replace_in_parent(use_site, copy);
            simplify_statement(flow, use_stmt);
            stats.substitutions += 1;
        }
    }
    info!("Propagated definitions";
          "considered" => stats.considered,
          "substitutions" => stats.substitutions);
    Ok(stats)
}
