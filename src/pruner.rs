//! Removal of dead register definitions.

use crate::error::{DecompileError, Result};
use crate::ir::{Expr, ExprId, Flow, SsaLink, StmtId};
use crate::log::*;

/// Whether the expression at `id` contains a call anywhere
fn contains_call(flow: &Flow, id: ExprId) -> bool {
    matches!(flow.expr(id), Expr::Call { .. })
        || flow.children(id).into_iter().any(|c| contains_call(flow, c))
}

/// Whether statement `stmt` is a dead register definition: an assignment, without calls on its
/// right-hand side, to an SSA-tagged register that has no recorded uses. Dereferences and
/// variables are never candidates.
pub fn is_prunable(flow: &Flow, stmt: StmtId) -> bool {
    let (lhs, rhs) = match flow.expr(flow.statement(stmt).expr) {
        Expr::Assign { lhs, rhs } => (*lhs, *rhs),
        _ => return false,
    };
    if contains_call(flow, rhs) {
        return false;
    }
    match flow.expr(lhs) {
        Expr::Register { index: Some(_), .. } => {}
        _ => return false,
    }
    flow.uses_of(lhs).is_empty()
}

/// Remove every prunable statement, visiting each statement exactly once. Removing a statement
/// drops the uses on its right-hand side from their definitions, but definitions that become dead
/// this way are not revisited. Returns the number of statements removed.
pub fn prune(flow: &mut Flow) -> usize {
    let mut removed = 0;
    for stmt in flow.statements() {
        if !is_prunable(flow, stmt) {
            continue;
        }
        trace!("Pruning dead definition"; "stmt" => ?stmt, "text" => flow.statement_text(stmt));
        let root = flow.statement(stmt).expr;
        flow.unlink_subtree(root);
        flow.remove_statement(stmt);
        removed += 1;
    }
    debug!("Finished pruning pass"; "removed" => removed);
    removed
}

/// Repeat [`prune`] until it no longer removes anything. Returns the total removed.
pub fn prune_to_fixed_point(flow: &mut Flow) -> usize {
    let mut total = 0;
    loop {
        let removed = prune(flow);
        if removed == 0 {
            return total;
        }
        total += removed;
    }
}

/// Cross-check the use bookkeeping against the flow: every live use-site must be listed by its
/// (live) definition, and every use listed by a definition must be a live use referring back to
/// it.
pub fn verify_use_chains(flow: &Flow) -> Result<()> {
    let fault = |definition: ExprId, message: String| DecompileError::InconsistentUses {
        definition: flow.display(definition).to_string(),
        message,
    };
    for stmt in flow.statements() {
        let mut ops = flow.operands_of(stmt);
        ops.push(flow.statement(stmt).expr);
        for op in ops {
            match flow.link(op) {
                SsaLink::Use {
                    definition: Some(d),
                } => {
                    if !flow.is_live(*d) {
                        return Err(fault(
                            *d,
                            format!("live use `{}` refers to a removed definition", flow.display(op)),
                        ));
                    }
                    if !flow.uses_of(*d).contains(&op) {
                        return Err(fault(
                            *d,
                            format!("live use `{}` is not recorded", flow.display(op)),
                        ));
                    }
                }
                SsaLink::Definition { uses } => {
                    for &u in uses {
                        let back = matches!(flow.link(u), SsaLink::Use { definition: Some(d) } if *d == op);
                        if !back || !flow.is_live(u) {
                            return Err(fault(
                                op,
                                format!("recorded use `{}` is stale", flow.display(u)),
                            ));
                        }
                    }
                }
                SsaLink::Use { definition: None } | SsaLink::None => {}
            }
        }
    }
    Ok(())
}
