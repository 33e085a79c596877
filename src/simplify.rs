//! Expression simplification filters, run over statements that a pass has just rewritten.
//!
//! The simplifier only restructures arithmetic nodes; non-constant leaves keep their node ids, so
//! SSA use-sites inside a simplified expression stay valid.

use crate::ir::{BinOp, Expr, ExprId, Flow, StmtId, UnOp};
use crate::log::*;

/// Simplify every expression of statement `stmt`, returning the number of rewrites performed.
pub fn simplify_statement(flow: &mut Flow, stmt: StmtId) -> usize {
    let root = flow.statement(stmt).expr;
    let (_, count) = simplify_expr(flow, root);
    if count > 0 {
        trace!("Simplified statement"; "stmt" => ?stmt, "result" => flow.statement_text(stmt), "rewrites" => count);
    }
    count
}

/// Simplify the expression at `id`, bottom-up. Returns the node now occupying `id`'s position
/// (which differs from `id` if the node was replaced by one of its children), and the number of
/// rewrites performed.
pub fn simplify_expr(flow: &mut Flow, id: ExprId) -> (ExprId, usize) {
    let mut count = 0;
    for c in flow.children(id) {
        count += simplify_expr(flow, c).1;
    }
    let mut cur = id;
    while let Some(next) = simplify_once(flow, cur) {
        cur = next;
        count += 1;
    }
    (cur, count)
}

fn value(flow: &Flow, id: ExprId) -> Option<i64> {
    match flow.expr(id) {
        Expr::Value(v) => Some(*v),
        _ => None,
    }
}

/// `x + c` or `x - c`, as `(x, signed c)`
fn offset_form(flow: &Flow, id: ExprId) -> Option<(ExprId, i64)> {
    match flow.expr(id) {
        Expr::Binary {
            op: op @ (BinOp::Add | BinOp::Sub),
            lhs,
            rhs,
        } => {
            let c = value(flow, *rhs)?;
            if value(flow, *lhs).is_some() {
                return None;
            }
            Some((
                *lhs,
                if *op == BinOp::Add {
                    c
                } else {
                    c.wrapping_neg()
                },
            ))
        }
        _ => None,
    }
}

/// Rewrite `id` into `base + offset` in canonical form, returning the node at `id`'s position
fn rebuild_offset(flow: &mut Flow, id: ExprId, base: ExprId, offset: i64) -> ExprId {
    if offset == 0 {
        flow.replace_in_parent(id, base);
        return base;
    }
    let (op, c) = if offset < 0 && offset != i64::MIN {
        (BinOp::Sub, -offset)
    } else {
        (BinOp::Add, offset)
    };
    let rhs = flow.alloc(Expr::Value(c));
    flow.replace(
        id,
        Expr::Binary {
            op,
            lhs: base,
            rhs,
        },
    );
    id
}

/// Apply one rewrite rule at `id`, if any applies; returns the node now at `id`'s position.
fn simplify_once(flow: &mut Flow, id: ExprId) -> Option<ExprId> {
    match flow.expr(id).clone() {
        Expr::Binary { op, lhs, rhs } => {
            if let (Some(a), Some(b)) = (value(flow, lhs), value(flow, rhs)) {
                flow.replace(id, Expr::Value(op.fold(a, b)));
                return Some(id);
            }
            // Constants go to the right of commutative additions
            if op == BinOp::Add && value(flow, lhs).is_some() {
                flow.replace(id, Expr::Binary { op, lhs: rhs, rhs: lhs });
                return Some(id);
            }
            let (base, c) = offset_form(flow, id)?;
            if let Some((inner_base, c2)) = offset_form(flow, base) {
                return Some(rebuild_offset(flow, id, inner_base, c.wrapping_add(c2)));
            }
            // `x + 0`, `x - 0`, `x + -c`, `x - -c`
            let raw = value(flow, rhs)?;
            if raw == 0 || (raw < 0 && raw != i64::MIN) {
                Some(rebuild_offset(flow, id, base, c))
            } else {
                None
            }
        }
        Expr::Unary { op, operand } => {
            let v = value(flow, operand)?;
            flow.replace(
                id,
                Expr::Value(match op {
                    UnOp::Neg => v.wrapping_neg(),
                    UnOp::Not => (v == 0) as i64,
                }),
            );
            Some(id)
        }
        _ => None,
    }
}
