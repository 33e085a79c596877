//! Basic block recovery and lowering of decoded instructions into the IR.

use crate::containers::unordered::UnorderedSet;
use crate::error::{DecompileError, Result};
use crate::ir::{Expr, ExprId, Flow};
use crate::listing::{Disassembler, Insn, InsnKind, Operand};
use crate::log::*;

/// Discover the instructions reachable from the flow's entry, and split them into basic blocks.
///
/// Blocks start at the entry, at every branch target, and right after every block-ending
/// instruction. Each block records its successor edges.
pub fn find_control_flow(flow: &mut Flow, disasm: &dyn Disassembler) -> Result<()> {
    let entry = flow.entry;
    if disasm.decode(entry).is_none() {
        return Err(DecompileError::ControlFlow {
            address: entry,
            message: "entry point is not a decodable instruction".into(),
        });
    }

    let mut reachable: UnorderedSet<u64> = Default::default();
    let mut leaders: UnorderedSet<u64> = Default::default();
    leaders.insert(entry);
    let mut worklist = vec![entry];
    while let Some(ea) = worklist.pop() {
        if !reachable.insert(ea) {
            continue;
        }
        let insn = decode(disasm, ea, ea)?;
        for t in insn.branch_targets() {
            decode(disasm, t, ea)?;
            leaders.insert(t);
            worklist.push(t);
        }
        if insn.falls_through() {
            let next = disasm
                .next_address(ea)
                .ok_or_else(|| DecompileError::ControlFlow {
                    address: ea,
                    message: "execution falls through past the end of the function".into(),
                })?;
            if insn.ends_block() {
                leaders.insert(next);
            }
            worklist.push(next);
        }
    }

    let mut leaders: Vec<u64> = leaders.iter().cloned().collect();
    leaders.sort_unstable();
    for &start in &leaders {
        let mut instructions = vec![];
        let mut successors = vec![];
        let mut cur = start;
        loop {
            instructions.push(cur);
            let insn = decode(disasm, cur, start)?;
            let next = if insn.falls_through() {
                disasm.next_address(cur)
            } else {
                None
            };
            if insn.ends_block() || next.map_or(true, |n| leaders.binary_search(&n).is_ok()) {
                successors.extend(next);
                for t in insn.branch_targets() {
                    if !successors.contains(&t) {
                        successors.push(t);
                    }
                }
                break;
            }
            // `next` is `Some` here, as a non-block-ending instruction always falls through
            cur = next.unwrap_or(cur);
        }
        trace!(
            "Recovered block";
            "start" => format_args!("{:#x}", start),
            "instructions" => instructions.len(),
            "successors" => ?successors,
        );
        flow.add_block(start, instructions, successors);
    }

    debug!("Recovered control flow"; "blocks" => leaders.len(), "instructions" => reachable.len());
    Ok(())
}

fn decode(disasm: &dyn Disassembler, ea: u64, from: u64) -> Result<&Insn> {
    disasm.decode(ea).ok_or_else(|| DecompileError::ControlFlow {
        address: from,
        message: format!("branch to undecodable address {:#x}", ea),
    })
}

/// Lower each instruction of each recovered block into a statement of the flow.
pub fn transform_ir(flow: &mut Flow, disasm: &dyn Disassembler) -> Result<()> {
    let blocks: Vec<(u64, Vec<u64>)> = flow
        .blocks()
        .map(|b| (b.address, b.instructions.clone()))
        .collect();
    let mut count = 0;
    for (block, instructions) in blocks {
        for ea in instructions {
            let insn = disasm.decode(ea).ok_or_else(|| DecompileError::Lowering {
                address: ea,
                message: "instruction disappeared after control flow recovery".into(),
            })?;
            let expr = lower_insn(flow, insn);
            flow.push_statement(block, ea, expr);
            count += 1;
        }
    }
    debug!("Lowered instructions to IR"; "statements" => count);
    Ok(())
}

fn lower_insn(flow: &mut Flow, insn: &Insn) -> ExprId {
    let expr = match &insn.kind {
        InsnKind::Assign(lhs, rhs) => {
            let lhs = lower_operand(flow, lhs);
            let rhs = lower_operand(flow, rhs);
            Expr::Assign { lhs, rhs }
        }
        InsnKind::Call(call) => return lower_operand(flow, call),
        InsnKind::Goto(t) => Expr::Goto(*t),
        InsnKind::Branch(cond, target) => Expr::Branch {
            cond: lower_operand(flow, cond),
            target: *target,
        },
        InsnKind::Return(v) => Expr::Return(v.as_ref().map(|v| lower_operand(flow, v))),
    };
    flow.alloc(expr)
}

fn lower_operand(flow: &mut Flow, op: &Operand) -> ExprId {
    let expr = match op {
        Operand::Register(name) => Expr::Register {
            name: name.clone(),
            index: None,
        },
        Operand::Value(v) => Expr::Value(*v),
        Operand::Deref(inner) => Expr::Deref {
            inner: lower_operand(flow, inner),
            index: None,
        },
        Operand::Address(inner) => Expr::Address(lower_operand(flow, inner)),
        Operand::Binary(op, lhs, rhs) => Expr::Binary {
            op: *op,
            lhs: lower_operand(flow, lhs),
            rhs: lower_operand(flow, rhs),
        },
        Operand::Unary(op, operand) => Expr::Unary {
            op: *op,
            operand: lower_operand(flow, operand),
        },
        Operand::Call(target, args) => Expr::Call {
            target: lower_operand(flow, target),
            args: args.iter().map(|a| lower_operand(flow, a)).collect(),
        },
    };
    flow.alloc(expr)
}
