//! Tag the assignable operands of a [`Flow`] with SSA indices.
//!
//! The approach is the same as for any reaching-definitions based SSA construction: rather than
//! computing dominance frontiers, we compute which definitions reach each use up front, link uses
//! that are reached by a single definition directly, and only introduce a theta (phi) merge where
//! several definitions actually meet. This means superfluous thetas never show up, at the cost of
//! possibly having more than one theta for the same location at different join points.
//!
//! Registers and memory dereferences are tagged in two separate passes, so that the address
//! expression of every dereference is already in SSA form (and possibly simplified) by the time
//! dereferences are keyed by it.

use crate::arch::Architecture;
use crate::containers::unordered::UnorderedMap;
use crate::dataflow::{DataFlow, FlowSummary, Location, ProgPoint};
use crate::error::Result;
use crate::ir::{Expr, ExprId, Flow, SsaLink, StmtId};
use crate::log::*;
use crate::reaching_definitions::ReachingDefinitionsElement;

/// Which kind of assignable operand a tagging pass handles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LocationKind {
    Registers,
    Derefs,
}

impl LocationKind {
    /// The location `op` refers to, if it is an untagged operand of this kind
    fn location_of(self, flow: &Flow, op: ExprId) -> Option<Location> {
        match (self, flow.expr(op)) {
            (LocationKind::Registers, Expr::Register { name, index: None }) => Some(name.clone()),
            (LocationKind::Derefs, Expr::Deref { inner, index: None }) => {
                Some(flow.display(*inner).to_string())
            }
            _ => None,
        }
    }

    /// The location read by `op`, if `op` is a use-site of this kind
    fn used_location(self, flow: &Flow, op: ExprId) -> Option<Location> {
        if let Some(p) = flow.parent_expr(op) {
            match flow.expr(p) {
                // Assignment targets are definitions, not uses
                Expr::Assign { lhs, .. } if *lhs == op => return None,
                // `&[x]` computes an address without reading memory
                Expr::Address(_) if self == LocationKind::Derefs => return None,
                _ => {}
            }
        }
        self.location_of(flow, op)
    }
}

/// Counts of what a tagging pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagStats {
    pub definitions: usize,
    pub uses: usize,
    pub thetas: usize,
}

/// The SSA tagging service
pub struct SsaTagger<'a> {
    arch: &'a dyn Architecture,
}

impl<'a> SsaTagger<'a> {
    pub fn new(arch: &'a dyn Architecture) -> Self {
        Self { arch }
    }

    /// Assign SSA indices to all register definitions and uses
    pub fn tag_registers(&self, flow: &mut Flow) -> Result<TagStats> {
        tag(flow, LocationKind::Registers)
    }

    /// Assign SSA indices to all memory dereference definitions and uses, keyed by their (already
    /// tagged) address expression. Memory aliasing between differently-written addresses is not
    /// modelled.
    pub fn tag_derefs(&self, flow: &mut Flow) -> Result<TagStats> {
        tag(flow, LocationKind::Derefs)
    }

    /// Clear all SSA indices and links, and drop the thetas introduced by tagging.
    pub fn untag(&self, flow: &mut Flow) {
        for stmt in flow.statements() {
            let root = flow.statement(stmt).expr;
            if let Expr::Assign { rhs, .. } = flow.expr(root) {
                if matches!(flow.expr(*rhs), Expr::Theta(_)) {
                    flow.unlink_subtree(root);
                    flow.remove_statement(stmt);
                    continue;
                }
            }
            let mut ops = flow.operands_of(stmt);
            ops.push(root);
            for op in ops {
                flow.set_link(op, SsaLink::None);
                if flow.expr(op).is_assignable() {
                    flow.set_index(op, None);
                }
            }
        }
        debug!("Removed SSA tagging");
    }

    /// Registers whose value at every `return` is provably the value they held on entry, despite
    /// being assigned somewhere in the function (e.g., callee-saved registers spilled to the stack
    /// and reloaded). Requires registers to be tagged; dereferences must be tagged too for
    /// save/restore through memory to be recognized.
    pub fn restored_locations(&self, flow: &Flow) -> Vec<String> {
        let summary = FlowSummary::compute_from(flow, |flow, op| match flow.expr(op) {
            Expr::Register { name, index: Some(_) } => Some(name.clone()),
            _ => None,
        });
        let reaching = DataFlow::<ReachingDefinitionsElement>::forward_analyze(&summary);

        let mut returns: Vec<(StmtId, ReachingDefinitionsElement)> = vec![];
        for &block in &summary.blocks {
            let mut state = reaching.ins[&block].clone();
            let defs = &summary.definitions[&block];
            let container = flow
                .block(block)
                .map(|b| b.container.clone())
                .unwrap_or_default();
            for stmt in container {
                if matches!(flow.expr(flow.statement(stmt).expr), Expr::Return(_)) {
                    returns.push((stmt, state.clone()));
                }
                for d in defs.iter().filter(|d| d.stmt == stmt) {
                    state.define(&d.location, ProgPoint::Def(d.site));
                }
            }
        }
        if returns.is_empty() {
            return vec![];
        }

        let mut locations: Vec<&Location> = summary.all_locations.iter().collect();
        locations.sort();
        locations
            .into_iter()
            .filter(|&reg| reg != self.arch.stack_register())
            .filter(|&reg| {
                returns.iter().all(|(_, state)| {
                    state.reaching(reg).into_iter().all(|p| match p {
                        ProgPoint::Entry => true,
                        ProgPoint::Def(d) => {
                            let mut budget = 100;
                            let r = is_entry_value_of_def(flow, d, reg, &mut budget);
                            if budget == 0 {
                                debug!("Excessively long chain when checking for restored location";
                                       "location" => reg, "definition" => ?d);
                            }
                            r
                        }
                    })
                })
            })
            .cloned()
            .collect()
    }
}

/// Whether the value assigned at definition site `def` is the entry value of register `reg`.
// XXX: The budget of 100 steps is an arbitrary upper bound on chains of copies; loops through
// thetas would otherwise recurse forever.
fn is_entry_value_of_def(flow: &Flow, def: ExprId, reg: &str, budget: &mut usize) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;
    let rhs = match flow.parent_expr(def).map(|p| flow.expr(p)) {
        Some(Expr::Assign { lhs, rhs }) if *lhs == def => *rhs,
        _ => return false,
    };
    match flow.expr(rhs) {
        Expr::Theta(ops) => ops
            .iter()
            .all(|&o| is_entry_value_of_use(flow, o, reg, budget)),
        _ => is_entry_value_of_use(flow, rhs, reg, budget),
    }
}

fn is_entry_value_of_use(flow: &Flow, op: ExprId, reg: &str, budget: &mut usize) -> bool {
    if !flow.expr(op).is_assignable() {
        return false;
    }
    match flow.link(op) {
        SsaLink::Use { definition: None } => {
            matches!(flow.expr(op), Expr::Register { name, .. } if name == reg)
        }
        SsaLink::Use {
            definition: Some(d),
        } => is_entry_value_of_def(flow, *d, reg, budget),
        _ => false,
    }
}

fn tag(flow: &mut Flow, kind: LocationKind) -> Result<TagStats> {
    debug!("Tagging SSA"; "kind" => ?kind);
    let summary = FlowSummary::compute_from(flow, |flow, op| kind.location_of(flow, op));
    let reaching = DataFlow::<ReachingDefinitionsElement>::forward_analyze(&summary);

    // Keys of use-sites are computed before any index is assigned, since tagging changes how
    // nested operands render.
    let mut use_sites: UnorderedMap<StmtId, Vec<(ExprId, Location)>> = Default::default();
    for stmt in flow.statements() {
        let uses: Vec<(ExprId, Location)> = flow
            .operands_of(stmt)
            .into_iter()
            .filter_map(|op| kind.used_location(flow, op).map(|l| (op, l)))
            .collect();
        use_sites.insert(stmt, uses);
    }

    let mut stats = TagStats::default();
    let mut next_index: UnorderedMap<Location, usize> = Default::default();
    for &block in &summary.blocks {
        for d in &summary.definitions[&block] {
            let idx = next_index.entry(d.location.clone()).or_insert(0);
            *idx += 1;
            flow.set_index(d.site, Some(*idx));
            flow.set_link(d.site, SsaLink::Definition { uses: vec![] });
            stats.definitions += 1;
        }
    }

    let mut thetas: UnorderedMap<(u64, Location), ExprId> = Default::default();
    let mut thetas_in_block: UnorderedMap<u64, usize> = Default::default();
    for &block in &summary.blocks {
        let mut state = reaching.ins[&block].clone();
        let defs = &summary.definitions[&block];
        let container = flow
            .block(block)
            .map(|b| b.container.clone())
            .unwrap_or_default();
        for stmt in container {
            for (op, location) in use_sites.get(&stmt).cloned().unwrap_or_default() {
                let mut points = state.reaching(&location);
                points.sort();
                let definition = match points.as_slice() {
                    [] | [ProgPoint::Entry] => None,
                    [ProgPoint::Def(d)] => Some(*d),
                    _ => {
                        let key = (block, location.clone());
                        let theta = match thetas.get(&key) {
                            Some(&t) => t,
                            None => {
                                let pos = thetas_in_block.entry(block).or_insert(0);
                                let t = insert_theta(
                                    flow,
                                    block,
                                    *pos,
                                    op,
                                    &points,
                                    next_index.entry(location.clone()).or_insert(0),
                                );
                                *pos += 1;
                                stats.thetas += 1;
                                trace!("Inserted theta";
                                       "block" => format_args!("{:#x}", block),
                                       "location" => &location,
                                       "definition" => flow.display(t).to_string());
                                thetas.insert(key, t);
                                t
                            }
                        };
                        Some(theta)
                    }
                };
                link_use(flow, op, definition);
                stats.uses += 1;
            }
            for d in defs.iter().filter(|d| d.stmt == stmt) {
                state.define(&d.location, ProgPoint::Def(d.site));
            }
        }
    }

    info!("Tagged SSA";
          "kind" => ?kind,
          "definitions" => stats.definitions,
          "uses" => stats.uses,
          "thetas" => stats.thetas);
    Ok(stats)
}

/// Link use-site `op` to `definition` (`None` for the entry value), copying over its index
fn link_use(flow: &mut Flow, op: ExprId, definition: Option<ExprId>) {
    let index = match definition {
        Some(d) => flow.expr(d).index(),
        None => Some(0),
    };
    trace!("Linked use";
           "use" => flow.display(op).to_string(),
           "index" => index,
           OptionalKV("definition", definition.map(|d| flow.display(d).to_string())));
    flow.set_index(op, index);
    flow.set_link(op, SsaLink::Use { definition });
    if let Some(d) = definition {
        if let SsaLink::Definition { uses } = flow.link_mut(d) {
            uses.push(op);
        }
    }
}

/// Build a fresh operand shaped like `like` (a register, or a dereference through a copy of the
/// same address), untagged
fn fresh_location(flow: &mut Flow, like: ExprId) -> ExprId {
    let expr = match flow.expr(like).clone() {
        Expr::Deref { inner, .. } => Expr::Deref {
            inner: flow.copy_subtree(inner),
            index: None,
        },
        Expr::Register { name, .. } => Expr::Register { name, index: None },
        e => e,
    };
    flow.alloc(expr)
}

/// Insert `loc@k = THETA(loc@a, loc@b, ...)` at position `pos` of `block`, where `loc` is the
/// location of use-site `like` and `points` are the definitions reaching it. Returns the theta's
/// definition site.
fn insert_theta(
    flow: &mut Flow,
    block: u64,
    pos: usize,
    like: ExprId,
    points: &[ProgPoint],
    next_index: &mut usize,
) -> ExprId {
    let operands: Vec<ExprId> = points
        .iter()
        .map(|p| {
            let o = fresh_location(flow, like);
            link_use(
                flow,
                o,
                match p {
                    ProgPoint::Entry => None,
                    ProgPoint::Def(d) => Some(*d),
                },
            );
            o
        })
        .collect();
    let theta = flow.alloc(Expr::Theta(operands));
    let lhs = fresh_location(flow, like);
    *next_index += 1;
    flow.set_index(lhs, Some(*next_index));
    flow.set_link(lhs, SsaLink::Definition { uses: vec![] });
    let assign = flow.alloc(Expr::Assign { lhs, rhs: theta });
    flow.insert_statement(block, pos, block, assign);
    lhs
}
