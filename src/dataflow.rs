//! Compute data flow across the blocks of a [`Flow`](crate::ir::Flow)

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::ir::{Expr, ExprId, Flow, StmtId};
use crate::log::*;
use std::collections::VecDeque;
use std::rc::Rc;

/// The identity of a storage location tracked by an analysis (a register name, or the rendered
/// address of a memory dereference).
pub type Location = String;

#[derive(PartialEq, PartialOrd, Ord, Eq, Clone, Copy, Hash)]
/// Different program points that can define a location.
pub enum ProgPoint {
    /// The value the location held when the function was entered
    Entry,
    /// The definition site (an assignment's left-hand side)
    Def(ExprId),
}
impl std::fmt::Debug for ProgPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProgPoint::Entry => write!(f, "Entry"),
            ProgPoint::Def(e) => write!(f, "Def({:?})", e),
        }
    }
}

/// A single definition within a block
#[derive(Debug, Clone)]
pub struct Definition {
    pub stmt: StmtId,
    pub site: ExprId,
    pub location: Location,
}

/// A summary of the flow, keeping track of the predecessors, successors and definitions of each
/// block, for a specific notion of [`Location`].
#[derive(Debug)]
pub struct FlowSummary {
    pub entry: u64,
    /// Blocks in ascending address order
    pub blocks: Vec<u64>,
    pub predecessors: UnorderedMap<u64, UnorderedSet<u64>>,
    pub successors: UnorderedMap<u64, Vec<u64>>,
    /// Definitions of each block, in statement order
    pub definitions: UnorderedMap<u64, Vec<Definition>>,
    pub all_locations: UnorderedSet<Location>,
}

impl FlowSummary {
    /// Compute a summary of `flow`, where `location_of` maps an assignable left-hand side to the
    /// location it defines (or `None` if the analysis does not track it).
    pub fn compute_from(
        flow: &Flow,
        location_of: impl Fn(&Flow, ExprId) -> Option<Location>,
    ) -> Rc<Self> {
        let mut r = Self {
            entry: flow.entry,
            blocks: flow.blocks().map(|b| b.address).collect(),
            predecessors: Default::default(),
            successors: Default::default(),
            definitions: Default::default(),
            all_locations: Default::default(),
        };

        for block in flow.blocks() {
            r.predecessors.entry(block.address).or_default();
            let mut defs = vec![];
            for &stmt in &block.container {
                if let Expr::Assign { lhs, .. } = flow.expr(flow.statement(stmt).expr) {
                    if let Some(location) = location_of(flow, *lhs) {
                        r.all_locations.insert(location.clone());
                        defs.push(Definition {
                            stmt,
                            site: *lhs,
                            location,
                        });
                    }
                }
            }
            r.definitions.insert(block.address, defs);
            r.successors.insert(block.address, block.successors.clone());
        }

        for block in flow.blocks() {
            for &s in &block.successors {
                match r.predecessors.get_mut(&s) {
                    Some(p) => {
                        p.insert(block.address);
                    }
                    None => {
                        debug!(
                            "Found edge to a non-block address, ignoring";
                            "from" => format_args!("{:#x}", block.address),
                            "to" => format_args!("{:#x}", s),
                        );
                    }
                }
            }
        }

        Rc::new(r)
    }
}

/// A single element in the data-flow analysis. Each block of the flow holds on to one member of
/// this element at its start and at its end.
///
/// The definition of this element is crucial to defining the entire data flow, since it also
/// defines the expected transfer function for the data flow.
pub trait DataFlowElement: PartialEq + Clone {
    /// The initial/default value to start at.
    fn init() -> Self;
    /// The join operator, when joining outs from different predecessors.
    ///
    /// Satisfies property `a.join_from(init())` keeps `a` unmodified.
    fn join_from(&mut self, other: &Self);

    /// The value at the start of the function's entry block
    fn init_func_start(summary: &FlowSummary) -> Self;

    /// The transfer function that (along with the init and join) defines the specific kind of data
    /// flow analysis at play.
    fn transfer_function(&self, block: u64, summary: &FlowSummary) -> Self;
}

/// Results of a data flow analysis. Uses the definition of the [`DataFlowElement`] to define the
/// type of analysis.
#[derive(Debug)]
pub struct DataFlow<T: DataFlowElement> {
    pub outs: UnorderedMap<u64, T>,
    pub ins: UnorderedMap<u64, T>,
    pub summary: Rc<FlowSummary>,
}

impl<T: DataFlowElement> DataFlow<T> {
    /// Perform a forwards analysis of the data flow of the summarized flow
    ///
    /// Uses the worklist algorithm to compute data flow
    pub fn forward_analyze(summary: &Rc<FlowSummary>) -> Self {
        let outs: UnorderedMap<u64, T> = summary.blocks.iter().map(|&b| (b, T::init())).collect();
        let ins = outs.clone();

        let mut r = Self {
            outs,
            ins,
            summary: summary.clone(),
        };

        let mut changed: VecDeque<u64> = summary.blocks.iter().cloned().collect();

        while let Some(n) = changed.pop_front() {
            let mut inn = T::init();
            if n == r.summary.entry {
                inn.join_from(&T::init_func_start(&r.summary));
            }
            let preds = &r.summary.predecessors[&n];
            if preds.is_empty() && n != r.summary.entry {
                debug!(
                    "Non-entry block found to not have predecessor";
                    "block" => format_args!("{:#x}", n),
                );
                inn.join_from(&T::init_func_start(&r.summary));
            }
            for p in preds {
                inn.join_from(&r.outs[p]);
            }

            let new_out = inn.transfer_function(n, &r.summary);
            r.ins.insert(n, inn);
            let old_out = r.outs.insert(n, new_out);

            if old_out.as_ref() != r.outs.get(&n) {
                for s in &r.summary.successors[&n] {
                    if r.summary.predecessors.contains_key(s) {
                        changed.push_back(*s);
                    }
                }
            }
        }

        r
    }
}
