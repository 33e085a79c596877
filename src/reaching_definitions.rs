//! [`DataFlow`](crate::dataflow::DataFlow) equations for the reaching-definitions analysis.

use std::rc::Rc;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::dataflow::{DataFlowElement, FlowSummary, Location, ProgPoint};

#[derive(PartialEq, Clone)]
// PERF: This is going to be a quite inefficient representation. Might be good to use a `Cow` or
// similar to reduce the number of copies held around?
#[derive(Debug)]
/// Reaching definitions at a specific point in the flow.
pub struct ReachingDefinitionsElement {
    /// A map of locations to the set of definition points that reach it.
    pub defs: UnorderedMap<Location, Rc<UnorderedSet<ProgPoint>>>,
}

impl ReachingDefinitionsElement {
    /// Kill all definitions of `location`, replacing them with the single definition `point`.
    pub fn define(&mut self, location: &Location, point: ProgPoint) {
        let def_d = self.defs.entry(location.clone()).or_default();
        *def_d = Rc::new(std::iter::once(point).collect());
    }

    /// The definitions of `location` reaching this point. A location never defined anywhere in
    /// the function is reached only by its entry value.
    pub fn reaching(&self, location: &str) -> Vec<ProgPoint> {
        match self.defs.get(location) {
            Some(s) => s.iter().cloned().collect(),
            None => vec![ProgPoint::Entry],
        }
    }
}

impl DataFlowElement for ReachingDefinitionsElement {
    /// Initially, all reaching definitions start out empty.
    fn init() -> Self {
        Self {
            defs: Default::default(),
        }
    }

    /// Joining two reaching definitions consists of taking the union on all definitions.
    fn join_from(&mut self, other: &Self) {
        for (d, s) in other.defs.iter() {
            let def_d = self.defs.entry(d.clone()).or_default();
            *def_d = Rc::new(def_d.union(s).cloned().collect());
        }
    }

    /// At the start of the function, every location holds its entry value.
    fn init_func_start(summary: &FlowSummary) -> Self {
        Self {
            defs: summary
                .all_locations
                .iter()
                .map(|v| {
                    (
                        v.clone(),
                        Rc::new(std::iter::once(ProgPoint::Entry).collect()),
                    )
                })
                .collect(),
        }
    }

    /// A block transfers reaching definitions by killing all over-ridden values in the output,
    /// replacing them with the block's last definition of each. All other definitions stay the
    /// same.
    fn transfer_function(&self, block: u64, summary: &FlowSummary) -> Self {
        // OUT[n] = GEN[n] Union (IN[n] - KILL[n]);
        let mut ret = self.clone();
        for d in &summary.definitions[&block] {
            ret.define(&d.location, ProgPoint::Def(d.site));
        }
        ret
    }
}
