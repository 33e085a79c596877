//! The decompilation pipeline: a resumable sequence of named phases over one function.

use crate::arch::Architecture;
use crate::config::CONFIG;
use crate::containers::InsertionOrderedSet;
use crate::error::{DecompileError, Result};
use crate::flow::{find_control_flow, transform_ir};
use crate::ir::Flow;
use crate::listing::Disassembler;
use crate::log::*;
use crate::propagator::{propagate, PropagationStats, StackPropagationPolicy};
use crate::pruner::{prune, prune_to_fixed_point, verify_use_chains};
use crate::renamer::{rename, StackRenamer};
use crate::ssa::{SsaTagger, TagStats};

/// A milestone of the pipeline. Phases are reached strictly in declaration order.
///
/// Phases still to be added after [`Phase::StackRenamed`] (call argument recovery, general
/// assignment propagation, a second pruning, leaving SSA form, and block recombination) go at the
/// end of [`Phase::ALL`], and are subject to the same run-once, in-order discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    NothingDone,
    BasicBlocks,
    IrForm,
    SsaFormRegisters,
    StackPropagated,
    SsaFormDerefs,
    Pruned,
    StackRenamed,
}

impl Phase {
    /// Every phase, in execution order
    pub const ALL: [Phase; 8] = [
        Phase::NothingDone,
        Phase::BasicBlocks,
        Phase::IrForm,
        Phase::SsaFormRegisters,
        Phase::StackPropagated,
        Phase::SsaFormDerefs,
        Phase::Pruned,
        Phase::StackRenamed,
    ];

    /// Human-readable description of what has been achieved once this phase is reached
    pub fn description(&self) -> &'static str {
        match self {
            Phase::NothingDone => "Nothing done yet",
            Phase::BasicBlocks => "Basic block information ready",
            Phase::IrForm => "Intermediate form is ready",
            Phase::SsaFormRegisters => "Static single assignment form (registers)",
            Phase::StackPropagated => "Stack variable is propagated",
            Phase::SsaFormDerefs => "Static single assignment form (dereferences)",
            Phase::Pruned => "Dead assignments pruned",
            Phase::StackRenamed => "Stack locations and registers are renamed",
        }
    }

    /// Short machine-friendly name
    pub fn name(&self) -> &'static str {
        match self {
            Phase::NothingDone => "nothing-done",
            Phase::BasicBlocks => "basic-blocks",
            Phase::IrForm => "ir-form",
            Phase::SsaFormRegisters => "ssa-registers",
            Phase::StackPropagated => "stack-propagated",
            Phase::SsaFormDerefs => "ssa-derefs",
            Phase::Pruned => "pruned",
            Phase::StackRenamed => "stack-renamed",
        }
    }

    /// The phase that follows this one, if any
    pub fn next(&self) -> Option<Phase> {
        let pos = Phase::ALL.iter().position(|p| p == self)?;
        Phase::ALL.get(pos + 1).cloned()
    }

    /// The last phase of the pipeline
    pub fn last() -> Phase {
        Phase::ALL[Phase::ALL.len() - 1]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.name() == s)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "unknown phase `{}`; expected one of: {}",
                    s,
                    Phase::ALL.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
                )
            })
    }
}

/// What the passes did, for reporting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub register_tags: TagStats,
    pub propagation: PropagationStats,
    pub deref_tags: TagStats,
    pub pruned: usize,
    pub renamed: usize,
}

/// State carried across the passes of one decompilation session.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    /// Stack offsets, in first-seen order; an offset's position is the number of its variable
    stack_slots: InsertionOrderedSet<i64>,
    /// Registers found to be restored to their entry value at every return
    pub restored_locations: Vec<String>,
    pub stats: SessionStats,
}

impl SessionState {
    /// The variable number for stack `offset`, allocating the next one if the offset is new
    pub fn stack_slot(&mut self, offset: i64) -> usize {
        let (slot, new) = self.stack_slots.insert_full(offset);
        if new {
            trace!("New stack variable"; "offset" => offset, "name" => Self::variable_name(slot));
        }
        slot
    }

    /// Name of the synthesized variable with number `slot`
    pub fn variable_name(slot: usize) -> String {
        format!("s{}", slot)
    }

    /// Name of the variable assigned to stack `offset`, if any
    pub fn variable_for_offset(&self, offset: i64) -> Option<String> {
        self.stack_slots.get_index(&offset).map(Self::variable_name)
    }

    /// All `(offset, variable name)` pairs, in variable order
    pub fn stack_variables(&self) -> Vec<(i64, String)> {
        self.stack_slots
            .iter()
            .enumerate()
            .map(|(i, &o)| (o, Self::variable_name(i)))
            .collect()
    }
}

/// Decompilation of one function, advanced one [`Phase`] at a time.
pub struct Decompiler<'a> {
    disasm: &'a dyn Disassembler,
    arch: &'a dyn Architecture,
    flow: Flow,
    phases: Vec<Phase>,
    session: SessionState,
    /// The phase that failed, if any; the session cannot progress after a failure
    failed: Option<Phase>,
}

impl<'a> Decompiler<'a> {
    /// Start a session for the function at `ea`
    pub fn new(disasm: &'a dyn Disassembler, arch: &'a dyn Architecture, ea: u64) -> Self {
        info!("Starting decompilation"; "entry" => format_args!("{:#x}", ea), "arch" => arch.name());
        Self {
            disasm,
            arch,
            flow: Flow::new(ea),
            phases: vec![Phase::NothingDone],
            session: SessionState::default(),
            failed: None,
        }
    }

    /// The log of reached phases, oldest first
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The most recently reached phase
    pub fn current_phase(&self) -> Phase {
        *self.phases.last().unwrap_or(&Phase::NothingDone)
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn arch(&self) -> &dyn Architecture {
        self.arch
    }

    /// Run the next phase. Returns the phase reached, or `None` if the pipeline is complete.
    pub fn step(&mut self) -> Result<Option<Phase>> {
        if let Some(phase) = self.failed {
            return Err(DecompileError::SessionAborted { phase });
        }
        let phase = match self.current_phase().next() {
            Some(p) => p,
            None => return Ok(None),
        };
        debug!("Running phase"; "phase" => phase.name());
        if let Err(e) = self.run_phase(phase) {
            error!("Phase failed"; "phase" => phase.name(), "error" => %e);
            self.failed = Some(phase);
            return Err(DecompileError::PhaseFailed {
                phase,
                source: Box::new(e),
            });
        }
        self.phases.push(phase);
        if CONFIG.debug_print_flow_after_each_phase {
            trace!("Flow after phase"; "phase" => phase.name(), "flow" => ?self.flow.debug_flow());
        }
        Ok(Some(phase))
    }

    /// Run every phase not yet reached, up to and including `phase`. A no-op if `phase` has
    /// already been reached.
    pub fn advance_to(&mut self, phase: Phase) -> Result<()> {
        if let Some(failed) = self.failed {
            return Err(DecompileError::SessionAborted { phase: failed });
        }
        while self.current_phase() < phase {
            if self.step()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Run the whole pipeline
    pub fn run_to_completion(&mut self) -> Result<()> {
        self.advance_to(Phase::last())
    }

    fn run_phase(&mut self, phase: Phase) -> Result<()> {
        let tagger = SsaTagger::new(self.arch);
        match phase {
            Phase::NothingDone => {}
            Phase::BasicBlocks => find_control_flow(&mut self.flow, self.disasm)?,
            Phase::IrForm => transform_ir(&mut self.flow, self.disasm)?,
            Phase::SsaFormRegisters => {
                self.session.stats.register_tags = tagger.tag_registers(&mut self.flow)?;
            }
            Phase::StackPropagated => {
                let policy = StackPropagationPolicy::new(self.arch);
                self.session.stats.propagation = propagate(&mut self.flow, &policy)?;
            }
            Phase::SsaFormDerefs => {
                self.session.stats.deref_tags = tagger.tag_derefs(&mut self.flow)?;
                self.session.restored_locations = tagger.restored_locations(&self.flow);
                debug!("Found restored locations"; "locations" => ?self.session.restored_locations);
            }
            Phase::Pruned => {
                if CONFIG.verify_use_chains {
                    verify_use_chains(&self.flow)?;
                }
                let removed = if CONFIG.prune_to_fixed_point {
                    prune_to_fixed_point(&mut self.flow)
                } else {
                    prune(&mut self.flow)
                };
                info!("Pruned dead definitions"; "removed" => removed);
                self.session.stats.pruned = removed;
            }
            Phase::StackRenamed => {
                let mut renamer = StackRenamer::new(self.arch, &mut self.session);
                let renamed = rename(&mut self.flow, &mut renamer)?;
                info!("Renamed stack locations";
                      "renamed" => renamed,
                      "variables" => self.session.stack_variables().len());
                self.session.stats.renamed = renamed;
            }
        }
        Ok(())
    }
}
