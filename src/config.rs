//! A global store of flags that can impact decompilation.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different decompilation sessions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct DecompilerConfig {
    /// Repeat the dead-definition pruner until it stops removing statements. When `false`, the
    /// pruner is a single linear pass, and definitions that only become dead due to that pass's own
    /// removals are left in place.
    pub prune_to_fixed_point: bool,
    /// Before pruning, cross-check that every live use-site is listed by its definition. A mismatch
    /// aborts the phase rather than letting the pruner drop a definition that is still read.
    pub verify_use_chains: bool,
    /// Treat `sp - c` as the stack location `-c`. If `false`, the raw constant `c` is used for both
    /// `sp + c` and `sp - c`, which conflates locations on either side of the stack pointer.
    pub negate_subtracted_stack_offsets: bool,
    /// Trace-log the whole flow after each phase completes (useful when debugging)
    pub debug_print_flow_after_each_phase: bool,
    /// Show the original instruction address in front of each statement in flow dumps
    pub debug_print_addresses: bool,
}

impl DecompilerConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineDecompilerConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<DecompilerConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: DecompilerConfig = DecompilerConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Decompilation configuration parameters
pub enum CommandLineDecompilerConfig {
    EnablePruneToFixedPoint,
    DisableUseChainVerification,
    DisableNegatedStackOffsets,
    EnableDebugPrintFlowAfterEachPhase,
    EnableDebugPrintAddresses,
}

impl Default for DecompilerConfig {
    fn default() -> Self {
        DecompilerConfig {
            prune_to_fixed_point: false,
            verify_use_chains: true,
            negate_subtracted_stack_offsets: true,
            debug_print_flow_after_each_phase: false,
            debug_print_addresses: false,
        }
    }
}

impl From<Vec<CommandLineDecompilerConfig>> for DecompilerConfig {
    fn from(v: Vec<CommandLineDecompilerConfig>) -> Self {
        use CommandLineDecompilerConfig::*;
        let mut r = DecompilerConfig::default();
        for v in v {
            match v {
                EnablePruneToFixedPoint => {
                    r.prune_to_fixed_point = true;
                }
                DisableUseChainVerification => {
                    r.verify_use_chains = false;
                }
                DisableNegatedStackOffsets => {
                    r.negate_subtracted_stack_offsets = false;
                }
                EnableDebugPrintFlowAfterEachPhase => {
                    r.debug_print_flow_after_each_phase = true;
                }
                EnableDebugPrintAddresses => {
                    r.debug_print_addresses = true;
                }
            }
        }
        r
    }
}
