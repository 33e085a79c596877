//! Errors that can abort a decompilation session.

/// Build a [`DecompileError::Listing`] for the given 1-based line number.
macro_rules! listing_error {
    ($line:expr, $msg:expr) => {
        crate::error::DecompileError::Listing {
            line: $line,
            message: $msg.to_string(),
        }
    };
    ($line:expr, $fmt:expr, $($arg:tt)*) => {
        crate::error::DecompileError::Listing {
            line: $line,
            message: format!($fmt, $($arg)*),
        }
    };
}

use thiserror::Error;

use crate::decompiler::Phase;

/// Every failure the pipeline can report to its host.
///
/// Failures fall into three groups:
///
/// - collaborator failures ([`DecompileError::Listing`], [`DecompileError::ControlFlow`],
///   [`DecompileError::Lowering`]), where the function could not be turned into a flow at all;
/// - structural-assumption violations ([`DecompileError::UnrecognizedStackLocation`]), where an
///   analysis pass met an operand shaped in a way it does not understand;
/// - internal-consistency faults ([`DecompileError::InconsistentUses`]), where the SSA use
///   bookkeeping disagrees with the flow itself.
///
/// The driver wraps whichever of these occurs in [`DecompileError::PhaseFailed`], naming the
/// milestone that could not be reached. After that, the session refuses to make further progress
/// and reports [`DecompileError::SessionAborted`].
#[derive(Error, Debug)]
pub enum DecompileError {
    /// The textual listing could not be parsed.
    #[error("Malformed listing at line {line}: {message}")]
    Listing { line: usize, message: String },

    /// Basic-block recovery could not follow the function's control flow.
    #[error("Control flow recovery failed at {address:#x}: {message}")]
    ControlFlow { address: u64, message: String },

    /// An instruction could not be lowered into the IR.
    #[error("IR lowering failed at {address:#x}: {message}")]
    Lowering { address: u64, message: String },

    /// An operand classified as a stack location did not have a recognizable shape.
    #[error(
        "Unrecognized stack location `{operand}` in statement at {address:#x}; expected one of {expected}"
    )]
    UnrecognizedStackLocation {
        operand: String,
        address: u64,
        expected: &'static str,
    },

    /// SSA definition/use bookkeeping does not match the flow.
    #[error("Inconsistent use chain for definition `{definition}`: {message}")]
    InconsistentUses { definition: String, message: String },

    /// A phase of the pipeline failed; `source` holds the underlying reason.
    #[error("Phase `{}` failed", .phase.name())]
    PhaseFailed {
        phase: Phase,
        #[source]
        source: Box<DecompileError>,
    },

    /// The session previously failed while running `phase`, and cannot make further progress.
    #[error("Session was aborted while running phase `{}`", .phase.name())]
    SessionAborted { phase: Phase },
}

pub type Result<T> = std::result::Result<T, DecompileError>;
