//! Error taxonomy surfaced to the orchestrator's client.

use qgpu_core::EmitError;
use thiserror::Error;

/// All failure modes the orchestrator can report.
///
/// One enum per crate boundary, in the idiom of the GPU crate this is
/// grounded on: `#[error("...")]` messages plus a single `#[from] ocl::Error`
/// escape hatch for any device-API call returning a non-success status
/// (`ocl::Error` already distinguishes enqueue-time failures from other
/// device errors internally, so a single `DeviceOp` variant covers both the
/// `EnqueueFailed` and `DeviceOp` kinds named in the specification).
#[derive(Debug, Error)]
pub enum Error {
    #[error("no device registered as {requested:?} (available: {available:?})")]
    NoDevice {
        requested: String,
        available: Vec<String>,
    },

    #[error("device initialisation failed after {attempts} attempt(s): {source}")]
    DeviceInit {
        attempts: u32,
        #[source]
        source: ocl::Error,
    },

    #[error("double precision was requested but device {device} does not support it")]
    CapabilityMismatch { device: String },

    #[error("{call} is not valid in state {state}")]
    BadState { call: &'static str, state: &'static str },

    #[error("calculation id {0} is unknown, disposed, or was created with a different n")]
    BadId(u32),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("kernel build failed:\n{log}")]
    BuildFailed { log: String },

    #[error("device operation failed: {0}")]
    DeviceOp(#[from] ocl::Error),

    #[error("expected {expected} output vector(s), got {got}")]
    OutputArity { expected: usize, got: usize },
}

impl From<EmitError> for Error {
    fn from(e: EmitError) -> Self {
        // Arity mismatches are a misuse of `applyOperation`'s contract, not
        // one of the spec's distinct failure kinds — they fold into
        // `BadState` rather than inventing a new externally-visible variant.
        let EmitError::ArgCount { .. } = e;
        Error::BadState {
            call: "applyOperation",
            state: "argument count does not match opcode arity",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
