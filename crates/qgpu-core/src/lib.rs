//! Device-agnostic primitives for the vectorised arithmetic GPU orchestrator.
//!
//! This crate carries no OpenCL dependency and contains no `unsafe` code. It
//! is the "pure" half of the orchestrator: variable identifiers, the opcode
//! enumeration, the SSA emitter, and kernel source text assembly. None of it
//! needs a device present, which is what lets the bulk of its test coverage
//! run without an OpenCL runtime.

#![forbid(unsafe_code)]

mod debug;
mod emit;
mod ids;
mod kernel_source;
mod opcode;
mod settings;

pub use debug::DebugInfo;
pub use emit::{emit_rhs, emit_ssa_line, resolve_arg, ArgRef, EmitError};
pub use ids::{CalcId, VarId};
pub use kernel_source::{build_kernel_source, trim_build_log, KernelSignature, MAX_BUILD_LOG_CHARS};
pub use opcode::Opcode;
pub use settings::Settings;
