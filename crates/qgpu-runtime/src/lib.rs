//! Device-facing half of the orchestrator: OpenCL device discovery, the
//! compute context state machine, the shared variate pool, and the MT19937
//! kernel source.
//!
//! Everything here depends on `ocl`; pure SSA emission and kernel source
//! assembly live in `qgpu_core` instead, so that half of the orchestrator's
//! logic is testable without a device present.

pub mod context;
pub mod device_info;
pub mod error;
pub mod kernels;
pub mod pool;
pub mod record;
pub mod registry;

pub use context::{ComputeContext, InitParams, InputValue};
pub use device_info::DeviceInfo;
pub use error::{Error, Result};
pub use registry::{DeviceRegistry, RegisteredDevice};

pub use qgpu_core::{CalcId, DebugInfo, Opcode, Settings, VarId};
