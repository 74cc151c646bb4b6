//! Per-calculation cache entry: the compiled kernel a given `(id, version)`
//! reuses across repeated `finalize_calculation` calls.

use ocl::{Kernel, Program};
use qgpu_core::KernelSignature;

/// A compiled program + kernel, cached across evaluations of the same
/// `(id, version)` until a version bump, a precision change, or disposal.
pub(crate) struct CompiledKernel {
    pub program: Program,
    pub kernel: Kernel,
    pub signature: KernelSignature,
}

/// One calculation's state, addressed by its 1-based `CalcId`.
///
/// `n` and `use_double_precision` are fixed at first build; a later
/// `initiate_calculation` call for the same `id` must supply the same `n`
/// (§4.2.2) and is free to change `use_double_precision`, which is treated
/// as an implicit version bump (see the runtime's `initiate_calculation`).
pub(crate) struct CalculationRecord {
    pub n: usize,
    pub version: u64,
    pub use_double_precision: bool,
    pub disposed: bool,
    pub compiled: Option<CompiledKernel>,
    /// Number of outputs declared the last time this kernel was (re)built;
    /// used only to size the output buffer when reusing a cached kernel.
    pub n_output_vars: usize,
}

impl CalculationRecord {
    pub fn new(n: usize, version: u64, use_double_precision: bool) -> Self {
        Self {
            n,
            version,
            use_double_precision,
            disposed: false,
            compiled: None,
            n_output_vars: 0,
        }
    }

    pub fn has_kernel(&self) -> bool {
        self.compiled.is_some()
    }

    /// Drop the cached program/kernel, forcing the next `finalize_calculation`
    /// to rebuild. Used on an explicit version bump, an implicit precision
    /// change, and `dispose_calculation`.
    pub fn invalidate(&mut self) {
        self.compiled = None;
    }
}
