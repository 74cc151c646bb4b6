//! Per-evaluation settings.

/// Settings chosen at `initiateCalculation` time.
///
/// `useDoublePrecision` is baked into the compiled kernel for a given
/// `(id, version)`: changing it on a cached calculation is treated the same
/// as a `version` bump (see the runtime's `initiate_calculation`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    pub use_double_precision: bool,
    pub rng_seed: u64,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_double_precision: false,
            rng_seed: 0,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_use_single_precision_and_no_debug() {
        let s = Settings::default();
        assert!(!s.use_double_precision);
        assert!(!s.debug);
        assert_eq!(s.rng_seed, 0);
    }
}
