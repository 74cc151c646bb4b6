//! Kernel source embedded at compile time.

/// The MT19937 state-refill, tempering, and inverse-normal-CDF source,
/// shared by every [`crate::pool::VariatePool`] this context ever builds.
pub const MT19937: &str = include_str!("../kernels/mt19937.cl");

/// Kernel entry point names, stable across precision variants.
pub mod names {
    pub const SEED_INIT: &str = "ore_mt_seed_init";
    pub const TWIST: &str = "ore_mt_twist";
    pub const GENERATE: &str = "ore_mt_generate";
}

/// Prefix [`MT19937`] with the `ORE_USE_DOUBLE` define when the pool was
/// requested in double precision, matching the `#ifdef`-gated `ore_real`
/// typedef in the kernel source.
pub fn variate_pool_source(use_double_precision: bool) -> String {
    if use_double_precision {
        format!("#define ORE_USE_DOUBLE 1\n{MT19937}")
    } else {
        MT19937.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_precision_source_defines_the_switch() {
        let src = variate_pool_source(true);
        assert!(src.starts_with("#define ORE_USE_DOUBLE"));
        assert!(src.contains("ore_mt_generate"));
    }

    #[test]
    fn single_precision_source_omits_the_switch() {
        let src = variate_pool_source(false);
        assert!(!src.contains("ORE_USE_DOUBLE"));
    }
}
