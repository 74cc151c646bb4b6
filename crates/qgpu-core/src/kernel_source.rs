//! Pure kernel source text assembly.
//!
//! Nothing here talks to a device: given a precision, a kernel name, which
//! buffers are actually used, the accumulated SSA body, and the resolved
//! output expressions, this module produces the final OpenCL C source as a
//! `String`. Compiling that string is the device crate's job.

/// Which buffer parameters a particular calculation's kernel actually needs.
///
/// A calculation with no inputs, no variates, or no declared outputs omits
/// the corresponding parameter from the kernel signature entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelSignature {
    pub has_input: bool,
    pub has_variates: bool,
    pub has_output: bool,
}

/// Maximum number of characters of a compiler build log surfaced in
/// `BuildFailed`. The *head* of the log is kept, not the tail: the first
/// lines carry the file/line and the first error, which is what a caller
/// needs to act on, whereas a tail-biased trim risks showing only a cascade
/// of follow-on errors with the root cause scrolled off.
pub const MAX_BUILD_LOG_CHARS: usize = 4000;

/// Truncate a compiler build log to its first `MAX_BUILD_LOG_CHARS`
/// characters, appending a truncation marker if anything was cut.
pub fn trim_build_log(log: &str) -> String {
    let char_count = log.chars().count();
    if char_count <= MAX_BUILD_LOG_CHARS {
        return log.to_string();
    }
    let head: String = log.chars().take(MAX_BUILD_LOG_CHARS).collect();
    format!("{head}\n... (truncated, {char_count} chars total)")
}

fn float_type_name(use_double_precision: bool) -> &'static str {
    if use_double_precision {
        "double"
    } else {
        "float"
    }
}

fn epsilon_macro(use_double_precision: bool) -> &'static str {
    if use_double_precision {
        "DBL_EPSILON"
    } else {
        "FLT_EPSILON"
    }
}

/// The reserved-identifier helper prelude: `ore_closeEnough` and the three
/// `ore_indicator*` functions, using a tolerance of `42 * epsilon`.
fn helper_prelude(use_double_precision: bool) -> String {
    let t = float_type_name(use_double_precision);
    let eps = epsilon_macro(use_double_precision);
    format!(
        "inline int ore_closeEnough({t} a, {t} b) {{\n\
        \x20   {t} diff = fabs(a - b);\n\
        \x20   {t} scale = fmax(fabs(a), fabs(b));\n\
        \x20   if (scale < {eps}) {{\n\
        \x20       return diff <= 42 * {eps};\n\
        \x20   }}\n\
        \x20   return diff <= 42 * {eps} * scale;\n\
        }}\n\
        \n\
        inline int ore_indicatorEq({t} a, {t} b) {{\n\
        \x20   return ore_closeEnough(a, b) ? 1 : 0;\n\
        }}\n\
        \n\
        inline int ore_indicatorGt({t} a, {t} b) {{\n\
        \x20   return (a > b && !ore_closeEnough(a, b)) ? 1 : 0;\n\
        }}\n\
        \n\
        inline int ore_indicatorGeq({t} a, {t} b) {{\n\
        \x20   return (a > b || ore_closeEnough(a, b)) ? 1 : 0;\n\
        }}\n"
    )
}

/// Assemble the full kernel source for one calculation.
///
/// `ssa_body` is the accumulated, already-indented-free sequence of SSA
/// lines (one operation per line); `output_exprs` is the resolved source
/// expression for each declared output, in declaration order.
pub fn build_kernel_source(
    use_double_precision: bool,
    kernel_name: &str,
    sig: KernelSignature,
    ssa_body: &str,
    output_exprs: &[String],
) -> String {
    let t = float_type_name(use_double_precision);
    let mut src = String::new();

    if use_double_precision {
        src.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n\n");
    }

    src.push_str(&helper_prelude(use_double_precision));
    src.push('\n');

    let mut params = vec!["uint n".to_string()];
    if sig.has_input {
        params.push(format!("__global const {t}* ore_input"));
    }
    if sig.has_variates {
        params.push(format!("__global const {t}* ore_rn"));
    }
    if sig.has_output {
        params.push(format!("__global {t}* ore_output"));
    }

    src.push_str(&format!(
        "__kernel void {kernel_name}({}) {{\n",
        params.join(", ")
    ));
    src.push_str("    int i = get_global_id(0);\n");
    src.push_str("    if (i < n) {\n");

    for line in ssa_body.lines() {
        if line.is_empty() {
            continue;
        }
        src.push_str("        ");
        src.push_str(line);
        src.push('\n');
    }

    for (idx, expr) in output_exprs.iter().enumerate() {
        src.push_str(&format!("        ore_output[{idx} * n + i] = {expr};\n"));
    }

    src.push_str("    }\n");
    src.push_str("}\n");
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_build_log_passes_short_logs_through() {
        let log = "warning: something\nerror: x";
        assert_eq!(trim_build_log(log), log);
    }

    #[test]
    fn trim_build_log_keeps_the_head() {
        let log = "A".repeat(MAX_BUILD_LOG_CHARS) + "TAIL_MARKER_SHOULD_BE_GONE";
        let trimmed = trim_build_log(&log);
        assert!(trimmed.starts_with(&"A".repeat(100)));
        assert!(!trimmed.contains("TAIL_MARKER_SHOULD_BE_GONE"));
        assert!(trimmed.contains("truncated"));
    }

    #[test]
    fn signature_omits_unused_buffers() {
        let src = build_kernel_source(
            false,
            "ore_kernel",
            KernelSignature {
                has_input: false,
                has_variates: false,
                has_output: true,
            },
            "float v0 = 1.0;",
            &["v0".to_string()],
        );
        assert!(src.contains("__kernel void ore_kernel(uint n, __global float* ore_output)"));
        assert!(!src.contains("ore_input"));
        assert!(!src.contains("ore_rn"));
    }

    #[test]
    fn double_precision_adds_fp64_pragma_and_type() {
        let src = build_kernel_source(
            true,
            "ore_kernel",
            KernelSignature {
                has_input: true,
                has_variates: false,
                has_output: true,
            },
            "",
            &[],
        );
        assert!(src.starts_with("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
        assert!(src.contains("__global const double* ore_input"));
        assert!(src.contains("DBL_EPSILON"));
    }

    #[test]
    fn body_and_outputs_are_indented_inside_the_guard() {
        let src = build_kernel_source(
            false,
            "ore_kernel",
            KernelSignature {
                has_input: true,
                has_variates: false,
                has_output: true,
            },
            "float v2 = ore_input[0] + i;",
            &["v2".to_string()],
        );
        assert!(src.contains("if (i < n) {\n        float v2 = ore_input[0] + i;\n        ore_output[0 * n + i] = v2;\n    }"));
    }
}
