//! Pure opcode-to-source-line translation.
//!
//! Nothing in this module touches a device. `resolve_arg` turns a variable
//! reference into a source expression; `emit_rhs` turns an opcode and its
//! (already resolved) argument expressions into a right-hand side. Both are
//! ordinary total/partial functions over strings, which is what lets the
//! bulk of the emitter's test coverage run without an OpenCL runtime.

use crate::ids::VarId;
use crate::opcode::Opcode;
use thiserror::Error;

/// How a variable id resolves to a source expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgRef {
    /// A scalar input, stored at a single slot in the input buffer.
    InputScalar { offset: usize },
    /// A vector input, stored at `n` consecutive slots in the input buffer.
    InputVector { offset: usize },
    /// A variate, the `relative_idx`-th one requested this calculation.
    Variate { relative_idx: usize },
    /// A previously computed intermediate.
    Intermediate { id: VarId },
}

/// Resolve a variable reference to the source expression read at work item `i`.
///
/// Buffer parameter names are the reserved `ore_`-prefixed identifiers (see
/// the kernel-source reserved-identifier contract); these never collide with
/// opcode-produced `v<id>` intermediates because no opcode stream can itself
/// introduce an identifier — the emitter only ever synthesises `v<id>`.
pub fn resolve_arg(arg: ArgRef) -> String {
    match arg {
        ArgRef::InputScalar { offset } => format!("ore_input[{offset}]"),
        ArgRef::InputVector { offset } => format!("ore_input[{offset} + i]"),
        ArgRef::Variate { relative_idx } => format!("ore_rn[{relative_idx} * n + i]"),
        ArgRef::Intermediate { id } => id.to_string(),
    }
}

/// Failure while assembling a single-assignment right-hand side.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("opcode {opcode} expects {expected} argument(s), got {got}")]
    ArgCount {
        opcode: Opcode,
        expected: usize,
        got: usize,
    },
}

/// Build the right-hand side of an SSA assignment for `opcode` given its
/// already-resolved argument expressions.
///
/// `args` must have exactly `opcode.arity()` elements; anything else is an
/// `EmitError::ArgCount`.
pub fn emit_rhs(opcode: Opcode, args: &[String]) -> Result<String, EmitError> {
    let expected = opcode.arity();
    if args.len() != expected {
        return Err(EmitError::ArgCount {
            opcode,
            expected,
            got: args.len(),
        });
    }

    let rhs = match opcode {
        Opcode::None => String::new(),
        Opcode::Add => format!("{} + {}", args[0], args[1]),
        Opcode::Sub => format!("{} - {}", args[0], args[1]),
        Opcode::Mul => format!("{} * {}", args[0], args[1]),
        Opcode::Div => format!("{} / {}", args[0], args[1]),
        Opcode::Neg => format!("-{}", args[0]),
        Opcode::IndicatorEq => format!("ore_indicatorEq({}, {})", args[0], args[1]),
        Opcode::IndicatorGt => format!("ore_indicatorGt({}, {})", args[0], args[1]),
        Opcode::IndicatorGeq => format!("ore_indicatorGeq({}, {})", args[0], args[1]),
        Opcode::Min => format!("fmin({}, {})", args[0], args[1]),
        Opcode::Max => format!("fmax({}, {})", args[0], args[1]),
        Opcode::Abs => format!("fabs({})", args[0]),
        Opcode::Exp => format!("exp({})", args[0]),
        Opcode::Sqrt => format!("sqrt({})", args[0]),
        Opcode::Log => format!("log({})", args[0]),
        Opcode::Pow => format!("pow({}, {})", args[0], args[1]),
    };

    Ok(rhs)
}

/// Assemble a full SSA line: `[<T> ]v<result_id> = <rhs>;`.
///
/// The leading type declaration is omitted when `result_id` was recycled
/// from the free list, since it was already declared on first use.
pub fn emit_ssa_line(
    float_type: &str,
    result_id: VarId,
    rhs: &str,
    is_redeclaration: bool,
) -> String {
    if is_redeclaration {
        format!("{result_id} = {rhs};")
    } else {
        format!("{float_type} {result_id} = {rhs};")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_input_scalar_without_index() {
        assert_eq!(resolve_arg(ArgRef::InputScalar { offset: 3 }), "ore_input[3]");
    }

    #[test]
    fn resolves_input_vector_with_work_item_index() {
        assert_eq!(
            resolve_arg(ArgRef::InputVector { offset: 5 }),
            "ore_input[5 + i]"
        );
    }

    #[test]
    fn resolves_variate_by_relative_slot() {
        assert_eq!(
            resolve_arg(ArgRef::Variate { relative_idx: 2 }),
            "ore_rn[2 * n + i]"
        );
    }

    #[test]
    fn resolves_intermediate_by_v_prefixed_name() {
        assert_eq!(
            resolve_arg(ArgRef::Intermediate { id: VarId(9) }),
            "v9"
        );
    }

    #[test]
    fn binary_ops_emit_infix_expressions() {
        let a = "v1".to_string();
        let b = "v2".to_string();
        assert_eq!(emit_rhs(Opcode::Add, &[a.clone(), b.clone()]).unwrap(), "v1 + v2");
        assert_eq!(emit_rhs(Opcode::Sub, &[a.clone(), b.clone()]).unwrap(), "v1 - v2");
        assert_eq!(emit_rhs(Opcode::Mul, &[a.clone(), b.clone()]).unwrap(), "v1 * v2");
        assert_eq!(emit_rhs(Opcode::Div, &[a.clone(), b.clone()]).unwrap(), "v1 / v2");
        assert_eq!(emit_rhs(Opcode::Pow, &[a, b]).unwrap(), "pow(v1, v2)");
    }

    #[test]
    fn unary_ops_emit_prefix_or_call_expressions() {
        let a = "v1".to_string();
        assert_eq!(emit_rhs(Opcode::Neg, &[a.clone()]).unwrap(), "-v1");
        assert_eq!(emit_rhs(Opcode::Abs, &[a.clone()]).unwrap(), "fabs(v1)");
        assert_eq!(emit_rhs(Opcode::Exp, &[a.clone()]).unwrap(), "exp(v1)");
        assert_eq!(emit_rhs(Opcode::Sqrt, &[a.clone()]).unwrap(), "sqrt(v1)");
        assert_eq!(emit_rhs(Opcode::Log, &[a]).unwrap(), "log(v1)");
    }

    #[test]
    fn indicator_ops_call_reserved_helpers() {
        let a = "v1".to_string();
        let b = "v2".to_string();
        assert_eq!(
            emit_rhs(Opcode::IndicatorEq, &[a.clone(), b.clone()]).unwrap(),
            "ore_indicatorEq(v1, v2)"
        );
        assert_eq!(
            emit_rhs(Opcode::IndicatorGt, &[a.clone(), b.clone()]).unwrap(),
            "ore_indicatorGt(v1, v2)"
        );
        assert_eq!(
            emit_rhs(Opcode::IndicatorGeq, &[a, b]).unwrap(),
            "ore_indicatorGeq(v1, v2)"
        );
    }

    #[test]
    fn wrong_arg_count_is_rejected() {
        let err = emit_rhs(Opcode::Add, &["v1".to_string()]).unwrap_err();
        assert_eq!(
            err,
            EmitError::ArgCount {
                opcode: Opcode::Add,
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn ssa_line_declares_type_only_on_first_use() {
        let line = emit_ssa_line("float", VarId(3), "v1 + v2", false);
        assert_eq!(line, "float v3 = v1 + v2;");

        let redecl = emit_ssa_line("float", VarId(3), "v1 - v2", true);
        assert_eq!(redecl, "v3 = v1 - v2;");
    }

    /// For every opcode, `emit_rhs` must accept exactly `arity()` arguments
    /// and reject every other count, across a spread of randomly generated
    /// argument lists.
    #[test]
    fn emit_rhs_accepts_only_the_exact_arity_for_any_opcode() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let all_opcodes = [
            Opcode::None,
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::Div,
            Opcode::Neg,
            Opcode::IndicatorEq,
            Opcode::IndicatorGt,
            Opcode::IndicatorGeq,
            Opcode::Min,
            Opcode::Max,
            Opcode::Abs,
            Opcode::Exp,
            Opcode::Sqrt,
            Opcode::Log,
            Opcode::Pow,
        ];

        for _ in 0..200 {
            let opcode = all_opcodes[rng.gen_range(0..all_opcodes.len())];
            let got = rng.gen_range(0..=3);
            let args: Vec<String> = (0..got).map(|i| format!("v{i}")).collect();

            let result = emit_rhs(opcode, &args);
            if got == opcode.arity() {
                assert!(result.is_ok(), "{opcode} should accept {got} args");
            } else {
                assert_eq!(
                    result.unwrap_err(),
                    EmitError::ArgCount {
                        opcode,
                        expected: opcode.arity(),
                        got,
                    }
                );
            }
        }
    }
}
