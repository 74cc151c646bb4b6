//! Stable opcode enumeration shared with the client.

/// An elementary arithmetic operation in the dataflow graph.
///
/// The discriminants are part of the external wire contract: a client
/// supplies them as plain integers (see `TryFrom<u32>`), so reordering or
/// renumbering variants is a breaking change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    None = 0,
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
    Neg = 5,
    IndicatorEq = 6,
    IndicatorGt = 7,
    IndicatorGeq = 8,
    Min = 9,
    Max = 10,
    Abs = 11,
    Exp = 12,
    Sqrt = 13,
    Log = 14,
    Pow = 15,
}

impl Opcode {
    /// Number of argument variable ids this opcode expects.
    pub fn arity(self) -> usize {
        match self {
            Opcode::None => 0,
            Opcode::Neg | Opcode::Abs | Opcode::Exp | Opcode::Sqrt | Opcode::Log => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::IndicatorEq
            | Opcode::IndicatorGt
            | Opcode::IndicatorGeq
            | Opcode::Min
            | Opcode::Max
            | Opcode::Pow => 2,
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(Opcode::None),
            1 => Ok(Opcode::Add),
            2 => Ok(Opcode::Sub),
            3 => Ok(Opcode::Mul),
            4 => Ok(Opcode::Div),
            5 => Ok(Opcode::Neg),
            6 => Ok(Opcode::IndicatorEq),
            7 => Ok(Opcode::IndicatorGt),
            8 => Ok(Opcode::IndicatorGeq),
            9 => Ok(Opcode::Min),
            10 => Ok(Opcode::Max),
            11 => Ok(Opcode::Abs),
            12 => Ok(Opcode::Exp),
            13 => Ok(Opcode::Sqrt),
            14 => Ok(Opcode::Log),
            15 => Ok(Opcode::Pow),
            other => Err(other),
        }
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op as u32
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::None => "None",
            Opcode::Add => "Add",
            Opcode::Sub => "Sub",
            Opcode::Mul => "Mul",
            Opcode::Div => "Div",
            Opcode::Neg => "Neg",
            Opcode::IndicatorEq => "IndicatorEq",
            Opcode::IndicatorGt => "IndicatorGt",
            Opcode::IndicatorGeq => "IndicatorGeq",
            Opcode::Min => "Min",
            Opcode::Max => "Max",
            Opcode::Abs => "Abs",
            Opcode::Exp => "Exp",
            Opcode::Sqrt => "Sqrt",
            Opcode::Log => "Log",
            Opcode::Pow => "Pow",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u32() {
        for raw in 0u32..=15 {
            let op = Opcode::try_from(raw).unwrap();
            assert_eq!(u32::from(op), raw);
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(Opcode::try_from(16), Err(16));
        assert_eq!(Opcode::try_from(u32::MAX), Err(u32::MAX));
    }

    #[test]
    fn arities_match_binary_vs_unary_ops() {
        assert_eq!(Opcode::Add.arity(), 2);
        assert_eq!(Opcode::Neg.arity(), 1);
        assert_eq!(Opcode::Pow.arity(), 2);
        assert_eq!(Opcode::Sqrt.arity(), 1);
        assert_eq!(Opcode::None.arity(), 0);
    }
}
