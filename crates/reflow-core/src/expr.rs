//! Branch conditions and the small value expressions lowering consumes.
//!
//! Control-flow recovery treats conditions as an opaque boolean
//! abstraction: a condition code, optional operand renderings, and the
//! address of the instruction that produced the flags. Full expression
//! recovery lives outside this crate.

/// Condition codes tested by conditional branches and predicated
/// instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    Equal,
    NotEqual,
    /// Unsigned greater-than.
    Above,
    /// Unsigned greater-or-equal.
    AboveOrEqual,
    /// Unsigned less-than.
    Below,
    /// Unsigned less-or-equal.
    BelowOrEqual,
    /// Signed greater-than.
    Greater,
    /// Signed greater-or-equal.
    GreaterOrEqual,
    /// Signed less-than.
    Less,
    /// Signed less-or-equal.
    LessOrEqual,
    /// Negative result.
    Sign,
    /// Non-negative result.
    NotSign,
    Overflow,
    NotOverflow,
    /// A condition that always holds, e.g. the base predicate of an
    /// unconditionally executed predicated instruction.
    Always,
    /// A condition that never holds.
    Never,
}

impl Condition {
    /// Returns the logically opposite condition.
    pub fn inverse(self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::Above => Self::BelowOrEqual,
            Self::AboveOrEqual => Self::Below,
            Self::Below => Self::AboveOrEqual,
            Self::BelowOrEqual => Self::Above,
            Self::Greater => Self::LessOrEqual,
            Self::GreaterOrEqual => Self::Less,
            Self::Less => Self::GreaterOrEqual,
            Self::LessOrEqual => Self::Greater,
            Self::Sign => Self::NotSign,
            Self::NotSign => Self::Sign,
            Self::Overflow => Self::NotOverflow,
            Self::NotOverflow => Self::Overflow,
            Self::Always => Self::Never,
            Self::Never => Self::Always,
        }
    }

    /// C-style operator rendering, where one exists.
    pub fn operator_str(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Above | Self::Greater => ">",
            Self::AboveOrEqual | Self::GreaterOrEqual => ">=",
            Self::Below | Self::Less => "<",
            Self::BelowOrEqual | Self::LessOrEqual => "<=",
            Self::Sign => "< 0",
            Self::NotSign => ">= 0",
            Self::Overflow => "overflow",
            Self::NotOverflow => "!overflow",
            Self::Always => "true",
            Self::Never => "false",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.operator_str())
    }
}

/// A small value expression: enough for case labels, operands and return
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr {
    /// Integer constant.
    Const(i64),
    /// Named register or recovered variable.
    Reg(String),
}

impl Expr {
    pub fn reg(name: impl Into<String>) -> Self {
        Self::Reg(name.into())
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const(v) => write!(f, "{}", v),
            Self::Reg(name) => write!(f, "{}", name),
        }
    }
}

/// A branch condition with operand renderings and provenance.
///
/// `addr` is the address of the instruction the condition was read from;
/// for predicated instructions it is the address of the flag setter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CondExpr {
    /// Condition code.
    pub cond: Condition,
    /// Left operand, if recovered.
    pub lhs: Option<Expr>,
    /// Right operand, if recovered.
    pub rhs: Option<Expr>,
    /// Provenance address.
    pub addr: u64,
}

impl CondExpr {
    /// A bare condition code without operands.
    pub fn new(cond: Condition, addr: u64) -> Self {
        Self {
            cond,
            lhs: None,
            rhs: None,
            addr,
        }
    }

    /// A comparison with both operands recovered.
    pub fn compare(cond: Condition, lhs: Expr, rhs: Expr, addr: u64) -> Self {
        Self {
            cond,
            lhs: Some(lhs),
            rhs: Some(rhs),
            addr,
        }
    }

    /// The condition that always holds.
    pub fn always(addr: u64) -> Self {
        Self::new(Condition::Always, addr)
    }

    /// Same operands, opposite condition.
    pub fn reversed(&self) -> Self {
        Self {
            cond: self.cond.inverse(),
            lhs: self.lhs.clone(),
            rhs: self.rhs.clone(),
            addr: self.addr,
        }
    }

    /// True if the condition is statically known to hold.
    pub fn is_always_true(&self) -> bool {
        self.cond == Condition::Always
    }

    /// True if the condition is statically known not to hold.
    pub fn is_always_false(&self) -> bool {
        self.cond == Condition::Never
    }
}

impl std::fmt::Display for CondExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.lhs, &self.rhs) {
            (Some(lhs), Some(rhs)) => write!(f, "{} {} {}", lhs, self.cond, rhs),
            _ => write!(f, "{}", self.cond),
        }
    }
}
