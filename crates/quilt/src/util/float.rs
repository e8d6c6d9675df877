use std::fmt::{self, Debug, Display};
use std::ops::Neg;

/// An `f64` stored as its bit pattern so literal doubles can participate in
/// `Eq`/`Hash` inside lattice values and bytecode immediates.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct F64(u64);

impl F64 {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn is_nan(self) -> bool {
        self.to_f64().is_nan()
    }
}

impl From<f64> for F64 {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<F64> for f64 {
    fn from(value: F64) -> Self {
        value.to_f64()
    }
}

impl Neg for F64 {
    type Output = Self;

    fn neg(self) -> Self {
        (-self.to_f64()).into()
    }
}

impl Debug for F64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_f64())
    }
}

impl Display for F64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}
