use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use color_eyre::eyre::ensure;

/// A `u32` given in hex, with or without a `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexArg(pub u32);

impl FromStr for HexArg {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        ensure!(!digits.is_empty(), "no hex digits in {s:?}");
        Ok(Self(u32::from_str_radix(digits, 16)?))
    }
}

impl Display for HexArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}
