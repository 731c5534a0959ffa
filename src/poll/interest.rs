//! Readiness interest flags.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use crate::core::{SrtError, SrtResult};

/// Set of readiness conditions.
///
/// Used both as the interest registered with a [`PollSet`](super::PollSet)
/// and as the readiness a socket currently reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No conditions.
    pub const NONE: Self = Self(0);
    /// Data (or a pending connection, or end of stream) can be read.
    pub const READABLE: Self = Self(0x01);
    /// Data can be written without blocking.
    pub const WRITABLE: Self = Self(0x04);
    /// The connection is broken.
    pub const ERROR: Self = Self(0x08);
    /// Every condition.
    pub const ALL: Self = Self(0x01 | 0x04 | 0x08);

    /// Parse a list of tokens (`in`, `out`, `err` and their aliases).
    pub fn from_tokens<I, S>(tokens: I) -> SrtResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tokens
            .into_iter()
            .try_fold(Self::NONE, |acc, token| Ok(acc | token.as_ref().parse()?))
    }

    /// Raw bit value.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether no condition is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every condition of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether READABLE is set.
    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// Whether WRITABLE is set.
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Whether ERROR is set.
    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl FromStr for Interest {
    type Err = SrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" | "read" => Ok(Self::READABLE),
            "out" | "write" => Ok(Self::WRITABLE),
            "err" | "error" => Ok(Self::ERROR),
            other => Err(SrtError::InvalidArgument(format!(
                "unknown poll interest {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::READABLE, "in"),
            (Self::WRITABLE, "out"),
            (Self::ERROR, "err"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        f.write_str(&names.join("|"))
    }
}
