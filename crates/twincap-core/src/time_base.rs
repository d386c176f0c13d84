//! Rational time bases and exact timestamp rescaling.
//!
//! A [`TimeBase`] is the duration of one timestamp tick, in seconds, as a
//! rational `num/den`.  [`rescale`] converts a tick count between two time
//! bases with a single rounding step, so offsets and packet timestamps never
//! accumulate bias.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Validated time base: both components strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    num: i32,
    den: i32,
}

impl TimeBase {
    /// One tick per microsecond, the unit of absolute-time anchors.
    pub const MICROSECONDS: TimeBase = TimeBase {
        num: 1,
        den: 1_000_000,
    };

    /// 90 kHz, the RTP video clock.
    pub const RTP_VIDEO: TimeBase = TimeBase { num: 1, den: 90_000 };

    /// Build a time base, rejecting zero or negative components.
    pub fn new(num: i32, den: i32) -> Result<Self> {
        if num <= 0 || den <= 0 {
            return Err(EngineError::InvalidTimeBase {
                num: num.into(),
                den: den.into(),
            });
        }
        Ok(Self { num, den })
    }

    pub fn num(&self) -> i32 {
        self.num
    }

    pub fn den(&self) -> i32 {
        self.den
    }
}

impl Display for TimeBase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for TimeBase {
    type Err = EngineError;

    /// Parses `"num/den"`, e.g. `"1/90000"`.
    fn from_str(s: &str) -> Result<Self> {
        let (num, den) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| EngineError::Config(format!("time base '{s}' is not NUM/DEN")))?;
        let num = num
            .trim()
            .parse::<i32>()
            .map_err(|e| EngineError::Config(format!("time base numerator '{num}': {e}")))?;
        let den = den
            .trim()
            .parse::<i32>()
            .map_err(|e| EngineError::Config(format!("time base denominator '{den}': {e}")))?;
        Self::new(num, den)
    }
}

/// Unvalidated rational, used for frame rates.  `0/x` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const UNKNOWN: Rational = Rational { num: 0, den: 1 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_known(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl Display for Rational {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale `value` ticks of `from` into ticks of `to`.
///
/// Computes `value * from.num * to.den / (from.den * to.num)` in 128-bit
/// arithmetic, rounds to the nearest tick with ties away from zero, and
/// saturates at the `i64` bounds.
pub fn rescale(value: i64, from: TimeBase, to: TimeBase) -> i64 {
    if from == to {
        return value;
    }
    let b = i128::from(from.num) * i128::from(to.den);
    let c = i128::from(from.den) * i128::from(to.num);
    let n = i128::from(value) * b;
    let half = c / 2;
    let q = if n >= 0 {
        (n + half) / c
    } else {
        -((-n + half) / c)
    };
    i64::try_from(q).unwrap_or(if q > 0 { i64::MAX } else { i64::MIN })
}
