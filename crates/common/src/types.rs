//! Core value types: time bases, resolutions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rational number used for time bases and frame rates
/// (e.g. 1/90000 for MPEG-TS timestamps, 30000/1001 for 29.97fps).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    /// Microsecond time base.
    pub const MICROS: Self = Self {
        num: 1,
        den: 1_000_000,
    };
    /// Default CUVID parser clock (10 MHz).
    pub const CUVID_CLOCK: Self = Self {
        num: 1,
        den: 10_000_000,
    };
    pub const FPS_30: Self = Self { num: 30, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        assert!(den > 0, "Rational denominator must be > 0");
        Self { num, den }
    }

    /// Time base of a clock ticking at `hz`.
    pub fn from_clock_rate(hz: u32) -> Self {
        Self::new(1, hz.max(1))
    }

    /// A zero numerator means "unknown" (containers report 0/1 or 0/0).
    pub fn is_valid(self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Rescale `value` expressed in `self` units into `target` units,
    /// rounding to nearest (halves away from zero).
    pub fn rescale(self, value: i64, target: Rational) -> i64 {
        let numer = value as i128 * self.num as i128 * target.den as i128;
        let denom = self.den as i128 * target.num as i128;
        if denom == 0 {
            return value;
        }
        let half = denom / 2;
        let rounded = if numer >= 0 {
            (numer + half) / denom
        } else {
            (numer - half) / denom
        };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Video resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte size for NV12 pixel data at the given row pitch.
    pub fn nv12_byte_size(self, pitch: u32) -> usize {
        let y_size = pitch as usize * self.height as usize;
        let uv_size = pitch as usize * (self.height as usize / 2);
        y_size + uv_size
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_90khz_to_micros() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(tb.rescale(90_000, Rational::MICROS), 1_000_000);
        assert_eq!(tb.rescale(3003, Rational::MICROS), 33_367);
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        let tb = Rational::new(1, 3);
        // 1/3 s = 333333.33 us
        assert_eq!(tb.rescale(1, Rational::MICROS), 333_333);
        // 2/3 s = 666666.67 us
        assert_eq!(tb.rescale(2, Rational::MICROS), 666_667);
        assert_eq!(tb.rescale(-2, Rational::MICROS), -666_667);
    }

    #[test]
    fn rescale_to_cuvid_clock() {
        let tb = Rational::new(1, 1000);
        assert_eq!(tb.rescale(40, Rational::CUVID_CLOCK), 400_000);
    }

    #[test]
    fn unknown_time_base_is_invalid() {
        assert!(!Rational { num: 0, den: 1 }.is_valid());
        assert!(Rational::new(1, 25).is_valid());
    }

    #[test]
    fn nv12_size_uses_pitch() {
        let res = Resolution::new(1920, 1080);
        assert_eq!(res.nv12_byte_size(2048), 2048 * 1080 + 2048 * 540);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Rational::new(30000, 1001).to_string(), "30000/1001");
        assert_eq!(Rational::FPS_30.to_string(), "30");
        assert_eq!(Resolution::HD.to_string(), "1920x1080");
    }
}
