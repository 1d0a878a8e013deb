// SPDX-License-Identifier: AGPL-3.0-only

//! Q-format fixed point, the accelerator's native element encoding.
//!
//! A real value `x` is stored as the integer `trunc(x * 2^scale_bits)`.
//! The 16-bit bitstreams use Q9 operands with 32-bit accumulators; the
//! 32-bit builds use Q17 throughout.

/// Integer types usable as fixed-point storage.
pub trait Fixed: Copy {
    /// Storage width in bits.
    const BITS: u32;

    /// Truncate toward zero, saturating at the type bounds.
    fn from_scaled(value: f64) -> Self;

    /// Exact widening to `f64`.
    fn to_f64(self) -> f64;
}

impl Fixed for i16 {
    const BITS: u32 = 16;

    #[allow(clippy::cast_possible_truncation)]
    fn from_scaled(value: f64) -> Self {
        value as Self
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Fixed for i32 {
    const BITS: u32 = 32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_scaled(value: f64) -> Self {
        value as Self
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

/// Scale shared by both conversion directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QFormat {
    scale_bits: u32,
}

impl Default for QFormat {
    fn default() -> Self {
        Self::Q9
    }
}

impl QFormat {
    /// 16-bit operands.
    pub const Q9: Self = Self { scale_bits: 9 };
    /// 32-bit operands.
    pub const Q17: Self = Self { scale_bits: 17 };

    /// Format with `scale_bits` fractional bits.
    ///
    /// # Panics
    ///
    /// Panics if `scale_bits >= 31`.
    #[must_use]
    pub const fn new(scale_bits: u32) -> Self {
        assert!(scale_bits < 31, "scale_bits must leave an integer bit");
        Self { scale_bits }
    }

    /// Fractional bits.
    #[must_use]
    pub const fn scale_bits(&self) -> u32 {
        self.scale_bits
    }

    /// `2^scale_bits`.
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn scale(&self) -> f64 {
        2f64.powi(self.scale_bits as i32)
    }

    /// Value of one unit in the last place.
    #[must_use]
    pub fn ulp(&self) -> f64 {
        1.0 / self.scale()
    }

    /// Encode a float: scale by `2^scale_bits`, truncate.
    #[must_use]
    pub fn encode<T: Fixed>(&self, value: f32) -> T {
        self.encode_f64(f64::from(value))
    }

    /// Encode an `f64`.
    #[must_use]
    pub fn encode_f64<T: Fixed>(&self, value: f64) -> T {
        T::from_scaled(value * self.scale())
    }

    /// Decode to `f32`.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn decode<T: Fixed>(&self, raw: T) -> f32 {
        self.decode_f64(raw) as f32
    }

    /// Decode to `f64`. Exact for every `i16` and `i32` value.
    #[must_use]
    pub fn decode_f64<T: Fixed>(&self, raw: T) -> f64 {
        raw.to_f64() / self.scale()
    }

    /// Fixed-point product of two values in this format.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn mul(&self, a: i32, b: i32) -> i32 {
        ((a as i64 * b as i64) >> self.scale_bits) as i32
    }

    /// `a·b` with `a` shifted right by `ashf` and `b` by the remaining
    /// `scale_bits - ashf` before the multiply, as the 32-bit cores do to
    /// stay inside `i32`. Low bits are dropped, not rounded.
    ///
    /// # Panics
    ///
    /// Panics if `ashf > scale_bits`.
    #[must_use]
    pub const fn mul_split(&self, a: i32, ashf: u32, b: i32) -> i32 {
        (a >> ashf).wrapping_mul(b >> (self.scale_bits - ashf))
    }

    /// `a·b` with both operands pre-shifted by `ashf` and `bshf`; the
    /// rest of the scale is shifted out of the product.
    ///
    /// # Panics
    ///
    /// Panics if `ashf + bshf > scale_bits`.
    #[must_use]
    pub const fn mul_shifted(&self, a: i32, ashf: u32, b: i32, bshf: u32) -> i32 {
        (a >> ashf).wrapping_mul(b >> bshf) >> (self.scale_bits - ashf - bshf)
    }

    /// Product of two `self` values carried in the accumulator format.
    ///
    /// Q9 × Q9 operands produce a Q18 accumulator. `None` when the doubled
    /// scale leaves no integer bit in an `i32` accumulator.
    #[must_use]
    pub const fn accumulator(&self) -> Option<Self> {
        let scale_bits = self.scale_bits * 2;
        if scale_bits < 31 {
            Some(Self { scale_bits })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_round_trip_is_exact() {
        let q = QFormat::Q9;
        for raw in i16::MIN..=i16::MAX {
            let back: i16 = q.encode(q.decode(raw));
            assert_eq!(back, raw);
        }
    }

    #[test]
    fn i32_round_trip_is_exact_through_f64() {
        let q = QFormat::Q17;
        for raw in [i32::MIN, -1_000_000_007, -1, 0, 1, 131_072, 999_999_937, i32::MAX] {
            let back: i32 = q.encode_f64(q.decode_f64(raw));
            assert_eq!(back, raw);
        }
    }

    #[test]
    fn decode_of_encode_within_one_ulp() {
        let q = QFormat::Q9;
        let mut f = -60.0f32;
        while f < 60.0 {
            let raw: i16 = q.encode(f);
            let err = (f64::from(q.decode(raw)) - f64::from(f)).abs();
            assert!(err < q.ulp(), "{f} -> {raw} off by {err}");
            f += 0.013;
        }
    }

    #[test]
    fn encode_truncates_toward_zero() {
        let q = QFormat::Q9;
        assert_eq!(q.encode::<i16>(1.0), 512);
        assert_eq!(q.encode::<i16>(0.0019), 0);
        assert_eq!(q.encode::<i16>(-0.0019), 0);
        assert_eq!(q.encode::<i16>(-1.5), -768);
    }

    #[test]
    fn encode_saturates_out_of_range() {
        let q = QFormat::Q9;
        assert_eq!(q.encode::<i16>(1.0e6), i16::MAX);
        assert_eq!(q.encode::<i16>(-1.0e6), i16::MIN);
    }

    #[test]
    fn fixed_multiply() {
        let q = QFormat::Q17;
        let two: i32 = q.encode(2.0);
        let half: i32 = q.encode(0.5);
        assert_eq!(q.decode(q.mul(two, half)), 1.0);
    }

    #[test]
    fn accumulator_doubles_scale_while_it_fits() {
        assert_eq!(QFormat::Q9.accumulator(), Some(QFormat::new(18)));
        assert_eq!(QFormat::new(15).accumulator(), Some(QFormat::new(30)));
        assert_eq!(QFormat::new(16).accumulator(), None);
        assert_eq!(QFormat::Q17.accumulator(), None);
    }

    #[test]
    fn wide_scales_do_not_overflow() {
        assert_eq!(QFormat::new(30).scale(), f64::from(1u32 << 30));
        assert_eq!(QFormat::new(30).decode_f64(1i32 << 30), 1.0);
    }

    #[test]
    fn split_multiply_drops_low_bits() {
        let q = QFormat::Q17;
        let one: i32 = q.encode(1.0);
        // 100_007 >> 3 loses the low 7
        assert_eq!(q.mul_split(one, 14, 100_007), 100_000);
        assert_eq!(q.mul_shifted(100_000, 3, 70_001, 5), 53_393);
        assert_eq!(q.mul(100_007, 70_001), 53_410);
    }
}
