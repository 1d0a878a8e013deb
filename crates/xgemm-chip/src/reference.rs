// SPDX-License-Identifier: AGPL-3.0-only

//! CPU reference GEMM.
//!
//! Used to check device output, never on the hot path.

use crate::fixed::QFormat;

/// `C += A·B` on raw integers, accumulating in `i32`.
///
/// Operands in Q*n* yield a Q2*n* accumulator, which is what the block core
/// writes to its C buffers. Row-major, leading dimensions in elements.
///
/// # Panics
///
/// Panics if a slice is shorter than its dimensions and stride require.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::many_single_char_names)]
pub fn gemm_acc(
    m: usize,
    n: usize,
    k: usize,
    a: &[i16],
    lda: usize,
    b: &[i16],
    ldb: usize,
    c: &mut [i32],
    ldc: usize,
) {
    for i in 0..m {
        for p in 0..k {
            let a_ip = i32::from(a[i * lda + p]);
            for j in 0..n {
                c[i * ldc + j] = c[i * ldc + j].wrapping_add(a_ip * i32::from(b[p * ldb + j]));
            }
        }
    }
}

/// Operand shifts for [`gemm_nn_fx`].
///
/// The 32-bit cores keep every product inside `i32` by shifting operands
/// right before multiplying. For Q17 this is `alpha >> 14`, `A >> 3`,
/// then `A_PART >> 3`, `B >> 5` and the remaining 9 bits after the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreShift {
    /// Shift on alpha in `alpha·A`; A takes `scale_bits - alpha`.
    pub alpha: u32,
    /// Shift on `alpha·A` in the product with B.
    pub a_part: u32,
    /// Shift on B.
    pub b: u32,
}

impl PreShift {
    /// Split used by the cores for `q`.
    #[must_use]
    pub const fn for_format(q: QFormat) -> Self {
        let bits = q.scale_bits();
        let a_part = if bits < 3 { bits } else { 3 };
        let b = if bits - a_part < 5 { bits - a_part } else { 5 };
        Self {
            alpha: bits - a_part,
            a_part,
            b,
        }
    }
}

/// `C += alpha·A·B` with every operand in the same Q-format, in the cores'
/// pre-shifted arithmetic (see [`PreShift`]).
///
/// # Panics
///
/// Panics if a slice is shorter than its dimensions and stride require.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::many_single_char_names)]
pub fn gemm_nn_fx(
    q: QFormat,
    m: usize,
    n: usize,
    k: usize,
    alpha: i32,
    a: &[i32],
    lda: usize,
    b: &[i32],
    ldb: usize,
    c: &mut [i32],
    ldc: usize,
) {
    let shift = PreShift::for_format(q);
    for i in 0..m {
        for p in 0..k {
            let a_part = q.mul_split(alpha, shift.alpha, a[i * lda + p]);
            for j in 0..n {
                let prod = q.mul_shifted(a_part, shift.a_part, b[p * ldb + j], shift.b);
                c[i * ldc + j] = c[i * ldc + j].wrapping_add(prod);
            }
        }
    }
}

/// [`gemm_nn_fx`] with full-precision products.
///
/// # Panics
///
/// Panics if a slice is shorter than its dimensions and stride require.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::many_single_char_names)]
pub fn gemm_nn_fx_exact(
    q: QFormat,
    m: usize,
    n: usize,
    k: usize,
    alpha: i32,
    a: &[i32],
    lda: usize,
    b: &[i32],
    ldb: usize,
    c: &mut [i32],
    ldc: usize,
) {
    for i in 0..m {
        for p in 0..k {
            let a_part = q.mul(alpha, a[i * lda + p]);
            for j in 0..n {
                c[i * ldc + j] = c[i * ldc + j].wrapping_add(q.mul(a_part, b[p * ldb + j]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_times_b_is_b() {
        let one: i16 = QFormat::Q9.encode(1.0);
        let a = [one, 0, 0, one];
        let b = [3, -4, 5, 6];
        let mut c = [0i32; 4];
        gemm_acc(2, 2, 2, &a, 2, &b, 2, &mut c, 2);
        let expected: Vec<i32> = b.iter().map(|&x| i32::from(x) << 9).collect();
        assert_eq!(c.to_vec(), expected);
    }

    #[test]
    fn accumulates_into_existing_c() {
        let a = [1i16, 2];
        let b = [3i16, 4];
        let mut c = [10i32];
        gemm_acc(1, 1, 2, &a, 2, &b, 1, &mut c, 1);
        assert_eq!(c[0], 10 + 3 + 8);
    }

    #[test]
    fn fixed_gemm_scales_by_alpha() {
        let q = QFormat::Q17;
        let enc = |v: f32| -> i32 { q.encode(v) };
        let a = [enc(1.0), enc(2.0)];
        let b = [enc(0.5), enc(0.25)];
        let mut c = [0i32];
        gemm_nn_fx(q, 1, 1, 2, enc(2.0), &a, 2, &b, 1, &mut c, 1);
        assert_eq!(q.decode(c[0]), 2.0);
    }

    #[test]
    fn q17_split_matches_the_cores() {
        assert_eq!(
            PreShift::for_format(QFormat::Q17),
            PreShift { alpha: 14, a_part: 3, b: 5 }
        );
        assert_eq!(
            PreShift::for_format(QFormat::Q9),
            PreShift { alpha: 6, a_part: 3, b: 5 }
        );
        assert_eq!(
            PreShift::for_format(QFormat::new(2)),
            PreShift { alpha: 0, a_part: 2, b: 0 }
        );
    }

    #[test]
    fn pre_shift_truncates_low_bits() {
        let q = QFormat::Q17;
        let one: i32 = q.encode(1.0);
        let (a, b) = ([100_007], [70_001]);

        // alpha·A = 8 * (100_007 >> 3) = 100_000; (100_000 >> 3) * (70_001 >> 5) >> 9
        let mut shifted = [0i32];
        gemm_nn_fx(q, 1, 1, 1, one, &a, 1, &b, 1, &mut shifted, 1);
        assert_eq!(shifted[0], 53_393);

        let mut exact = [0i32];
        gemm_nn_fx_exact(q, 1, 1, 1, one, &a, 1, &b, 1, &mut exact, 1);
        assert_eq!(exact[0], 53_410);
    }
}
