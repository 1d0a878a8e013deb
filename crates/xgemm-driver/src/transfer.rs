// SPDX-License-Identifier: AGPL-3.0-only

//! Operand transfer into and out of placements
//!
//! A split placement is copied as two runs, in window order, by element
//! offset. Zero-length runs are skipped. The float-facing variants pass
//! each element through the configured Q-format on the way in and out.

use crate::error::{Result, XgemmError};
use crate::mmio::{Element, RegionSet};
use crate::placement::Placement;
use xgemm_chip::fixed::{Fixed, QFormat};

/// Copy `src` into `placement`
///
/// # Errors
///
/// Returns an error if `src` length differs from the placement, a window is
/// not mapped, or verification fails.
pub fn write_operand<T: Element>(
    regions: &mut RegionSet,
    placement: &Placement,
    src: &[T],
    verify: bool,
) -> Result<()> {
    check_len(placement, src.len())?;
    let mut consumed = 0;
    for segment in placement.segments() {
        let region = regions.require_mut(segment.window)?;
        region.write_slice(segment.offset, &src[consumed..consumed + segment.len], verify)?;
        consumed += segment.len;
    }
    Ok(())
}

/// Copy `placement` out into `dst`
///
/// # Errors
///
/// Returns an error if `dst` length differs from the placement or a window is
/// not mapped.
pub fn read_operand<T: Element>(regions: &RegionSet, placement: &Placement, dst: &mut [T]) -> Result<()> {
    check_len(placement, dst.len())?;
    let mut filled = 0;
    for segment in placement.segments() {
        let region = regions.require(segment.window)?;
        region.read_slice(segment.offset, &mut dst[filled..filled + segment.len]);
        filled += segment.len;
    }
    Ok(())
}

/// Encode `src` through `q` and copy it into `placement`
///
/// # Errors
///
/// As [`write_operand`].
pub fn write_encoded<T: Element + Fixed>(
    regions: &mut RegionSet,
    placement: &Placement,
    src: &[f32],
    q: QFormat,
    verify: bool,
) -> Result<()> {
    let encoded: Vec<T> = src.iter().map(|&v| q.encode(v)).collect();
    write_operand(regions, placement, &encoded, verify)
}

/// Copy `placement` out and decode it through `q` into `dst`
///
/// # Errors
///
/// As [`read_operand`].
pub fn read_decoded<T: Element + Fixed>(
    regions: &RegionSet,
    placement: &Placement,
    dst: &mut [f32],
    q: QFormat,
) -> Result<()> {
    let mut raw = vec![T::zeroed(); dst.len()];
    read_operand(regions, placement, &mut raw)?;
    for (out, value) in dst.iter_mut().zip(raw) {
        *out = q.decode(value);
    }
    Ok(())
}

fn check_len(placement: &Placement, len: usize) -> Result<()> {
    if len == placement.count() {
        Ok(())
    } else {
        Err(XgemmError::invalid_dimensions(format!(
            "buffer holds {len} elements, placement holds {}",
            placement.count()
        )))
    }
}
