// SPDX-License-Identifier: AGPL-3.0-only

//! Operand placement across mapped windows
//!
//! The accelerator's address decoder treats a list of windows as one flat
//! element space: offset 0 is the first element of the first window, and
//! offsets run on into the next window where the previous one ends. An
//! operand written at a base offset either fits in the window containing
//! the base, or fills that window to its end and continues at offset 0 of
//! the following window.
//!
//! ```text
//!            window 0 (W elements)            window 1
//!   |------------------[ n0 elements ]|[ n1 elements ]-----------|
//!   0                base            W 0            n1
//! ```
//!
//! A, B and C are packed back to back, so B's start depends on how many
//! elements A consumed. Placements are always computed in sequence.

use crate::error::{Result, XgemmError};
use xgemm_chip::layout::WindowId;

/// Split an operand of `count` elements at `base` in a window of `capacity` elements
///
/// Returns `(n0, n1)`: elements placed in this window and elements that spill
/// into the next one. A base at or past the end places nothing here.
pub const fn split(capacity: usize, base: usize, count: usize) -> (usize, usize) {
    let room = capacity.saturating_sub(base);
    let n0 = if count < room { count } else { room };
    (n0, count - n0)
}

/// Contiguous run of elements inside one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Window holding the run
    pub window: WindowId,
    /// First element, relative to the window
    pub offset: usize,
    /// Number of elements
    pub len: usize,
}

/// Where one operand lives
///
/// Either wholly inside `head.window`, or split: `head` runs to the end of
/// its window and `tail` starts at offset 0 of the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    start: usize,
    head: Segment,
    tail: Option<Segment>,
}

impl Placement {
    /// Logical start offset in the concatenated space
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the logical end offset
    pub const fn end(&self) -> usize {
        self.start + self.count()
    }

    /// Total elements
    pub const fn count(&self) -> usize {
        self.head.len + self.tail_len()
    }

    /// Elements in the first window (`n0`)
    pub const fn head_len(&self) -> usize {
        self.head.len
    }

    /// Elements spilled into the second window (`n1`)
    pub const fn tail_len(&self) -> usize {
        match self.tail {
            Some(tail) => tail.len,
            None => 0,
        }
    }

    /// Whether the operand spans two windows
    pub const fn is_split(&self) -> bool {
        self.tail.is_some()
    }

    /// First segment, possibly empty when the base sits exactly at a window end
    pub const fn head(&self) -> Segment {
        self.head
    }

    /// Second segment, if split
    pub const fn tail(&self) -> Option<Segment> {
        self.tail
    }

    /// Non-empty segments in window order
    pub fn segments(&self) -> impl Iterator<Item = Segment> {
        std::iter::once(self.head)
            .chain(self.tail)
            .filter(|s| s.len > 0)
    }
}

/// Placements of the three GEMM operands, packed A, B, C
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandLayout {
    /// A operand
    pub a: Placement,
    /// B operand
    pub b: Placement,
    /// C operand / result
    pub c: Placement,
    /// Element width the layout was computed for
    pub elem_bytes: usize,
}

/// Ordered windows forming one flat element space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    windows: Vec<(WindowId, usize)>,
    elem_bytes: usize,
}

impl AddressSpace {
    /// Space over `windows`, each given as `(id, size in bytes)`, for elements of `elem_bytes`
    ///
    /// # Panics
    ///
    /// Panics if `elem_bytes` is zero.
    pub fn new(windows: impl IntoIterator<Item = (WindowId, usize)>, elem_bytes: usize) -> Self {
        assert!(elem_bytes > 0, "element width must be non-zero");
        Self {
            windows: windows
                .into_iter()
                .map(|(id, bytes)| (id, bytes / elem_bytes))
                .collect(),
            elem_bytes,
        }
    }

    /// Total capacity in elements
    pub fn capacity(&self) -> usize {
        self.windows.iter().map(|&(_, cap)| cap).sum()
    }

    /// Element width
    pub const fn elem_bytes(&self) -> usize {
        self.elem_bytes
    }

    /// Windows and their capacities in elements
    pub fn windows(&self) -> &[(WindowId, usize)] {
        &self.windows
    }

    /// Place `count` elements starting at logical offset `base`
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::CapacityExceeded`] if the base lies past the end
    /// of the space, or the operand would need more than the window holding
    /// its base plus the one after it.
    pub fn place(&self, base: usize, count: usize) -> Result<Placement> {
        let mut window_start = 0;
        for (i, &(id, capacity)) in self.windows.iter().enumerate() {
            if base > window_start + capacity {
                window_start += capacity;
                continue;
            }

            let local = base - window_start;
            let (n0, n1) = split(capacity, local, count);
            let head = Segment {
                window: id,
                offset: local,
                len: n0,
            };
            if n1 == 0 {
                return Ok(Placement {
                    start: base,
                    head,
                    tail: None,
                });
            }

            let Some(&(next, next_capacity)) = self.windows.get(i + 1) else {
                return Err(XgemmError::CapacityExceeded {
                    requested: count,
                    available: n0,
                });
            };
            if n1 > next_capacity {
                return Err(XgemmError::CapacityExceeded {
                    requested: count,
                    available: n0 + next_capacity,
                });
            }

            tracing::debug!("Operand at {base} splits: {n0} in {id}, {n1} in {next}");
            return Ok(Placement {
                start: base,
                head,
                tail: Some(Segment {
                    window: next,
                    offset: 0,
                    len: n1,
                }),
            });
        }

        Err(XgemmError::CapacityExceeded {
            requested: count,
            available: 0,
        })
    }

    /// Place A, B and C back to back starting at `base`
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::CapacityExceeded`] if any operand does not fit.
    pub fn pack(&self, base: usize, counts: [usize; 3]) -> Result<OperandLayout> {
        let a = self.place(base, counts[0])?;
        let b = self.place(a.end(), counts[1])?;
        let c = self.place(b.end(), counts[2])?;
        tracing::debug!(
            "Packed operands: a {}..{}, b {}..{}, c {}..{}",
            a.start(),
            a.end(),
            b.start(),
            b.end(),
            c.start(),
            c.end()
        );
        Ok(OperandLayout {
            a,
            b,
            c,
            elem_bytes: self.elem_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_windows(w0: usize, w1: usize) -> AddressSpace {
        AddressSpace::new([(WindowId::A, w0), (WindowId::B0, w1)], 1)
    }

    #[test]
    fn split_counts_are_consistent() {
        for w in 0..12 {
            for b in 0..=w {
                for c in 0..20 {
                    let (n0, n1) = split(w, b, c);
                    assert_eq!(n0 + n1, c);
                    assert_eq!(n0, c.min(w - b));
                    assert_eq!(n1, c - n0);
                }
            }
        }
    }

    #[test]
    fn placement_matches_split_for_every_base() {
        for w in 1..10 {
            let space = two_windows(w, 64);
            for b in 0..=w {
                for c in 0..30 {
                    let p = space.place(b, c).unwrap();
                    let (n0, n1) = split(w, b, c);
                    assert_eq!((p.head_len(), p.tail_len()), (n0, n1));
                    assert_eq!(p.head().window, WindowId::A);
                    assert_eq!(p.head().offset, b);
                    if n1 == 0 {
                        assert!(!p.is_split());
                        assert!(p.segments().all(|s| s.window == WindowId::A));
                    } else {
                        let tail = p.tail().unwrap();
                        assert_eq!((tail.window, tail.offset), (WindowId::B0, 0));
                        assert_eq!(b + n0, w, "split head must fill window 0");
                    }
                }
            }
        }
    }

    #[test]
    fn base_at_window_end_skips_empty_head() {
        let p = two_windows(8, 8).place(8, 5).unwrap();
        assert_eq!(p.head_len(), 0);
        assert_eq!(p.tail_len(), 5);
        let segments: Vec<_> = p.segments().collect();
        assert_eq!(
            segments,
            vec![Segment {
                window: WindowId::B0,
                offset: 0,
                len: 5
            }]
        );
    }

    #[test]
    fn exact_fit_does_not_split() {
        let p = two_windows(8, 8).place(3, 5).unwrap();
        assert!(!p.is_split());
        assert_eq!(p.end(), 8);
    }

    #[test]
    fn zero_count_touches_nothing() {
        let p = two_windows(8, 8).place(2, 0).unwrap();
        assert_eq!(p.count(), 0);
        assert_eq!(p.segments().count(), 0);
    }

    #[test]
    fn sequential_packing() {
        for counts in [[1, 1, 1], [4, 7, 2], [5, 3, 6], [16, 16, 16]] {
            let layout = two_windows(20, 40).pack(0, counts).unwrap();
            assert_eq!(layout.b.start(), layout.a.start() + counts[0]);
            assert_eq!(layout.c.start(), layout.b.start() + counts[1]);
            assert_eq!(layout.c.count(), counts[2]);
        }
    }

    #[test]
    fn later_window_base_maps_locally() {
        let space = AddressSpace::new(
            [(WindowId::A, 8), (WindowId::B0, 8), (WindowId::C0, 8)],
            1,
        );
        let p = space.place(10, 10).unwrap();
        assert_eq!(p.head(), Segment { window: WindowId::B0, offset: 2, len: 6 });
        assert_eq!(p.tail().unwrap(), Segment { window: WindowId::C0, offset: 0, len: 4 });
    }

    #[test]
    fn overflow_is_capacity_error() {
        let space = two_windows(8, 8);
        assert!(matches!(
            space.place(4, 13),
            Err(XgemmError::CapacityExceeded { requested: 13, available: 12 })
        ));
        assert!(matches!(space.place(17, 0), Err(XgemmError::CapacityExceeded { .. })));
    }

    #[test]
    fn capacities_count_elements() {
        let space = AddressSpace::new([(WindowId::A, 0x40), (WindowId::B0, 0x20)], 2);
        assert_eq!(space.windows(), &[(WindowId::A, 0x20), (WindowId::B0, 0x10)]);
        assert_eq!(space.capacity(), 0x30);
    }
}
