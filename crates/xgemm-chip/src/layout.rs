// SPDX-License-Identifier: AGPL-3.0-only

//! Physical window layout of the accelerator.
//!
//! Measured on the ZynqMP reference design (PL AXI slaves behind HPM0).
//!
//! ```text
//! Window   Physical base   Size      Contents
//! ──────── ─────────────── ───────── ──────────────────────────────────
//! Control  0xa000_0000     4 KB      AXI-Lite control registers
//! A        0xb000_0000     256 KB    A operand (shared by both ports)
//! B0       0xb004_0000     128 KB    B operand, port 0
//! B1       0xb006_0000     128 KB    B operand, port 1
//! C0       0xb008_0000     64 KB     C result, port 0
//! C1       0xb010_0000     64 KB     C result, port 1
//! ```
//!
//! A and B0 are physically adjacent, which the whole-matrix core exploits by
//! treating them as one operand space.

/// One of the two alternating B/C buffer sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Port {
    /// Buffer set 0 (B0 / C0).
    P0,
    /// Buffer set 1 (B1 / C1).
    P1,
}

impl Port {
    /// Both ports, in index order.
    pub const ALL: [Self; 2] = [Self::P0, Self::P1];

    /// Value written to the port-select register.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
        }
    }

    /// The alternate port.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::P0 => Self::P1,
            Self::P1 => Self::P0,
        }
    }

    /// Port for a register value.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::P0),
            1 => Some(Self::P1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port{}", self.index())
    }
}

/// Mapped window identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WindowId {
    /// Control registers.
    Control,
    /// A operand buffer.
    A,
    /// B operand buffer, port 0.
    B0,
    /// B operand buffer, port 1.
    B1,
    /// C result buffer, port 0.
    C0,
    /// C result buffer, port 1.
    C1,
}

impl WindowId {
    /// Acquisition order. Release runs in reverse.
    pub const ALL: [Self; 6] = [Self::Control, Self::A, Self::B0, Self::C0, Self::B1, Self::C1];

    /// B window of a port.
    #[must_use]
    pub const fn b(port: Port) -> Self {
        match port {
            Port::P0 => Self::B0,
            Port::P1 => Self::B1,
        }
    }

    /// C window of a port.
    #[must_use]
    pub const fn c(port: Port) -> Self {
        match port {
            Port::P0 => Self::C0,
            Port::P1 => Self::C1,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::A => "a",
            Self::B0 => "b0",
            Self::B1 => "b1",
            Self::C0 => "c0",
            Self::C1 => "c1",
        }
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Physical base address (offset into the memory file).
    pub base: u64,
    /// Size in bytes.
    pub size: usize,
}

impl Window {
    /// Create a window.
    #[must_use]
    pub const fn new(base: u64, size: usize) -> Self {
        Self { base, size }
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    /// Whether two windows share any byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Reference design addresses.
pub mod zynq {
    use super::Window;

    /// Control registers.
    pub const CONTROL: Window = Window::new(0xa000_0000, 0x1000);
    /// A operand.
    pub const A: Window = Window::new(0xb000_0000, 0x4_0000);
    /// B operand, port 0.
    pub const B0: Window = Window::new(0xb004_0000, 0x2_0000);
    /// B operand, port 1.
    pub const B1: Window = Window::new(0xb006_0000, 0x2_0000);
    /// C result, port 0.
    pub const C0: Window = Window::new(0xb008_0000, 0x1_0000);
    /// C result, port 1.
    pub const C1: Window = Window::new(0xb010_0000, 0x1_0000);
}

/// Largest dimensions the bitstream was synthesised for.
pub mod limits {
    /// Rows of A / C.
    pub const MAX_M: usize = 1024;
    /// Reduction dimension.
    pub const MAX_K: usize = 4608;
    /// Columns of B / C.
    pub const MAX_N: usize = 173_056;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_windows_are_disjoint() {
        let all = [zynq::CONTROL, zynq::A, zynq::B0, zynq::B1, zynq::C0, zynq::C1];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn a_and_b0_are_adjacent() {
        assert_eq!(zynq::A.end(), zynq::B0.base);
    }

    #[test]
    fn port_windows_alternate() {
        assert_eq!(WindowId::b(Port::P0.other()), WindowId::B1);
        assert_eq!(WindowId::c(Port::P1.other()), WindowId::C0);
        assert_eq!(Port::from_index(1), Some(Port::P1));
        assert_eq!(Port::from_index(2), None);
    }
}
