// SPDX-License-Identifier: AGPL-3.0-only

//! Control register maps.
//!
//! Two accelerator generations share the operand layout but not the control
//! protocol:
//!
//! - **`ap_ctrl`**: the Vivado HLS generated AXI-Lite block. Start, done,
//!   idle and ready live in one control word; done is clear-on-read.
//! - **`self_clear`**: the hand-written block. Reset and start are
//!   self-clearing pulses in `CONTROL`; a single `DATA_READY` status bit
//!   reports both "finished" and "ready for more work".
//!
//! ```text
//! ap_ctrl (AXILiteS)                     self_clear
//! 0x00  AP_CTRL  start/done/idle/ready   0x00  CONTROL  reset/start (SC)
//! 0x04  GIE                              0x04  STATUS   data_ready
//! 0x08  IER      ap_done / ap_ready      0x08  M
//! 0x0c  ISR      (toggle-on-write)       0x0c  N
//! 0x10  M                                0x10  K
//! 0x18  N                                0x14  S
//! 0x20  K                                0x18  PORT
//! 0x28  S                                0x1c  A_OFFSET
//! 0x30  BUF_R    port select             0x20  B_OFFSET
//! 0x38  A_OFFSET                         0x24  C_OFFSET
//! 0x40  B_OFFSET                         0x28  LDA
//! 0x48  C_OFFSET                         0x2c  LDB
//! 0x50  LDA                              0x30  LDC
//! 0x58  LDB
//! 0x60  LDC
//! ```

/// HLS `ap_ctrl_hs` register block (AXILiteS).
pub mod ap_ctrl {
    /// Control signals: start (R/W/COH), done (R/COR), idle (R), ready (R), auto-restart (R/W).
    pub const AP_CTRL: usize = 0x00;
    /// Global interrupt enable.
    pub const GIE: usize = 0x04;
    /// IP interrupt enable (channel 0 = ap_done, channel 1 = ap_ready).
    pub const IER: usize = 0x08;
    /// IP interrupt status, toggle-on-write.
    pub const ISR: usize = 0x0C;
    /// Rows of A / C.
    pub const M: usize = 0x10;
    /// Columns of B / C.
    pub const N: usize = 0x18;
    /// Reduction dimension.
    pub const K: usize = 0x20;
    /// Block edge for the block-decomposition core.
    pub const S: usize = 0x28;
    /// Port (B/C buffer set) consumed by the next start.
    pub const BUF_R: usize = 0x30;
    /// Element offset of A in the shared operand space.
    pub const A_OFFSET: usize = 0x38;
    /// Element offset of B in the shared operand space.
    pub const B_OFFSET: usize = 0x40;
    /// Element offset of C in the shared operand space.
    pub const C_OFFSET: usize = 0x48;
    /// Leading dimension of A.
    pub const LDA: usize = 0x50;
    /// Leading dimension of B.
    pub const LDB: usize = 0x58;
    /// Leading dimension of C.
    pub const LDC: usize = 0x60;

    /// `AP_CTRL` bits.
    pub mod ctrl {
        /// Start pulse, cleared by the core on handshake.
        pub const AP_START: u32 = 1 << 0;
        /// Operation finished. Clear-on-read.
        pub const AP_DONE: u32 = 1 << 1;
        /// Core is idle.
        pub const AP_IDLE: u32 = 1 << 2;
        /// Core can accept new inputs.
        pub const AP_READY: u32 = 1 << 3;
        /// Restart automatically after done.
        pub const AUTO_RESTART: u32 = 1 << 7;
    }

    /// `GIE` / `IER` / `ISR` bits.
    pub mod irq {
        /// Global interrupt enable.
        pub const GLOBAL_ENABLE: u32 = 1 << 0;
        /// Channel 0, raised on ap_done.
        pub const AP_DONE: u32 = 1 << 0;
        /// Channel 1, raised on ap_ready.
        pub const AP_READY: u32 = 1 << 1;
    }
}

/// Self-clearing reset / data-ready register block.
pub mod self_clear {
    /// Reset and start pulses, both self-clearing.
    pub const CONTROL: usize = 0x00;
    /// Status word.
    pub const STATUS: usize = 0x04;
    /// Rows of A / C.
    pub const M: usize = 0x08;
    /// Columns of B / C.
    pub const N: usize = 0x0C;
    /// Reduction dimension.
    pub const K: usize = 0x10;
    /// Block edge.
    pub const S: usize = 0x14;
    /// Port select.
    pub const PORT: usize = 0x18;
    /// Element offset of A.
    pub const A_OFFSET: usize = 0x1C;
    /// Element offset of B.
    pub const B_OFFSET: usize = 0x20;
    /// Element offset of C.
    pub const C_OFFSET: usize = 0x24;
    /// Leading dimension of A.
    pub const LDA: usize = 0x28;
    /// Leading dimension of B.
    pub const LDB: usize = 0x2C;
    /// Leading dimension of C.
    pub const LDC: usize = 0x30;

    /// `CONTROL` bits.
    pub mod control {
        /// Soft reset, returns the core to idle and discards in-flight work.
        pub const RESET: u32 = 1 << 0;
        /// Start pulse.
        pub const START: u32 = 1 << 1;
    }

    /// `STATUS` bits.
    pub mod status {
        /// Result valid and core ready. Set after reset.
        pub const DATA_READY: u32 = 1 << 0;
    }
}

/// Control protocol spoken by an accelerator generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFlavor {
    /// HLS `ap_start` / `ap_done` / `ap_idle` / `ap_ready`.
    ApCtrl,
    /// Self-clearing reset + data-ready.
    SelfClear,
}

impl std::fmt::Display for ProtocolFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApCtrl => write!(f, "ap_ctrl"),
            Self::SelfClear => write!(f, "self_clear"),
        }
    }
}

/// Byte offsets and bit masks of one register block.
///
/// `control` and `status` may name the same register (the HLS block keeps
/// everything in `AP_CTRL`), and `idle_mask` may equal `done_mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// Protocol this map belongs to.
    pub flavor: ProtocolFlavor,
    /// Register receiving start / reset.
    pub control: usize,
    /// Register exposing idle / done.
    pub status: usize,
    /// Rows of A / C.
    pub m: usize,
    /// Columns of B / C.
    pub n: usize,
    /// Reduction dimension.
    pub k: usize,
    /// Block edge.
    pub s: usize,
    /// Port select.
    pub port: usize,
    /// Element offset of A.
    pub a_offset: usize,
    /// Element offset of B.
    pub b_offset: usize,
    /// Element offset of C.
    pub c_offset: usize,
    /// Leading dimension of A.
    pub lda: usize,
    /// Leading dimension of B.
    pub ldb: usize,
    /// Leading dimension of C.
    pub ldc: usize,
    /// Global interrupt enable, if the block has one.
    pub gie: Option<usize>,
    /// Interrupt enable, if the block has one.
    pub ier: Option<usize>,
    /// Interrupt status, if the block has one.
    pub isr: Option<usize>,
    /// Bit written to `control` to start.
    pub start_mask: u32,
    /// `control` bits that must survive a read-modify-write start.
    pub preserve_mask: u32,
    /// Bit written to `control` to reset, if the block self-clears.
    pub reset_mask: Option<u32>,
    /// `status` bit meaning "ready to accept new work".
    pub idle_mask: u32,
    /// `status` bit meaning "computation finished".
    pub done_mask: u32,
    /// Whether reading `status` clears `done_mask`.
    pub done_clears_on_read: bool,
}

impl RegisterMap {
    /// HLS generated block.
    pub const AP_CTRL: Self = Self {
        flavor: ProtocolFlavor::ApCtrl,
        control: ap_ctrl::AP_CTRL,
        status: ap_ctrl::AP_CTRL,
        m: ap_ctrl::M,
        n: ap_ctrl::N,
        k: ap_ctrl::K,
        s: ap_ctrl::S,
        port: ap_ctrl::BUF_R,
        a_offset: ap_ctrl::A_OFFSET,
        b_offset: ap_ctrl::B_OFFSET,
        c_offset: ap_ctrl::C_OFFSET,
        lda: ap_ctrl::LDA,
        ldb: ap_ctrl::LDB,
        ldc: ap_ctrl::LDC,
        gie: Some(ap_ctrl::GIE),
        ier: Some(ap_ctrl::IER),
        isr: Some(ap_ctrl::ISR),
        start_mask: ap_ctrl::ctrl::AP_START,
        preserve_mask: ap_ctrl::ctrl::AUTO_RESTART,
        reset_mask: None,
        idle_mask: ap_ctrl::ctrl::AP_IDLE,
        done_mask: ap_ctrl::ctrl::AP_DONE,
        done_clears_on_read: true,
    };

    /// Self-clearing reset / data-ready block.
    pub const SELF_CLEAR: Self = Self {
        flavor: ProtocolFlavor::SelfClear,
        control: self_clear::CONTROL,
        status: self_clear::STATUS,
        m: self_clear::M,
        n: self_clear::N,
        k: self_clear::K,
        s: self_clear::S,
        port: self_clear::PORT,
        a_offset: self_clear::A_OFFSET,
        b_offset: self_clear::B_OFFSET,
        c_offset: self_clear::C_OFFSET,
        lda: self_clear::LDA,
        ldb: self_clear::LDB,
        ldc: self_clear::LDC,
        gie: None,
        ier: None,
        isr: None,
        start_mask: self_clear::control::START,
        preserve_mask: 0,
        reset_mask: Some(self_clear::control::RESET),
        idle_mask: self_clear::status::DATA_READY,
        done_mask: self_clear::status::DATA_READY,
        done_clears_on_read: false,
    };

    /// Map for a protocol flavour.
    #[must_use]
    pub const fn for_flavor(flavor: ProtocolFlavor) -> Self {
        match flavor {
            ProtocolFlavor::ApCtrl => Self::AP_CTRL,
            ProtocolFlavor::SelfClear => Self::SELF_CLEAR,
        }
    }

    /// Every named register with its offset, for diagnostics dumps.
    #[must_use]
    pub fn named(&self) -> Vec<(&'static str, usize)> {
        let mut regs = vec![("control", self.control)];
        if self.status != self.control {
            regs.push(("status", self.status));
        }
        regs.extend([
            ("m", self.m),
            ("n", self.n),
            ("k", self.k),
            ("s", self.s),
            ("port", self.port),
            ("a_offset", self.a_offset),
            ("b_offset", self.b_offset),
            ("c_offset", self.c_offset),
            ("lda", self.lda),
            ("ldb", self.ldb),
            ("ldc", self.ldc),
        ]);
        if let Some(gie) = self.gie {
            regs.push(("gie", gie));
        }
        if let Some(ier) = self.ier {
            regs.push(("ier", ier));
        }
        if let Some(isr) = self.isr {
            regs.push(("isr", isr));
        }
        regs
    }

    /// One past the highest register byte; the control window must be at least this large.
    #[must_use]
    pub fn span(&self) -> usize {
        self.named().iter().map(|&(_, off)| off + 4).max().unwrap_or(0)
    }
}
