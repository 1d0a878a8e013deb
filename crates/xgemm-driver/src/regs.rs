// SPDX-License-Identifier: AGPL-3.0-only

//! Typed view over the control window

use crate::mmio::MappedRegion;
use std::sync::atomic::{fence, Ordering};
use xgemm_chip::layout::Port;
use xgemm_chip::regs::RegisterMap;

/// One sample of the status register.
///
/// On the HLS block `done` is clear-on-read, so a sample must be taken once
/// and both bits interpreted from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBits {
    /// Raw register value
    pub raw: u32,
    /// Ready to accept new work
    pub idle: bool,
    /// Last operation finished
    pub done: bool,
}

/// Control registers of one accelerator, borrowed from its control window
#[derive(Debug)]
pub struct RegisterFile<'a> {
    region: &'a mut MappedRegion,
    map: RegisterMap,
}

impl<'a> RegisterFile<'a> {
    /// View `region` through `map`
    pub fn new(region: &'a mut MappedRegion, map: RegisterMap) -> Self {
        Self { region, map }
    }

    /// Register map in use
    pub const fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Read an arbitrary register
    pub fn read(&self, offset: usize) -> u32 {
        self.region.read32(offset)
    }

    /// Write an arbitrary register
    pub fn write(&mut self, offset: usize, value: u32) {
        self.region.write32(offset, value);
    }

    /// Sample the status register once
    pub fn status(&self) -> StatusBits {
        let raw = self.region.read32(self.map.status);
        StatusBits {
            raw,
            idle: raw & self.map.idle_mask != 0,
            done: raw & self.map.done_mask != 0,
        }
    }

    /// Write M, N, K
    pub fn set_dims(&mut self, m: u32, n: u32, k: u32) {
        self.region.write32(self.map.m, m);
        self.region.write32(self.map.n, n);
        self.region.write32(self.map.k, k);
    }

    /// Write the block edge S
    pub fn set_block(&mut self, s: u32) {
        self.region.write32(self.map.s, s);
    }

    /// Select the port consumed by the next start
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_port(&mut self, port: Port) {
        self.region.write32(self.map.port, port.index() as u32);
    }

    /// Write the A/B/C base-offset registers
    pub fn set_offsets(&mut self, a: u32, b: u32, c: u32) {
        self.region.write32(self.map.a_offset, a);
        self.region.write32(self.map.b_offset, b);
        self.region.write32(self.map.c_offset, c);
    }

    /// Write the leading-dimension registers
    pub fn set_strides(&mut self, lda: u32, ldb: u32, ldc: u32) {
        self.region.write32(self.map.lda, lda);
        self.region.write32(self.map.ldb, ldb);
        self.region.write32(self.map.ldc, ldc);
    }

    /// Raise the start bit
    ///
    /// Everything written before this call, to any window, is visible to
    /// the device before the pulse.
    pub fn pulse_start(&mut self) {
        fence(Ordering::SeqCst);
        let keep = if self.map.preserve_mask == 0 {
            0
        } else {
            self.region.read32(self.map.control) & self.map.preserve_mask
        };
        self.region.write32(self.map.control, keep | self.map.start_mask);
    }

    /// Return the core to idle, discarding in-flight work
    pub fn reset(&mut self) {
        let value = self.map.reset_mask.unwrap_or(0);
        self.region.write32(self.map.control, value);
        if let Some(isr) = self.map.isr {
            let pending = self.region.read32(isr);
            if pending != 0 {
                // toggle-on-write: writing the set bits clears them
                self.region.write32(isr, pending);
            }
        }
    }

    /// Enable the ap_done interrupt. Returns `false` if the block has no interrupt logic.
    pub fn enable_interrupts(&mut self) -> bool {
        let (Some(gie), Some(ier)) = (self.map.gie, self.map.ier) else {
            return false;
        };
        self.region
            .write32(ier, xgemm_chip::regs::ap_ctrl::irq::AP_DONE);
        self.region
            .write32(gie, xgemm_chip::regs::ap_ctrl::irq::GLOBAL_ENABLE);
        true
    }

    /// Clear the ap_done interrupt status bit if set
    pub fn acknowledge_interrupt(&mut self) {
        if let Some(isr) = self.map.isr {
            let done = xgemm_chip::regs::ap_ctrl::irq::AP_DONE;
            if self.region.read32(isr) & done != 0 {
                self.region.write32(isr, done);
            }
        }
    }

    /// Every named register and its current value
    ///
    /// Reading the status register may clear a pending done bit.
    pub fn snapshot(&self) -> Vec<(&'static str, u32)> {
        self.map
            .named()
            .into_iter()
            .map(|(name, offset)| (name, self.region.read32(offset)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xgemm_chip::layout::{Window, WindowId};
    use xgemm_chip::regs::{ap_ctrl, self_clear};

    fn control() -> (std::fs::File, MappedRegion) {
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x1000).unwrap();
        let region = MappedRegion::map(&file, WindowId::Control, Window::new(0, 0x1000)).unwrap();
        (file, region)
    }

    #[test]
    fn start_preserves_auto_restart() {
        let (_file, mut region) = control();
        region.write32(ap_ctrl::AP_CTRL, ap_ctrl::ctrl::AUTO_RESTART | ap_ctrl::ctrl::AP_IDLE);
        let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        regs.pulse_start();
        assert_eq!(
            regs.read(ap_ctrl::AP_CTRL),
            ap_ctrl::ctrl::AUTO_RESTART | ap_ctrl::ctrl::AP_START
        );
    }

    #[test]
    fn self_clear_status_aliases_idle_and_done() {
        let (_file, mut region) = control();
        region.write32(self_clear::STATUS, self_clear::status::DATA_READY);
        let regs = RegisterFile::new(&mut region, RegisterMap::SELF_CLEAR);
        let status = regs.status();
        assert!(status.idle && status.done);
    }

    #[test]
    fn dims_land_in_their_registers() {
        let (_file, mut region) = control();
        let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        regs.set_dims(4, 5, 6);
        regs.set_block(8);
        regs.set_port(Port::P1);
        assert_eq!(regs.read(ap_ctrl::M), 4);
        assert_eq!(regs.read(ap_ctrl::N), 5);
        assert_eq!(regs.read(ap_ctrl::K), 6);
        assert_eq!(regs.read(ap_ctrl::S), 8);
        assert_eq!(regs.read(ap_ctrl::BUF_R), 1);
    }

    #[test]
    fn reset_pulses_self_clear_bit() {
        let (_file, mut region) = control();
        let mut regs = RegisterFile::new(&mut region, RegisterMap::SELF_CLEAR);
        regs.reset();
        assert_eq!(regs.read(self_clear::CONTROL), self_clear::control::RESET);
    }

    #[test]
    fn interrupts_only_on_hls_block() {
        let (_file, mut region) = control();
        let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        assert!(regs.enable_interrupts());
        assert_eq!(regs.read(ap_ctrl::GIE), 1);
        assert_eq!(regs.read(ap_ctrl::IER), ap_ctrl::irq::AP_DONE);

        let mut regs = RegisterFile::new(&mut region, RegisterMap::SELF_CLEAR);
        assert!(!regs.enable_interrupts());
    }
}
