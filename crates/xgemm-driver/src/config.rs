// SPDX-License-Identifier: AGPL-3.0-only

//! Device configuration
//!
//! One table selects everything that differs between accelerator
//! generations: where the windows live, which register block and completion
//! strategy the bitstream speaks, and which operand transfers the driver
//! performs. [`DeviceConfig::default`] describes the ZynqMP reference design.

use crate::error::{Result, XgemmError};
use crate::handshake::{CompletionMode, PollPolicy};
use crate::placement::AddressSpace;
use std::path::PathBuf;
use xgemm_chip::fixed::QFormat;
use xgemm_chip::layout::{zynq, Window, WindowId};
use xgemm_chip::regs::{ProtocolFlavor, RegisterMap};

/// Environment variable overriding the memory file path
pub const MEM_PATH_ENV: &str = "XGEMM_MEM_PATH";

/// Default memory file
pub const DEFAULT_MEM_PATH: &str = "/dev/mem";

/// Physical location of every window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    /// Control registers
    pub control: Window,
    /// A operand
    pub a: Window,
    /// B operand, port 0
    pub b0: Window,
    /// B operand, port 1
    pub b1: Window,
    /// C result, port 0
    pub c0: Window,
    /// C result, port 1
    pub c1: Window,
}

impl Default for AddressMap {
    fn default() -> Self {
        Self {
            control: zynq::CONTROL,
            a: zynq::A,
            b0: zynq::B0,
            b1: zynq::B1,
            c0: zynq::C0,
            c1: zynq::C1,
        }
    }
}

impl AddressMap {
    /// Window for an id
    pub const fn window(&self, id: WindowId) -> Window {
        match id {
            WindowId::Control => self.control,
            WindowId::A => self.a,
            WindowId::B0 => self.b0,
            WindowId::B1 => self.b1,
            WindowId::C0 => self.c0,
            WindowId::C1 => self.c1,
        }
    }
}

/// Accelerator session configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Memory file giving access to physical addresses
    pub mem_path: PathBuf,
    /// Window placement
    pub layout: AddressMap,
    /// Windows concatenated into the whole-matrix operand space, in order
    pub gemm_space: Vec<WindowId>,
    /// Control protocol
    pub flavor: ProtocolFlavor,
    /// Completion detection
    pub completion: CompletionMode,
    /// Bound on every busy-wait
    pub poll: PollPolicy,
    /// Copy B into the device (false when B is preloaded out of band)
    pub transfer_b: bool,
    /// Copy an initial C into the device before starting (accumulate mode)
    pub transfer_c: bool,
    /// Read back every written element
    pub verify_writes: bool,
    /// Sentinel expected in word 0 of the A window
    pub magic: Option<u32>,
    /// Fixed-point format of the float-facing calls
    pub qformat: QFormat,
    /// Program the interrupt enables at initialisation
    pub enable_interrupts: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mem_path: PathBuf::from(DEFAULT_MEM_PATH),
            layout: AddressMap::default(),
            gemm_space: vec![WindowId::A, WindowId::B0],
            flavor: ProtocolFlavor::ApCtrl,
            completion: CompletionMode::Polling,
            poll: PollPolicy::UNBOUNDED,
            transfer_b: true,
            transfer_c: false,
            verify_writes: false,
            magic: None,
            qformat: QFormat::Q9,
            enable_interrupts: false,
        }
    }
}

impl DeviceConfig {
    /// Default configuration with `mem_path` taken from `XGEMM_MEM_PATH` if set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(MEM_PATH_ENV) {
            tracing::debug!("Using memory file from {MEM_PATH_ENV}: {}", path.to_string_lossy());
            config.mem_path = PathBuf::from(path);
        }
        config
    }

    /// Set the memory file
    #[must_use]
    pub fn with_mem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mem_path = path.into();
        self
    }

    /// Set the window layout
    #[must_use]
    pub const fn with_layout(mut self, layout: AddressMap) -> Self {
        self.layout = layout;
        self
    }

    /// Set the whole-matrix operand space
    #[must_use]
    pub fn with_gemm_space(mut self, windows: impl Into<Vec<WindowId>>) -> Self {
        self.gemm_space = windows.into();
        self
    }

    /// Set the control protocol
    #[must_use]
    pub const fn with_flavor(mut self, flavor: ProtocolFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Set completion detection
    #[must_use]
    pub const fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.completion = completion;
        self
    }

    /// Bound busy-waits
    #[must_use]
    pub const fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Enable or disable the B transfer step
    #[must_use]
    pub const fn with_transfer_b(mut self, enabled: bool) -> Self {
        self.transfer_b = enabled;
        self
    }

    /// Enable or disable the C preload step
    #[must_use]
    pub const fn with_transfer_c(mut self, enabled: bool) -> Self {
        self.transfer_c = enabled;
        self
    }

    /// Enable or disable write verification
    #[must_use]
    pub const fn with_verify_writes(mut self, enabled: bool) -> Self {
        self.verify_writes = enabled;
        self
    }

    /// Require a sentinel in word 0 of the A window
    #[must_use]
    pub const fn with_magic(mut self, magic: Option<u32>) -> Self {
        self.magic = magic;
        self
    }

    /// Set the fixed-point format
    #[must_use]
    pub const fn with_qformat(mut self, qformat: QFormat) -> Self {
        self.qformat = qformat;
        self
    }

    /// Program interrupt enables at initialisation
    #[must_use]
    pub const fn with_interrupts(mut self, enabled: bool) -> Self {
        self.enable_interrupts = enabled;
        self
    }

    /// Register map for the configured flavour
    pub const fn register_map(&self) -> RegisterMap {
        RegisterMap::for_flavor(self.flavor)
    }

    /// Whole-matrix operand space for elements of `elem_bytes`
    pub fn gemm_address_space(&self, elem_bytes: usize) -> AddressSpace {
        AddressSpace::new(
            self.gemm_space
                .iter()
                .map(|&id| (id, self.layout.window(id).size)),
            elem_bytes,
        )
    }

    /// Single-window space, used by the block core
    pub fn window_space(&self, id: WindowId, elem_bytes: usize) -> AddressSpace {
        AddressSpace::new([(id, self.layout.window(id).size)], elem_bytes)
    }

    /// Reject layouts the driver cannot map safely
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::InvalidConfig`] for unaligned or overlapping
    /// windows, a control window too small for its register map, or an empty
    /// or repeating `gemm_space`.
    pub fn validate(&self) -> Result<()> {
        let page = rustix::param::page_size() as u64;

        for id in WindowId::ALL {
            let w = self.layout.window(id);
            if w.size == 0 || w.size % 4 != 0 {
                return Err(XgemmError::invalid_config(format!(
                    "{id} window size {:#x} is not a non-zero multiple of 4",
                    w.size
                )));
            }
            if w.base % page != 0 {
                return Err(XgemmError::invalid_config(format!(
                    "{id} window base {:#x} is not aligned to the {page:#x} byte page",
                    w.base
                )));
            }
        }

        for (i, a) in WindowId::ALL.iter().enumerate() {
            for b in &WindowId::ALL[i + 1..] {
                if self.layout.window(*a).overlaps(&self.layout.window(*b)) {
                    return Err(XgemmError::invalid_config(format!("{a} and {b} windows overlap")));
                }
            }
        }

        let span = self.register_map().span();
        if self.layout.control.size < span {
            return Err(XgemmError::invalid_config(format!(
                "control window {:#x} bytes, {} register map needs {span:#x}",
                self.layout.control.size, self.flavor
            )));
        }

        if self.gemm_space.is_empty() {
            return Err(XgemmError::invalid_config("gemm_space is empty"));
        }
        for (i, id) in self.gemm_space.iter().enumerate() {
            if *id == WindowId::Control {
                return Err(XgemmError::invalid_config("gemm_space cannot include the control window"));
            }
            if self.gemm_space[..i].contains(id) {
                return Err(XgemmError::invalid_config(format!("{id} appears twice in gemm_space")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        DeviceConfig::default().validate().unwrap();
        DeviceConfig::default()
            .with_flavor(ProtocolFlavor::SelfClear)
            .validate()
            .unwrap();
    }

    #[test]
    fn default_gemm_space_spans_a_and_b0() {
        let space = DeviceConfig::default().gemm_address_space(2);
        assert_eq!(space.capacity(), (zynq::A.size + zynq::B0.size) / 2);
    }

    #[test]
    fn overlapping_windows_rejected() {
        let mut layout = AddressMap::default();
        layout.b1 = Window::new(zynq::B0.base, zynq::B1.size);
        let err = DeviceConfig::default().with_layout(layout).validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn unaligned_base_rejected() {
        let mut layout = AddressMap::default();
        layout.c1 = Window::new(zynq::C1.base + 4, zynq::C1.size);
        assert!(DeviceConfig::default().with_layout(layout).validate().is_err());
    }

    #[test]
    fn control_window_must_hold_register_map() {
        let mut layout = AddressMap::default();
        layout.control = Window::new(zynq::CONTROL.base, 0x20);
        assert!(DeviceConfig::default().with_layout(layout).validate().is_err());
    }

    #[test]
    fn gemm_space_rules() {
        assert!(DeviceConfig::default().with_gemm_space(vec![]).validate().is_err());
        assert!(DeviceConfig::default()
            .with_gemm_space(vec![WindowId::A, WindowId::A])
            .validate()
            .is_err());
        assert!(DeviceConfig::default()
            .with_gemm_space(vec![WindowId::Control])
            .validate()
            .is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = DeviceConfig::default()
            .with_mem_path("/tmp/fabric")
            .with_transfer_b(false)
            .with_magic(Some(0xdead_beef))
            .with_poll(PollPolicy::spins(100));
        assert_eq!(config.mem_path, PathBuf::from("/tmp/fabric"));
        assert!(!config.transfer_b);
        assert_eq!(config.magic, Some(0xdead_beef));
        assert_eq!(config.poll.max_spins, Some(100));
    }
}
