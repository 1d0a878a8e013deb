// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side driver for the FPGA GEMM accelerator.
//!
//! The accelerator sits behind a handful of physical windows: one AXI-Lite
//! control block and several BRAM buffers for the A, B and C operands. The
//! driver maps them through `/dev/mem`, places operands across window
//! boundaries, copies them in and out with volatile accesses, and runs the
//! start/done handshake.
//!
//! # Layers
//!
//! ```text
//!   XgemmDevice          session: initialize / submit / read_result / shutdown
//!     ├─ PortTable       double-buffer rules for the block core
//!     ├─ Handshake       Idle → Busy → Done, polling or notification count
//!     ├─ transfer        operand copy, split-aware, optional Q-format codec
//!     ├─ AddressSpace    placement of A, B, C over concatenated windows
//!     ├─ RegisterFile    typed control registers (ApCtrl or SelfClear map)
//!     └─ MappedRegion    mmap'd window, volatile bounds-checked access
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use xgemm_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut dev = XgemmDevice::initialize(DeviceConfig::from_env())?;
//!
//! let dims = Dims::new(4, 4, 4);
//! let a = [1i16; 16];
//! let b = [2i16; 16];
//! let c = [0i16; 16];
//! dev.submit_gemm(dims, &a, &b, &c, Strides::packed(dims))?;
//!
//! let mut out = [0i16; 16];
//! dev.read_result(4, 4, &mut out, None)?;
//! dev.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! The handle is not internally synchronised. Callers sharing it between
//! threads serialise access themselves; only [`CompletionCounter`] is meant to
//! be handed to another context.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
mod device;
mod error;
pub mod handshake;
pub mod mmio;
pub mod pipeline;
pub mod placement;
pub mod regs;
pub mod transfer;

pub use config::{AddressMap, DeviceConfig};
pub use device::XgemmDevice;
pub use error::{ErrorClass, Result, XgemmError};
pub use handshake::{CompletionCounter, CompletionMode, Dims, Phase, PollPolicy, Strides};
pub use pipeline::PortTable;
pub use placement::{split, AddressSpace, OperandLayout, Placement};

/// Accelerator model types (re-exported from xgemm-chip).
pub mod chip {
    pub use xgemm_chip::fixed::{Fixed, QFormat};
    pub use xgemm_chip::layout::{limits, zynq, Port, Window, WindowId};
    pub use xgemm_chip::regs::{ProtocolFlavor, RegisterMap};
}

/// Commonly used types.
pub mod prelude {
    pub use crate::chip::{Port, ProtocolFlavor, QFormat, WindowId};
    pub use crate::{
        CompletionCounter, CompletionMode, DeviceConfig, Dims, PollPolicy, Result, Strides,
        XgemmDevice, XgemmError,
    };
}
