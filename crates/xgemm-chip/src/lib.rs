// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the FPGA GEMM accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the accelerator as the host sees it: the control register
//! maps of both protocol flavours, the physical window layout of the operand
//! and result buffers, the Q-format fixed-point wire encoding, and a software
//! reference GEMM used to check device output.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | AXI-Lite register offsets and bit definitions, [`regs::RegisterMap`] |
//! | [`layout`] | Physical windows (control, A, B0/B1, C0/C1), ports, dimension limits |
//! | [`fixed`] | Q-format encode/decode for `i16` / `i32` elements |
//! | [`reference`] | CPU reference GEMM in fixed point |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fixed;
pub mod layout;
pub mod reference;
pub mod regs;
