// SPDX-License-Identifier: AGPL-3.0-only

//! Software stand-in for the accelerator
//!
//! A temp file laid out like physical memory: one page per window. The driver
//! maps it through `mem_path`; the fabric maps the same file a second time
//! and plays the hardware side by reading the command registers, computing
//! in fixed point and raising the status bits.

#![allow(dead_code)]

use std::path::Path;
use tempfile::NamedTempFile;
use xgemm_chip::fixed::QFormat;
use xgemm_chip::layout::{Port, Window, WindowId};
use xgemm_chip::reference;
use xgemm_chip::regs::{ProtocolFlavor, RegisterMap};
use xgemm_driver::mmio::MappedRegion;
use xgemm_driver::{AddressMap, DeviceConfig, PollPolicy};

/// Status polls allowed before a wait reports a timeout
pub const SPINS: u64 = 10_000;

pub struct Fabric {
    file: NamedTempFile,
    mem: MappedRegion,
    pub layout: AddressMap,
    pub map: RegisterMap,
    pub q: QFormat,
}

impl Fabric {
    /// Fabric whose A window holds `a_bytes`; every other window is one page
    pub fn new(flavor: ProtocolFlavor, a_bytes: usize) -> Self {
        let page = rustix::param::page_size();
        let window = |slot: usize, size: usize| Window::new((slot * page) as u64, size);
        let layout = AddressMap {
            control: window(0, page),
            a: window(1, a_bytes),
            b0: window(2, page),
            b1: window(3, page),
            c0: window(4, page),
            c1: window(5, page),
        };

        let file = NamedTempFile::new().expect("temp file");
        file.as_file().set_len((6 * page) as u64).expect("set_len");
        let mem = MappedRegion::map(file.as_file(), WindowId::Control, Window::new(0, 6 * page))
            .expect("fabric mapping");

        Self {
            file,
            mem,
            layout,
            map: RegisterMap::for_flavor(flavor),
            q: QFormat::Q9,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Driver configuration pointing at this fabric
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig::default()
            .with_mem_path(self.path())
            .with_layout(self.layout)
            .with_flavor(self.map.flavor)
            .with_poll(PollPolicy::spins(SPINS))
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.mem.read32(self.layout.control.base as usize + offset)
    }

    pub fn set_reg(&mut self, offset: usize, value: u32) {
        self.mem.write32(self.layout.control.base as usize + offset, value);
    }

    fn ureg(&self, offset: usize) -> usize {
        self.reg(offset) as usize
    }

    /// Core idle, ready for a start
    pub fn set_idle(&mut self) {
        let (offset, mask) = (self.map.status, self.map.idle_mask);
        self.set_reg(offset, mask);
    }

    /// Drop the ready bits the way the core does when it samples a start
    pub fn accept_start(&mut self) {
        if self.map.flavor == ProtocolFlavor::SelfClear {
            self.set_reg(self.map.status, 0);
        }
    }

    pub fn started(&self) -> bool {
        self.reg(self.map.control) & self.map.start_mask != 0
    }

    /// Raise done (and idle)
    pub fn signal_done(&mut self) {
        let (offset, bits) = (self.map.status, self.map.idle_mask | self.map.done_mask);
        self.set_reg(offset, bits);
    }

    pub fn elem16(&self, window: WindowId, index: usize) -> i16 {
        self.mem.read(self.window(window).base as usize / 2 + index)
    }

    pub fn set_elem16(&mut self, window: WindowId, index: usize, value: i16) {
        let base = self.window(window).base as usize / 2;
        self.mem.write(base + index, value);
    }

    pub fn elem32(&self, window: WindowId, index: usize) -> i32 {
        self.mem.read(self.window(window).base as usize / 4 + index)
    }

    pub fn set_word(&mut self, window: WindowId, index: usize, value: u32) {
        let base = self.window(window).base as usize / 4;
        self.mem.write(base + index, value);
    }

    fn window(&self, id: WindowId) -> Window {
        self.layout.window(id)
    }

    /// File index of logical i16 element `i` in the `[A, B0]` operand space
    fn gemm_slot(&self, i: usize) -> usize {
        let a_cap = self.layout.a.size / 2;
        if i < a_cap {
            self.layout.a.base as usize / 2 + i
        } else {
            self.layout.b0.base as usize / 2 + (i - a_cap)
        }
    }

    fn gather(&self, start: usize, count: usize) -> Vec<i32> {
        (0..count)
            .map(|i| i32::from(self.mem.read::<i16>(self.gemm_slot(start + i))))
            .collect()
    }

    /// Run the whole-matrix core on the programmed registers: `C += A·B` in Q-format
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute_gemm(&mut self) {
        let map = self.map;
        let (m, n, k) = (self.ureg(map.m), self.ureg(map.n), self.ureg(map.k));
        let (ao, bo, co) = (self.ureg(map.a_offset), self.ureg(map.b_offset), self.ureg(map.c_offset));
        let (lda, ldb, ldc) = (self.ureg(map.lda), self.ureg(map.ldb), self.ureg(map.ldc));

        let a = self.gather(ao, m * lda);
        let b = self.gather(bo, k * ldb);
        let mut c = self.gather(co, m * ldc);
        let one = 1 << self.q.scale_bits();
        reference::gemm_nn_fx(self.q, m, n, k, one, &a, lda, &b, ldb, &mut c, ldc);

        for (i, value) in c.into_iter().enumerate() {
            let slot = self.gemm_slot(co + i);
            self.mem.write(slot, value as i16);
        }
    }

    /// Run the block core on the selected port: `C(port) += A·B(port)`, i32 accumulators
    pub fn compute_block(&mut self) {
        let map = self.map;
        let (m, n, k, s) = (self.ureg(map.m), self.ureg(map.n), self.ureg(map.k), self.ureg(map.s));
        let port = Port::from_index(self.ureg(map.port)).expect("port register holds 0 or 1");

        let a: Vec<i16> = (0..m * k).map(|i| self.elem16(WindowId::A, i)).collect();
        let b: Vec<i16> = (0..k * s).map(|i| self.elem16(WindowId::b(port), i)).collect();
        let mut c: Vec<i32> = (0..m * n).map(|i| self.elem32(WindowId::c(port), i)).collect();
        reference::gemm_acc(m, n, k, &a, k, &b, s, &mut c, n);

        let base = self.window(WindowId::c(port)).base as usize / 4;
        for (i, value) in c.into_iter().enumerate() {
            self.mem.write(base + i, value);
        }
    }

    pub fn finish_gemm(&mut self) {
        self.compute_gemm();
        self.signal_done();
    }

    pub fn finish_block(&mut self) {
        self.compute_block();
        self.signal_done();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic operand values
pub fn pattern(len: usize, seed: i32) -> Vec<i16> {
    (0..len)
        .map(|i| i16::try_from((i as i32 * 37 + seed * 11) % 401 - 200).expect("fits i16"))
        .collect()
}
