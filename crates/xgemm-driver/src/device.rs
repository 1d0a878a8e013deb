// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator session handle
//!
//! [`XgemmDevice::initialize`] opens the memory file and maps every window;
//! [`XgemmDevice::shutdown`] (or drop) unmaps them in reverse order. Once
//! shut down, every operation logs a warning and does nothing.
//!
//! Two ways to drive the core:
//!
//! - **Whole matrix** ([`XgemmDevice::submit_gemm`]): A, B and C are packed
//!   back to back into the configured `gemm_space`, the base-offset and stride
//!   registers point the core at them, and [`XgemmDevice::read_result`] with
//!   `port = None` gathers C.
//! - **Block** ([`XgemmDevice::submit_block`]): `S×S` blocks in Q-format `i16`,
//!   with B and the `i32` C accumulators double buffered over two ports.

use crate::config::DeviceConfig;
use crate::error::{Result, XgemmError};
use crate::handshake::{CompletionCounter, CompletionMode, Command, Dims, Handshake, Phase, Strides};
use crate::mmio::{Element, MappedRegion, RegionSet};
use crate::pipeline::PortTable;
use crate::placement::{OperandLayout, Placement};
use crate::regs::RegisterFile;
use crate::transfer;
use rustix::fs::OFlags;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use xgemm_chip::fixed::Fixed;
use xgemm_chip::layout::{limits, Port, WindowId};
use xgemm_chip::regs::RegisterMap;

/// Whole-matrix operation awaiting read-back
#[derive(Debug, Clone, Copy)]
struct GemmJob {
    dims: Dims,
    strides: Strides,
    layout: OperandLayout,
}

/// Open accelerator session
#[derive(Debug)]
pub struct XgemmDevice {
    config: DeviceConfig,
    map: RegisterMap,
    regions: RegionSet,
    file: Option<File>,
    handshake: Handshake,
    ports: PortTable,
    job: Option<GemmJob>,
}

impl XgemmDevice {
    /// Open the memory file and map every window
    ///
    /// Windows are mapped control first, then A, then each port's B and C.
    /// If `config.magic` is set, word 0 of the A window must hold it.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::InvalidConfig`] for a rejected configuration,
    /// [`XgemmError::ResourceUnavailable`] if the memory file cannot be opened,
    /// [`XgemmError::MapFailed`] if a window cannot be mapped, or
    /// [`XgemmError::DeviceNotPresent`] on a sentinel mismatch. Windows mapped
    /// before the failure are released.
    pub fn initialize(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!("Opening {}", config.mem_path.display());

        // SAFETY: OFlags::SYNC.bits() is a small positive flag value
        #[allow(clippy::cast_possible_wrap)]
        let sync_flag = OFlags::SYNC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open(&config.mem_path)
            .map_err(|e| XgemmError::resource_unavailable(&config.mem_path, e))?;

        let mut regions = RegionSet::new();
        for id in WindowId::ALL {
            regions.push(MappedRegion::map(&file, id, config.layout.window(id))?);
        }

        if let Some(expected) = config.magic {
            let found: u32 = regions.require(WindowId::A)?.read(0);
            if found != expected {
                return Err(XgemmError::DeviceNotPresent { expected, found });
            }
        }

        let map = config.register_map();
        if config.enable_interrupts {
            let mut regs = control(&mut regions, map)?;
            if regs.enable_interrupts() {
                tracing::debug!("ap_done interrupt enabled");
            } else {
                tracing::warn!("{} register block has no interrupt logic", config.flavor);
            }
        }

        tracing::info!(
            "Accelerator ready: {} protocol, {} windows mapped from {}",
            config.flavor,
            WindowId::ALL.len(),
            config.mem_path.display()
        );

        Ok(Self {
            handshake: Handshake::new(config.completion),
            map,
            config,
            regions,
            file: Some(file),
            ports: PortTable::new(),
            job: None,
        })
    }

    /// Whether the session is still open
    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Configuration the session was opened with
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Handshake phase as last observed
    pub const fn phase(&self) -> Phase {
        self.handshake.phase()
    }

    /// Port bookkeeping for the block core
    pub const fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Handle for the interrupt forwarder in notification-count mode
    ///
    /// Each call to [`CompletionCounter::notify`] records one device completion.
    pub fn completion_counter(&self) -> CompletionCounter {
        self.handshake.counter()
    }

    /// Ready to accept a new operation. `false` on a closed handle.
    pub fn is_ready(&mut self) -> bool {
        if !self.check_open("is_ready") {
            return false;
        }
        match control(&mut self.regions, self.map) {
            Ok(regs) => self.handshake.is_ready(&regs),
            Err(_) => false,
        }
    }

    /// The last operation finished and its result has not been read. `false` on a closed handle.
    pub fn is_done(&mut self) -> bool {
        if !self.check_open("is_done") {
            return false;
        }
        match control(&mut self.regions, self.map) {
            Ok(regs) => self.handshake.is_done(&regs),
            Err(_) => false,
        }
    }

    /// Spin until the outstanding operation finishes, bounded by the poll policy
    ///
    /// The completion stays unclaimed; [`XgemmDevice::read_result`] claims it.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::Timeout`] when the poll policy runs out.
    pub fn wait_done(&mut self) -> Result<()> {
        if !self.check_open("wait_done") {
            return Ok(());
        }
        let regs = control(&mut self.regions, self.map)?;
        self.handshake.wait_done(&regs, self.config.poll)
    }

    /// Place A, B and C back to back in the operand space and start the core
    ///
    /// Operands are row major with the given leading dimensions: `a` holds
    /// `m·lda` elements, `b` holds `k·ldb`, `c` holds `m·ldc`. B is copied
    /// only when `transfer_b` is configured and C only when `transfer_c` is;
    /// C's placement is reserved either way.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::InvalidDimensions`] for dimensions outside the
    /// core's limits or mismatched buffers, [`XgemmError::CapacityExceeded`]
    /// if the operands do not fit, [`XgemmError::Timeout`] if the core never
    /// becomes ready, or a transfer error.
    pub fn submit_gemm<T: Element>(
        &mut self,
        dims: Dims,
        a: &[T],
        b: &[T],
        c: &[T],
        strides: Strides,
    ) -> Result<()> {
        if !self.check_open("submit_gemm") {
            return Ok(());
        }
        let lens = [a.len(), b.len(), c.len()];
        let layout = self.prepare_gemm(dims, strides, lens, size_of::<T>())?;
        let verify = self.config.verify_writes;

        transfer::write_operand(&mut self.regions, &layout.a, a, verify)?;
        if self.config.transfer_b {
            transfer::write_operand(&mut self.regions, &layout.b, b, verify)?;
        }
        if self.config.transfer_c {
            transfer::write_operand(&mut self.regions, &layout.c, c, verify)?;
        }
        self.launch_gemm(dims, strides, layout)
    }

    /// [`XgemmDevice::submit_gemm`] on `f32` operands, encoded through the configured Q-format
    ///
    /// # Errors
    ///
    /// As [`XgemmDevice::submit_gemm`].
    pub fn submit_gemm_f32<T: Element + Fixed>(
        &mut self,
        dims: Dims,
        a: &[f32],
        b: &[f32],
        c: &[f32],
        strides: Strides,
    ) -> Result<()> {
        if !self.check_open("submit_gemm_f32") {
            return Ok(());
        }
        let lens = [a.len(), b.len(), c.len()];
        let layout = self.prepare_gemm(dims, strides, lens, size_of::<T>())?;
        let (q, verify) = (self.config.qformat, self.config.verify_writes);

        transfer::write_encoded::<T>(&mut self.regions, &layout.a, a, q, verify)?;
        if self.config.transfer_b {
            transfer::write_encoded::<T>(&mut self.regions, &layout.b, b, q, verify)?;
        }
        if self.config.transfer_c {
            transfer::write_encoded::<T>(&mut self.regions, &layout.c, c, q, verify)?;
        }
        self.launch_gemm(dims, strides, layout)
    }

    /// Copy an `s×k` block of A into the A window
    ///
    /// A is shared by both ports and stays valid across blocks until rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] while a block is in flight,
    /// [`XgemmError::InvalidDimensions`] or [`XgemmError::CapacityExceeded`]
    /// for a block that does not match or fit, or a transfer error.
    pub fn write_block_a(&mut self, k: usize, s: usize, a: &[i16]) -> Result<()> {
        if !self.check_open("write_block_a") {
            return Ok(());
        }
        let count = block_extent("A", s, limits::MAX_M, k, limits::MAX_K)?;
        self.retire();
        self.ports.check_a_writable()?;
        self.write_window(WindowId::A, "A", count, a)?;
        self.ports.mark_a_written();
        Ok(())
    }

    /// Copy a `k×s` block of B into `port`
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if `port` is in flight, or as
    /// [`XgemmDevice::write_block_a`].
    pub fn write_block_b(&mut self, k: usize, s: usize, b: &[i16], port: Port) -> Result<()> {
        if !self.check_open("write_block_b") {
            return Ok(());
        }
        let count = block_extent("B", k, limits::MAX_K, s, limits::MAX_N)?;
        self.retire();
        self.ports.check_writable(port)?;
        self.write_window(WindowId::b(port), "B", count, b)?;
        self.ports.mark_b_written(port);
        Ok(())
    }

    /// Preload `port`'s `m×n` accumulators
    ///
    /// Results still pending on `port` are discarded.
    ///
    /// # Errors
    ///
    /// As [`XgemmDevice::write_block_b`].
    pub fn write_block_c(&mut self, m: usize, n: usize, c: &[i32], port: Port) -> Result<()> {
        if !self.check_open("write_block_c") {
            return Ok(());
        }
        let count = block_extent("C", m, limits::MAX_M, n, limits::MAX_N)?;
        self.retire();
        self.ports.check_writable(port)?;
        self.write_window(WindowId::c(port), "C", count, c)?;
        self.ports.mark_drained(port);
        Ok(())
    }

    /// Start the block core on `port`
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if a block is in flight, A was
    /// never written, or `port`'s B write has not completed (when B transfer
    /// is enabled). Returns [`XgemmError::InvalidDimensions`] for a zero block
    /// edge or dimensions outside the core's limits.
    pub fn start_block(&mut self, dims: Dims, s: usize, port: Port) -> Result<()> {
        if !self.check_open("start_block") {
            return Ok(());
        }
        check_dims(dims)?;
        if s == 0 {
            return Err(XgemmError::invalid_dimensions("block edge S must be non-zero"));
        }
        self.retire();
        self.ports.check_startable(port, self.config.transfer_b)?;

        let cmd = Command {
            dims,
            block: Some(s),
            port: Some(port),
            offsets: None,
            strides: None,
        };
        let mut regs = control(&mut self.regions, self.map)?;
        self.handshake.start(&mut regs, &cmd)?;
        self.ports.mark_started(port);
        Ok(())
    }

    /// Write whichever block operands are given, then start `port`
    ///
    /// `None` leaves an operand as previously loaded: A held constant across
    /// a pipelined sequence, B written ahead with [`XgemmDevice::write_block_b`],
    /// C accumulating in place.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if a block is in flight or
    /// `port` has no completed B write, before any operand is written. Other
    /// errors as the individual writers and [`XgemmDevice::start_block`].
    #[allow(clippy::too_many_arguments)]
    pub fn submit_block(
        &mut self,
        dims: Dims,
        s: usize,
        a: Option<&[i16]>,
        b: Option<&[i16]>,
        c: Option<&[i32]>,
        port: Port,
    ) -> Result<()> {
        if !self.check_open("submit_block") {
            return Ok(());
        }
        self.retire();
        if let Some(busy) = self.ports.in_flight() {
            return Err(XgemmError::protocol_misuse(format!(
                "cannot submit on {port} while {busy} is in flight"
            )));
        }
        if b.is_none() && self.config.transfer_b && !self.ports.state(port).b_loaded {
            return Err(XgemmError::protocol_misuse(format!(
                "{port} B write has not completed"
            )));
        }

        if let Some(a) = a {
            self.write_block_a(dims.k, s, a)?;
        }
        if let Some(b) = b {
            self.write_block_b(dims.k, s, b, port)?;
        }
        if let Some(c) = c {
            self.write_block_c(dims.m, dims.n, c, port)?;
        }
        self.start_block(dims, s, port)
    }

    /// Wait for completion and copy an `m×n` result into `dest`
    ///
    /// With `port = None` this reads the C operand of the last
    /// [`XgemmDevice::submit_gemm`], honouring its `ldc`; `E` must have the
    /// element width that call used. With `Some(port)` it reads `port`'s
    /// accumulators, waiting first if `port` is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if no result is pending for the
    /// request, [`XgemmError::InvalidDimensions`] for a mismatched shape or
    /// element width, or [`XgemmError::Timeout`] while waiting.
    pub fn read_result<E: Element>(&mut self, m: usize, n: usize, dest: &mut [E], port: Option<Port>) -> Result<()> {
        if !self.check_open("read_result") {
            return Ok(());
        }
        let count = elements("result", m, n)?;
        check_buffer("result", dest.len(), count)?;
        match port {
            None => {
                let job = self.claim_gemm_result(m, n, size_of::<E>())?;
                let mut full = vec![E::zeroed(); job.layout.c.count()];
                transfer::read_operand(&self.regions, &job.layout.c, &mut full)?;
                gather_rows(&full, job.strides.ldc, n, dest);
            }
            Some(port) => {
                let placement = self.claim_port_result(count, port, size_of::<E>())?;
                transfer::read_operand(&self.regions, &placement, dest)?;
                self.ports.mark_drained(port);
            }
        }
        tracing::debug!("Read {m}x{n} result");
        Ok(())
    }

    /// [`XgemmDevice::read_result`] decoded through the configured Q-format
    ///
    /// Whole-matrix results are in the operand format; block accumulators
    /// carry twice the scale bits.
    ///
    /// # Errors
    ///
    /// As [`XgemmDevice::read_result`].
    pub fn read_result_f32<E: Element + Fixed>(
        &mut self,
        m: usize,
        n: usize,
        dest: &mut [f32],
        port: Option<Port>,
    ) -> Result<()> {
        if !self.check_open("read_result_f32") {
            return Ok(());
        }
        let count = elements("result", m, n)?;
        check_buffer("result", dest.len(), count)?;
        let q = self.config.qformat;
        match port {
            None => {
                let job = self.claim_gemm_result(m, n, size_of::<E>())?;
                let mut full = vec![0f32; job.layout.c.count()];
                transfer::read_decoded::<E>(&self.regions, &job.layout.c, &mut full, q)?;
                gather_rows(&full, job.strides.ldc, n, dest);
            }
            Some(port) => {
                let acc = q.accumulator().ok_or_else(|| {
                    XgemmError::invalid_config(format!(
                        "Q{} operands have no i32 accumulator format",
                        q.scale_bits()
                    ))
                })?;
                let placement = self.claim_port_result(count, port, size_of::<E>())?;
                transfer::read_decoded::<E>(&self.regions, &placement, dest, acc)?;
                self.ports.mark_drained(port);
            }
        }
        tracing::debug!("Read {m}x{n} result");
        Ok(())
    }

    /// Hard reset: core back to idle, in-flight work and all port state dropped
    ///
    /// # Errors
    ///
    /// Returns error only if the control window is not mapped.
    pub fn reset(&mut self) -> Result<()> {
        if !self.check_open("reset") {
            return Ok(());
        }
        let mut regs = control(&mut self.regions, self.map)?;
        self.handshake.reset(&mut regs);
        self.ports.reset();
        self.job = None;
        Ok(())
    }

    /// Every named control register and its value. Empty on a closed handle.
    ///
    /// On a map whose done bit clears on read, the handshake samples status
    /// first so the dump cannot swallow a completion.
    ///
    /// # Errors
    ///
    /// Returns error only if the control window is not mapped.
    pub fn registers(&mut self) -> Result<Vec<(&'static str, u32)>> {
        if !self.check_open("registers") {
            return Ok(Vec::new());
        }
        let regs = control(&mut self.regions, self.map)?;
        if self.map.done_clears_on_read {
            self.handshake.observe(&regs);
        }
        Ok(regs.snapshot())
    }

    /// Unmap every window, last mapped first, then close the memory file
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if !self.check_open("shutdown") {
            return;
        }
        self.regions.release();
        self.file = None;
        self.job = None;
        self.ports.reset();
        tracing::info!("Accelerator session closed ({})", self.config.mem_path.display());
    }

    fn check_open(&self, op: &str) -> bool {
        if self.is_open() {
            true
        } else {
            tracing::warn!("{op} on a closed accelerator handle, ignored");
            false
        }
    }

    /// Fold an observed block completion into the port table
    fn retire(&mut self) {
        if self.ports.in_flight().is_none() {
            return;
        }
        let Ok(regs) = control(&mut self.regions, self.map) else {
            return;
        };
        if self.handshake.is_done(&regs) {
            self.claim();
            self.ports.mark_completed();
        }
    }

    /// Consume the observed completion
    fn claim(&mut self) {
        self.handshake.complete();
        if self.handshake.mode() == CompletionMode::NotificationCount && self.config.enable_interrupts {
            if let Ok(mut regs) = control(&mut self.regions, self.map) {
                regs.acknowledge_interrupt();
            }
        }
    }

    fn write_window<T: Element>(&mut self, id: WindowId, name: &str, count: usize, src: &[T]) -> Result<()> {
        check_buffer(name, src.len(), count)?;
        let placement = self.config.window_space(id, size_of::<T>()).place(0, count)?;
        transfer::write_operand(&mut self.regions, &placement, src, self.config.verify_writes)
    }

    /// Check operand shapes, wait for the core and pack the operand space
    fn prepare_gemm(&mut self, dims: Dims, strides: Strides, lens: [usize; 3], elem_bytes: usize) -> Result<OperandLayout> {
        check_dims(dims)?;
        check_strides(dims, strides)?;
        check_buffer("A", lens[0], elements("A", dims.m, strides.lda)?)?;
        check_buffer("B", lens[1], elements("B", dims.k, strides.ldb)?)?;
        check_buffer("C", lens[2], elements("C", dims.m, strides.ldc)?)?;

        {
            let regs = control(&mut self.regions, self.map)?;
            self.handshake.wait_ready(&regs, self.config.poll)?;
        }
        self.config.gemm_address_space(elem_bytes).pack(0, lens)
    }

    fn launch_gemm(&mut self, dims: Dims, strides: Strides, layout: OperandLayout) -> Result<()> {
        let cmd = Command {
            dims,
            block: None,
            port: None,
            offsets: Some([layout.a.start(), layout.b.start(), layout.c.start()]),
            strides: Some(strides),
        };
        let mut regs = control(&mut self.regions, self.map)?;
        self.handshake.start(&mut regs, &cmd)?;
        self.job = Some(GemmJob { dims, strides, layout });
        Ok(())
    }

    /// Wait for the whole-matrix operation and take its job
    fn claim_gemm_result(&mut self, m: usize, n: usize, elem_bytes: usize) -> Result<GemmJob> {
        let Some(job) = self.job else {
            return Err(XgemmError::protocol_misuse("no whole-matrix result is pending"));
        };
        if (m, n) != (job.dims.m, job.dims.n) {
            return Err(XgemmError::invalid_dimensions(format!(
                "requested {m}x{n} result, submitted {}x{}",
                job.dims.m, job.dims.n
            )));
        }
        if elem_bytes != job.layout.elem_bytes {
            return Err(XgemmError::invalid_dimensions(format!(
                "result element is {elem_bytes} bytes, operands were {}",
                job.layout.elem_bytes
            )));
        }

        {
            let regs = control(&mut self.regions, self.map)?;
            self.handshake.wait_done(&regs, self.config.poll)?;
        }
        self.claim();
        self.job = None;
        Ok(job)
    }

    /// Wait out `port` if it is in flight and locate its pending accumulators
    fn claim_port_result(&mut self, count: usize, port: Port, elem_bytes: usize) -> Result<Placement> {
        if self.ports.in_flight() == Some(port) {
            {
                let regs = control(&mut self.regions, self.map)?;
                self.handshake.wait_done(&regs, self.config.poll)?;
            }
            self.claim();
            self.ports.mark_completed();
        }
        if !self.ports.state(port).results_pending {
            return Err(XgemmError::protocol_misuse(format!("{port} has no results pending")));
        }
        self.config.window_space(WindowId::c(port), elem_bytes).place(0, count)
    }
}

impl Drop for XgemmDevice {
    fn drop(&mut self) {
        if self.is_open() {
            self.shutdown();
        }
    }
}

fn control(regions: &mut RegionSet, map: RegisterMap) -> Result<RegisterFile<'_>> {
    Ok(RegisterFile::new(regions.require_mut(WindowId::Control)?, map))
}

/// Copy the first `n` elements of each `ldc`-strided row of `full` into `dest`
fn gather_rows<T: Copy>(full: &[T], ldc: usize, n: usize, dest: &mut [T]) {
    for (row, out) in dest.chunks_exact_mut(n).enumerate() {
        out.copy_from_slice(&full[row * ldc..row * ldc + n]);
    }
}

fn check_dims(dims: Dims) -> Result<()> {
    let Dims { m, n, k } = dims;
    if m == 0 || n == 0 || k == 0 {
        return Err(XgemmError::invalid_dimensions(format!("{m}x{n}x{k} has a zero dimension")));
    }
    if m > limits::MAX_M || n > limits::MAX_N || k > limits::MAX_K {
        return Err(XgemmError::invalid_dimensions(format!(
            "{m}x{n}x{k} exceeds the core limits {}x{}x{}",
            limits::MAX_M,
            limits::MAX_N,
            limits::MAX_K
        )));
    }
    Ok(())
}

fn check_strides(dims: Dims, strides: Strides) -> Result<()> {
    if strides.lda < dims.k || strides.ldb < dims.n || strides.ldc < dims.n {
        return Err(XgemmError::invalid_dimensions(format!(
            "strides {}/{}/{} too small for {}x{}x{}",
            strides.lda, strides.ldb, strides.ldc, dims.m, dims.n, dims.k
        )));
    }
    Ok(())
}

/// `rows·cols` without overflow
fn elements(name: &str, rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols)
        .ok_or_else(|| XgemmError::invalid_dimensions(format!("{name}: {rows}x{cols} overflows")))
}

/// Element count of a `rows×cols` block, each edge non-zero and within its core limit
fn block_extent(name: &str, rows: usize, max_rows: usize, cols: usize, max_cols: usize) -> Result<usize> {
    if rows == 0 || cols == 0 || rows > max_rows || cols > max_cols {
        return Err(XgemmError::invalid_dimensions(format!(
            "{name} block {rows}x{cols} outside 1..={max_rows} x 1..={max_cols}"
        )));
    }
    elements(name, rows, cols)
}

fn check_buffer(name: &str, len: usize, expected: usize) -> Result<()> {
    if len == expected {
        Ok(())
    } else {
        Err(XgemmError::invalid_dimensions(format!(
            "{name} holds {len} elements, expected {expected}"
        )))
    }
}
