// SPDX-License-Identifier: AGPL-3.0-only

//! Start / completion handshake
//!
//! ```text
//!   Idle ──start──▶ Busy ──done observed──▶ Done ──complete──▶ Idle
//! ```
//!
//! Completion is detected one of two ways:
//!
//! - **Polling**: spin on the status register's done bit. The HLS block clears
//!   done on read, so an observed done is latched host-side until consumed.
//! - **Notification count**: an asynchronous context (interrupt forwarder,
//!   signal handler thread) calls [`CompletionCounter::notify`] once per device
//!   interrupt. Consuming a completion decrements the count by one, never below
//!   zero, so completions that land while nobody is waiting are kept.
//!
//! Spinning is bounded by a [`PollPolicy`]; an unbounded policy spins forever,
//! exactly like the hardware reference code.

use crate::error::{Result, XgemmError};
use crate::regs::{RegisterFile, StatusBits};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xgemm_chip::layout::Port;

/// Count of device completions not yet claimed by the host
///
/// Cheap to clone; all clones share one counter. One producer (the
/// notification context) and one consumer (the thread driving the device).
#[derive(Debug, Clone, Default)]
pub struct CompletionCounter(Arc<AtomicU32>);

impl CompletionCounter {
    /// Counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one device completion
    pub fn notify(&self) {
        let pending = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!("Completion notified, {pending} pending");
    }

    /// Completions not yet consumed
    pub fn pending(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Claim one completion. Returns `false` (and leaves the count at zero) if none was pending.
    pub fn try_consume(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Drop every pending completion
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// How completion is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Spin on the status register
    #[default]
    Polling,
    /// Count asynchronous notifications
    NotificationCount,
}

/// Bound on busy-wait loops
///
/// Both limits unset means spin until the device answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollPolicy {
    /// Maximum status reads
    pub max_spins: Option<u64>,
    /// Maximum wall-clock time
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Spin forever
    pub const UNBOUNDED: Self = Self {
        max_spins: None,
        timeout: None,
    };

    /// Give up after `spins` status reads
    pub const fn spins(spins: u64) -> Self {
        Self {
            max_spins: Some(spins),
            timeout: None,
        }
    }

    /// Give up after `timeout`
    pub const fn timeout(timeout: Duration) -> Self {
        Self {
            max_spins: None,
            timeout: Some(timeout),
        }
    }

    /// Whether a wait that has done `spins` reads since `started` must stop
    fn expired(&self, spins: u64, started: Instant) -> bool {
        self.max_spins.is_some_and(|max| spins >= max)
            || self.timeout.is_some_and(|t| started.elapsed() >= t)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn timeout_error(spins: u64, started: Instant) -> XgemmError {
        XgemmError::Timeout {
            waited_ms: started.elapsed().as_millis() as u64,
            spins,
        }
    }
}

/// Host-side view of the operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing started, or last completion consumed
    Idle,
    /// Start pulse issued, completion not yet observed
    Busy,
    /// Completion observed, not yet consumed
    Done,
}

/// GEMM dimensions: C (m×n) = A (m×k) · B (k×n)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    /// Rows of A and C
    pub m: usize,
    /// Columns of B and C
    pub n: usize,
    /// Columns of A, rows of B
    pub k: usize,
}

impl Dims {
    /// Create dimensions
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

/// Leading dimensions, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    /// Row stride of A
    pub lda: usize,
    /// Row stride of B
    pub ldb: usize,
    /// Row stride of C
    pub ldc: usize,
}

impl Strides {
    /// Densely packed row-major operands
    pub const fn packed(dims: Dims) -> Self {
        Self {
            lda: dims.k,
            ldb: dims.n,
            ldc: dims.n,
        }
    }
}

/// Everything written to the register file ahead of one start pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// M, N, K
    pub dims: Dims,
    /// Block edge S (block core only)
    pub block: Option<usize>,
    /// Port to consume (block core only)
    pub port: Option<Port>,
    /// A/B/C base offsets in the shared operand space
    pub offsets: Option<[usize; 3]>,
    /// Leading dimensions
    pub strides: Option<Strides>,
}

/// Handshake state machine for one accelerator
#[derive(Debug)]
pub struct Handshake {
    mode: CompletionMode,
    counter: CompletionCounter,
    phase: Phase,
    starts: u64,
}

impl Handshake {
    /// New handshake in `Idle`
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            counter: CompletionCounter::new(),
            phase: Phase::Idle,
            starts: 0,
        }
    }

    /// Completion detection strategy
    pub const fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Current phase
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Start pulses issued since creation
    pub const fn starts(&self) -> u64 {
        self.starts
    }

    /// Handle for the notification context
    pub fn counter(&self) -> CompletionCounter {
        self.counter.clone()
    }

    /// Sample the device and latch a completion if one is visible
    pub fn observe(&mut self, regs: &RegisterFile<'_>) -> StatusBits {
        let status = regs.status();
        if self.phase == Phase::Busy {
            let done = match self.mode {
                CompletionMode::Polling => status.done,
                CompletionMode::NotificationCount => self.counter.pending() > 0,
            };
            if done {
                tracing::debug!("Completion observed (status {:#x})", status.raw);
                self.phase = Phase::Done;
            }
        }
        status
    }

    /// Ready to accept a new start: no operation outstanding and the device reports idle
    pub fn is_ready(&mut self, regs: &RegisterFile<'_>) -> bool {
        let status = self.observe(regs);
        self.phase != Phase::Busy && status.idle
    }

    /// An operation has finished and its completion is not yet consumed
    pub fn is_done(&mut self, regs: &RegisterFile<'_>) -> bool {
        self.observe(regs);
        self.phase == Phase::Done
    }

    /// Write the command registers, then raise start
    ///
    /// The register order is fixed: dimensions, block, port, offsets,
    /// strides, and only then the start bit. A completed-but-unconsumed
    /// operation is consumed first.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if an operation is still in
    /// flight, or [`XgemmError::InvalidDimensions`] if a value does not fit a
    /// 32-bit register.
    pub fn start(&mut self, regs: &mut RegisterFile<'_>, cmd: &Command) -> Result<()> {
        self.observe(regs);
        match self.phase {
            Phase::Busy => {
                return Err(XgemmError::protocol_misuse(
                    "start issued while the previous operation is in flight",
                ));
            }
            Phase::Done => {
                tracing::debug!("Consuming unclaimed completion before restart");
                self.complete();
            }
            Phase::Idle => {}
        }

        regs.set_dims(reg("m", cmd.dims.m)?, reg("n", cmd.dims.n)?, reg("k", cmd.dims.k)?);
        if let Some(s) = cmd.block {
            regs.set_block(reg("s", s)?);
        }
        if let Some(port) = cmd.port {
            regs.set_port(port);
        }
        if let Some([a, b, c]) = cmd.offsets {
            regs.set_offsets(reg("a_offset", a)?, reg("b_offset", b)?, reg("c_offset", c)?);
        }
        if let Some(st) = cmd.strides {
            regs.set_strides(reg("lda", st.lda)?, reg("ldb", st.ldb)?, reg("ldc", st.ldc)?);
        }
        regs.pulse_start();

        self.phase = Phase::Busy;
        self.starts += 1;
        tracing::debug!(
            "Start #{}: m={} n={} k={} s={:?} port={:?}",
            self.starts,
            cmd.dims.m,
            cmd.dims.n,
            cmd.dims.k,
            cmd.block,
            cmd.port
        );
        Ok(())
    }

    /// Spin until the device reports idle
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::Timeout`] when `policy` runs out.
    pub fn wait_ready(&mut self, regs: &RegisterFile<'_>, policy: PollPolicy) -> Result<()> {
        let started = Instant::now();
        let mut spins = 0;
        loop {
            if self.is_ready(regs) {
                return Ok(());
            }
            spins += 1;
            if policy.expired(spins, started) {
                return Err(PollPolicy::timeout_error(spins, started));
            }
            std::hint::spin_loop();
        }
    }

    /// Spin until the outstanding operation completes
    ///
    /// Returns immediately if nothing is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::Timeout`] when `policy` runs out.
    pub fn wait_done(&mut self, regs: &RegisterFile<'_>, policy: PollPolicy) -> Result<()> {
        let started = Instant::now();
        let mut spins = 0;
        loop {
            self.observe(regs);
            if self.phase != Phase::Busy {
                return Ok(());
            }
            spins += 1;
            if policy.expired(spins, started) {
                return Err(PollPolicy::timeout_error(spins, started));
            }
            std::hint::spin_loop();
        }
    }

    /// Consume the observed completion and return to `Idle`
    ///
    /// In notification mode this claims exactly one notification.
    pub fn complete(&mut self) {
        if self.phase == Phase::Done && self.mode == CompletionMode::NotificationCount {
            self.counter.try_consume();
        }
        self.phase = Phase::Idle;
    }

    /// Hard reset: device back to idle, in-flight work and pending completions dropped
    pub fn reset(&mut self, regs: &mut RegisterFile<'_>) {
        regs.reset();
        self.counter.clear();
        self.phase = Phase::Idle;
        tracing::info!("Accelerator reset");
    }
}

fn reg(name: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| XgemmError::invalid_dimensions(format!("{name}={value} does not fit a 32-bit register")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::MappedRegion;
    use xgemm_chip::layout::{Window, WindowId};
    use xgemm_chip::regs::{ap_ctrl, RegisterMap};

    #[test]
    fn counter_never_goes_negative() {
        for deliveries in 0..6u32 {
            for consumptions in 0..9u32 {
                let counter = CompletionCounter::new();
                for _ in 0..deliveries {
                    counter.notify();
                }
                let claimed = (0..consumptions).filter(|_| counter.try_consume()).count();
                assert_eq!(counter.pending(), deliveries.saturating_sub(consumptions));
                assert_eq!(claimed as u32, deliveries.min(consumptions));
            }
        }
    }

    #[test]
    fn counter_clones_share_state() {
        let counter = CompletionCounter::new();
        let notifier = counter.clone();
        std::thread::spawn(move || notifier.notify()).join().unwrap();
        assert_eq!(counter.pending(), 1);
    }

    #[test]
    fn policy_expiry() {
        let now = Instant::now();
        assert!(!PollPolicy::UNBOUNDED.expired(u64::MAX, now));
        assert!(PollPolicy::spins(3).expired(3, now));
        assert!(!PollPolicy::spins(3).expired(2, now));
        assert!(PollPolicy::timeout(Duration::ZERO).expired(0, now));
    }

    fn control() -> (std::fs::File, MappedRegion) {
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x1000).unwrap();
        let region = MappedRegion::map(&file, WindowId::Control, Window::new(0, 0x1000)).unwrap();
        (file, region)
    }

    #[test]
    fn polling_cycle() {
        let (_file, mut region) = control();
        region.write32(ap_ctrl::AP_CTRL, ap_ctrl::ctrl::AP_IDLE);
        let mut hs = Handshake::new(CompletionMode::Polling);
        let cmd = Command {
            dims: Dims::new(4, 4, 4),
            block: None,
            port: None,
            offsets: Some([0, 16, 32]),
            strides: Some(Strides::packed(Dims::new(4, 4, 4))),
        };

        {
            let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
            assert!(hs.is_ready(&regs));
            hs.start(&mut regs, &cmd).unwrap();
            assert_eq!(hs.phase(), Phase::Busy);
            assert_eq!(hs.starts(), 1);
            assert!(!hs.is_ready(&regs));
            assert!(hs.start(&mut regs, &cmd).unwrap_err().is_protocol_misuse());
            assert!(matches!(
                hs.wait_done(&regs, PollPolicy::spins(10)),
                Err(XgemmError::Timeout { spins: 10, .. })
            ));
        }

        // device finishes
        region.write32(ap_ctrl::AP_CTRL, ap_ctrl::ctrl::AP_IDLE | ap_ctrl::ctrl::AP_DONE);
        let regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        assert!(hs.is_done(&regs));
        assert!(hs.is_ready(&regs));
        hs.complete();
        assert_eq!(hs.phase(), Phase::Idle);
        assert!(!hs.is_done(&regs));
        assert_eq!(regs.read(ap_ctrl::B_OFFSET), 16);
        assert_eq!(regs.read(ap_ctrl::LDC), 4);
    }

    #[test]
    fn notification_cycle_keeps_early_completions() {
        let (_file, mut region) = control();
        region.write32(ap_ctrl::AP_CTRL, ap_ctrl::ctrl::AP_IDLE);
        let mut hs = Handshake::new(CompletionMode::NotificationCount);
        let notifier = hs.counter();
        let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        let cmd = Command {
            dims: Dims::new(8, 8, 8),
            block: Some(8),
            port: Some(Port::P0),
            offsets: None,
            strides: None,
        };

        hs.start(&mut regs, &cmd).unwrap();
        assert!(!hs.is_done(&regs));
        notifier.notify();
        notifier.notify();
        assert!(hs.is_done(&regs));
        hs.complete();
        assert_eq!(notifier.pending(), 1);

        hs.start(&mut regs, &cmd).unwrap();
        assert!(hs.is_done(&regs), "second completion arrived before the wait");
        hs.complete();
        assert_eq!(notifier.pending(), 0);
    }

    #[test]
    fn oversized_dimension_is_rejected_before_start() {
        let (_file, mut region) = control();
        let mut hs = Handshake::new(CompletionMode::Polling);
        let mut regs = RegisterFile::new(&mut region, RegisterMap::AP_CTRL);
        let cmd = Command {
            dims: Dims::new(usize::MAX, 1, 1),
            block: None,
            port: None,
            offsets: None,
            strides: None,
        };
        assert!(hs.start(&mut regs, &cmd).is_err());
        assert_eq!(hs.phase(), Phase::Idle);
        assert_eq!(regs.read(ap_ctrl::AP_CTRL) & ap_ctrl::ctrl::AP_START, 0);
    }
}
