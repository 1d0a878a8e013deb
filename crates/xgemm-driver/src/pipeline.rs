// SPDX-License-Identifier: AGPL-3.0-only

//! Double-buffered block pipeline bookkeeping
//!
//! Two B/C buffer sets ("ports") alternate so the next block's B can be
//! written while the core consumes the other port:
//!
//! ```text
//!   write B0 ─ start P0 ──────── read C0 ─ write B0 ─ start P0 ...
//!                 └ write B1 ─────────────── start P1 ──────── read C1
//! ```
//!
//! At most one port is in flight. A port may be written whenever it is not
//! in flight; it may be started only after its B write finished and while no
//! other port is in flight. A is shared by both ports, so it may only change
//! while nothing is in flight.

use crate::error::{Result, XgemmError};
use xgemm_chip::layout::Port;

/// Lifecycle of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortState {
    /// B written since the last start on this port
    pub b_loaded: bool,
    /// Consumed by the running operation
    pub in_flight: bool,
    /// Results computed and not yet read back
    pub results_pending: bool,
}

/// State of both ports plus the shared A buffer
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    ports: [PortState; 2],
    a_loaded: bool,
}

impl PortTable {
    /// Both ports empty, A not loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `port`
    pub const fn state(&self, port: Port) -> PortState {
        self.ports[port.index()]
    }

    /// Whether A has been written
    pub const fn a_loaded(&self) -> bool {
        self.a_loaded
    }

    /// The port currently being computed on, if any
    pub fn in_flight(&self) -> Option<Port> {
        Port::ALL.into_iter().find(|p| self.ports[p.index()].in_flight)
    }

    /// Check that A may be overwritten
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] while a block is in flight.
    pub fn check_a_writable(&self) -> Result<()> {
        match self.in_flight() {
            Some(port) => Err(XgemmError::protocol_misuse(format!(
                "A is shared by both ports and {port} is in flight"
            ))),
            None => Ok(()),
        }
    }

    /// Record a completed A write
    pub fn mark_a_written(&mut self) {
        self.a_loaded = true;
    }

    /// Check that `port`'s buffers may be written
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if `port` is in flight.
    pub fn check_writable(&self, port: Port) -> Result<()> {
        if self.ports[port.index()].in_flight {
            return Err(XgemmError::protocol_misuse(format!(
                "{port} is in flight and cannot be written"
            )));
        }
        Ok(())
    }

    /// Record a completed B write to `port`
    pub fn mark_b_written(&mut self, port: Port) {
        self.ports[port.index()].b_loaded = true;
        tracing::debug!("{port}: B loaded");
    }

    /// Check that a start may reference `port`
    ///
    /// `require_b` is false when B is loaded out of band.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::ProtocolMisuse`] if any port is in flight, A was
    /// never written, or `port`'s B write has not completed.
    pub fn check_startable(&self, port: Port, require_b: bool) -> Result<()> {
        if let Some(busy) = self.in_flight() {
            return Err(XgemmError::protocol_misuse(format!(
                "cannot start {port} while {busy} is in flight"
            )));
        }
        if !self.a_loaded {
            return Err(XgemmError::protocol_misuse("A has not been loaded"));
        }
        if require_b && !self.ports[port.index()].b_loaded {
            return Err(XgemmError::protocol_misuse(format!(
                "{port} B write has not completed"
            )));
        }
        Ok(())
    }

    /// Record a start on `port`; its B is consumed
    pub fn mark_started(&mut self, port: Port) {
        let state = &mut self.ports[port.index()];
        state.in_flight = true;
        state.b_loaded = false;
        state.results_pending = false;
        tracing::debug!("{port}: in flight");
    }

    /// Record that the in-flight port finished
    pub fn mark_completed(&mut self) -> Option<Port> {
        let port = self.in_flight()?;
        let state = &mut self.ports[port.index()];
        state.in_flight = false;
        state.results_pending = true;
        tracing::debug!("{port}: completed");
        Some(port)
    }

    /// Record that `port`'s results were read back
    pub fn mark_drained(&mut self, port: Port) {
        self.ports[port.index()].results_pending = false;
    }

    /// Forget everything (after a hard reset)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> PortTable {
        let mut table = PortTable::new();
        table.mark_a_written();
        table
    }

    #[test]
    fn other_port_writable_while_one_in_flight() {
        let mut table = loaded();
        table.mark_b_written(Port::P0);
        table.check_startable(Port::P0, true).unwrap();
        table.mark_started(Port::P0);

        table.check_writable(Port::P1).unwrap();
        table.mark_b_written(Port::P1);
        assert!(table.check_writable(Port::P0).unwrap_err().is_protocol_misuse());
        assert!(table.check_a_writable().is_err());
    }

    #[test]
    fn start_needs_completed_b_write() {
        let mut table = loaded();
        assert!(table.check_startable(Port::P1, true).unwrap_err().is_protocol_misuse());
        table.check_startable(Port::P1, false).unwrap();
        table.mark_b_written(Port::P1);
        table.check_startable(Port::P1, true).unwrap();
    }

    #[test]
    fn only_one_port_in_flight() {
        let mut table = loaded();
        table.mark_b_written(Port::P0);
        table.mark_b_written(Port::P1);
        table.mark_started(Port::P0);
        assert!(table.check_startable(Port::P1, true).is_err());

        assert_eq!(table.mark_completed(), Some(Port::P0));
        assert!(table.state(Port::P0).results_pending);
        table.check_startable(Port::P1, true).unwrap();
    }

    #[test]
    fn start_consumes_b() {
        let mut table = loaded();
        table.mark_b_written(Port::P0);
        table.mark_started(Port::P0);
        table.mark_completed();
        table.mark_drained(Port::P0);
        assert_eq!(table.state(Port::P0), PortState::default());
        assert!(table.check_startable(Port::P0, true).is_err());
    }

    #[test]
    fn a_required_before_start() {
        let mut table = PortTable::new();
        table.mark_b_written(Port::P0);
        assert!(table.check_startable(Port::P0, true).is_err());
        table.reset();
        assert!(!table.a_loaded());
    }
}
