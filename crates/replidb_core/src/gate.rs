//! The apply gate separating live mutations from checkpoints.
//!
//! Every mutating operation holds a [`GateTicket`] from the moment it asks
//! the logger for an LSN until its effect is visible in the store. A
//! [`GatePause`] blocks new tickets and waits for the outstanding ones, so
//! while it is held every assigned LSN has been applied and no new LSN can
//! be assigned.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    paused: bool,
}

/// Counts in-flight mutations and lets one exclusive holder stop them.
#[derive(Debug, Default)]
pub struct ApplyGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ApplyGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutation, waiting while the gate is paused.
    pub fn enter(&self) -> GateTicket<'_> {
        let mut state = self.state.lock();
        while state.paused {
            self.changed.wait(&mut state);
        }
        state.in_flight += 1;
        GateTicket { gate: self }
    }

    /// Closes the gate and waits until no mutation is in flight.
    ///
    /// Pauses are exclusive: a second caller waits for the first to resume.
    pub fn pause(&self) -> GatePause<'_> {
        let mut state = self.state.lock();
        while state.paused {
            self.changed.wait(&mut state);
        }
        state.paused = true;
        while state.in_flight > 0 {
            self.changed.wait(&mut state);
        }
        GatePause { gate: self }
    }

    /// Number of mutations currently holding a ticket.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Returns true while a pause is held.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}

/// Proof that a mutation is in flight. Dropping it leaves the gate.
#[derive(Debug)]
#[must_use = "the mutation leaves the gate when the ticket is dropped"]
pub struct GateTicket<'a> {
    gate: &'a ApplyGate,
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.changed.notify_all();
        }
    }
}

/// Exclusive hold on a closed gate. Dropping it reopens the gate.
#[derive(Debug)]
#[must_use = "the gate reopens when the pause is dropped"]
pub struct GatePause<'a> {
    gate: &'a ApplyGate,
}

impl Drop for GatePause<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().paused = false;
        self.gate.changed.notify_all();
    }
}
