//! Gate motion state machines.
//!
//! A gate cycles `Closed → Opening → Open → Closing → Closed`. Motion and the
//! auto-close delay are modelled as a single pending timer holding an absolute
//! deadline; the owner calls [`Gate::advance`] with the current time to fire
//! whatever has come due. Cancelling a timer is dropping it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// Social (pedestrian) gate, opened by facial recognition.
    Pedestrian,
    /// Garage gate, opened by plate recognition.
    Vehicle,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Pedestrian => "pedestrian",
            GateKind::Vehicle => "vehicle",
        }
    }

    pub fn parse(s: &str) -> Option<GateKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pedestrian" | "social" => Some(GateKind::Pedestrian),
            "vehicle" | "garage" => Some(GateKind::Vehicle),
            _ => None,
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Closed => "closed",
            GateState::Opening => "opening",
            GateState::Open => "open",
            GateState::Closing => "closing",
        }
    }
}

/// Motion timings for one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateTiming {
    /// Time to finish opening or closing.
    pub travel: Duration,
    /// Time the gate stays open before closing on its own.
    pub auto_close: Duration,
}

impl GateTiming {
    pub const fn pedestrian() -> Self {
        Self {
            travel: Duration::from_millis(2_500),
            auto_close: Duration::from_secs(12),
        }
    }

    pub const fn vehicle() -> Self {
        Self {
            travel: Duration::from_secs(4),
            auto_close: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    FinishOpening { at: u64 },
    AutoClose { at: u64 },
    FinishClosing { at: u64 },
}

impl Timer {
    fn at(&self) -> u64 {
        match *self {
            Timer::FinishOpening { at } | Timer::AutoClose { at } | Timer::FinishClosing { at } => at,
        }
    }
}

/// One state change, as reported by [`Gate::advance`] and the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateTransition {
    pub gate: GateKind,
    pub from: GateState,
    pub to: GateState,
    pub at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Gate {
    kind: GateKind,
    timing: GateTiming,
    state: GateState,
    timer: Option<Timer>,
}

impl Gate {
    pub fn new(kind: GateKind, timing: GateTiming) -> Self {
        Self {
            kind,
            timing,
            state: GateState::Closed,
            timer: None,
        }
    }

    pub fn kind(&self) -> GateKind {
        self.kind
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn timing(&self) -> GateTiming {
        self.timing
    }

    /// Deadline of the pending timer, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timer.map(|t| t.at())
    }

    /// Start opening. Ignored unless the gate is closed.
    pub fn open(&mut self, now_ms: u64) -> Option<GateTransition> {
        if self.state != GateState::Closed {
            tracing::debug!(gate = %self.kind, state = self.state.as_str(), "open ignored");
            return None;
        }
        self.timer = Some(Timer::FinishOpening {
            at: now_ms.saturating_add(millis(self.timing.travel)),
        });
        Some(self.transition(GateState::Opening, now_ms))
    }

    /// Start closing and cancel the auto-close. Ignored unless the gate is open.
    pub fn close(&mut self, now_ms: u64) -> Option<GateTransition> {
        if self.state != GateState::Open {
            tracing::debug!(gate = %self.kind, state = self.state.as_str(), "close ignored");
            return None;
        }
        self.timer = Some(Timer::FinishClosing {
            at: now_ms.saturating_add(millis(self.timing.travel)),
        });
        Some(self.transition(GateState::Closing, now_ms))
    }

    /// Fire every timer due at or before `now_ms`, in order.
    ///
    /// Follow-up timers are scheduled from the deadline that fired, not from
    /// `now_ms`, so a late call replays the cycle exactly.
    pub fn advance(&mut self, now_ms: u64) -> Vec<GateTransition> {
        let mut fired = Vec::new();
        while let Some(timer) = self.timer.filter(|t| t.at() <= now_ms) {
            self.timer = None;
            match timer {
                Timer::FinishOpening { at } => {
                    self.timer = Some(Timer::AutoClose {
                        at: at.saturating_add(millis(self.timing.auto_close)),
                    });
                    fired.push(self.transition(GateState::Open, at));
                }
                Timer::AutoClose { at } => {
                    if let Some(t) = self.close(at) {
                        fired.push(t);
                    }
                }
                Timer::FinishClosing { at } => {
                    fired.push(self.transition(GateState::Closed, at));
                }
            }
        }
        fired
    }

    fn transition(&mut self, to: GateState, at_ms: u64) -> GateTransition {
        let from = self.state;
        self.state = to;
        GateTransition {
            gate: self.kind,
            from,
            to,
            at_ms,
        }
    }
}

/// The two gates of the building. They share nothing.
#[derive(Debug, Clone)]
pub struct Gates {
    pedestrian: Gate,
    vehicle: Gate,
}

impl Gates {
    pub fn new(pedestrian: GateTiming, vehicle: GateTiming) -> Self {
        Self {
            pedestrian: Gate::new(GateKind::Pedestrian, pedestrian),
            vehicle: Gate::new(GateKind::Vehicle, vehicle),
        }
    }

    pub fn get(&self, kind: GateKind) -> &Gate {
        match kind {
            GateKind::Pedestrian => &self.pedestrian,
            GateKind::Vehicle => &self.vehicle,
        }
    }

    pub fn get_mut(&mut self, kind: GateKind) -> &mut Gate {
        match kind {
            GateKind::Pedestrian => &mut self.pedestrian,
            GateKind::Vehicle => &mut self.vehicle,
        }
    }

    pub fn advance(&mut self, now_ms: u64) -> Vec<GateTransition> {
        let mut fired = self.pedestrian.advance(now_ms);
        fired.extend(self.vehicle.advance(now_ms));
        fired
    }

    /// Earliest pending deadline across both gates.
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.pedestrian.next_deadline(), self.vehicle.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for Gates {
    fn default() -> Self {
        Self::new(GateTiming::pedestrian(), GateTiming::vehicle())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
