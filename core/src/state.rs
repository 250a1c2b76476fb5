//! Lifecycle states and the transition table shared by every runner
//!
//! Runners and master-side worker proxies never assign a state directly;
//! they apply an [`Event`] and the table in [`State::on`] decides the next
//! state. Pairs missing from the table are rejected.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{SwarmError, SwarmResult};

/// Lifecycle state of a runner or a connected worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    /// Registered or reset, nothing spawned
    Init = 1,
    /// Ramping users toward the target count
    Spawning = 2,
    /// Target reached, users executing tasks
    Running = 3,
    /// Stop requested, waiting for users to drain
    Stopping = 4,
    /// All users drained
    Stopped = 5,
    /// Terminal sign-off
    Quitting = 6,
    /// Lost contact (heartbeat timeout or repeated send failures)
    Missing = 7,
}

/// Something that happened to a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A run was requested
    Start,
    /// The spawn target was changed while running
    Rebalance,
    /// The ramp reached its target
    SpawnComplete,
    /// A stop was requested
    Stop,
    /// Every user finished after a stop
    Stopped,
    /// Terminal sign-off
    Quit,
    /// Liveness lost
    Lost,
    /// Connection re-established after being lost
    Reconnect,
}

impl State {
    /// Next state for `event`, or `None` when the pair is illegal
    pub fn on(self, event: Event) -> Option<State> {
        use Event as E;
        use State as S;

        match (self, event) {
            (S::Init | S::Stopped, E::Start) => Some(S::Spawning),
            (S::Spawning | S::Running, E::Rebalance) => Some(S::Spawning),
            (S::Spawning, E::SpawnComplete) => Some(S::Running),
            (S::Spawning | S::Running, E::Stop) => Some(S::Stopping),
            (S::Stopping, E::Stopped) => Some(S::Stopped),
            (S::Quitting, E::Quit | E::Lost) => None,
            (_, E::Quit) => Some(S::Quitting),
            (_, E::Lost) => Some(S::Missing),
            (S::Missing, E::Reconnect) => Some(S::Init),
            _ => None,
        }
    }

    /// Whether users are being spawned or executing
    pub fn is_starting(self) -> bool {
        matches!(self, State::Spawning | State::Running)
    }

    /// Whether the node can receive work (neither quitting nor missing)
    pub fn is_available(self) -> bool {
        !matches!(self, State::Quitting | State::Missing)
    }

    /// Whether the node is idle and ready for a new spawn
    pub fn is_ready(self) -> bool {
        matches!(self, State::Init | State::Stopped)
    }

    fn from_u8(value: u8) -> State {
        match value {
            1 => State::Init,
            2 => State::Spawning,
            3 => State::Running,
            4 => State::Stopping,
            5 => State::Stopped,
            6 => State::Quitting,
            _ => State::Missing,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Init => "init",
            State::Spawning => "spawning",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Quitting => "quitting",
            State::Missing => "missing",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding a [`State`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in `state`
    pub fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state
    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `event` atomically, returning the new state
    ///
    /// # Errors
    /// Returns [`SwarmError::InvalidTransition`] if the table has no entry
    /// for the current state and `event`; the state is left unchanged.
    pub fn apply(&self, event: Event) -> SwarmResult<State> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = State::from_u8(current);
            let to = from
                .on(event)
                .ok_or(SwarmError::InvalidTransition { from, event })?;
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(to),
                Err(actual) => current = actual,
            }
        }
    }

    /// Overwrite the state with a value reported by a remote peer
    ///
    /// Used on the master for states mirrored from worker heartbeats, where
    /// the worker already validated the transition.
    pub fn mirror(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(State::Init)
    }
}
