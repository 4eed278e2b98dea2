//! Lifecycle state shared between the engine and its handles.
//!
//! The engine task is the only writer. Handles read the state through the same
//! atomic cell, so callers can observe pauses and shutdown without a round
//! trip through the control channel.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Engine lifecycle: `Constructed → SetUp → Running ⇄ Paused → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineState {
    Constructed = 0,
    SetUp = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
    Stopped = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Constructed,
            1 => EngineState::SetUp,
            2 => EngineState::Running,
            3 => EngineState::Paused,
            4 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    /// Running or paused: the states `stop` acts on.
    pub fn is_active(self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Constructed => "constructed",
            EngineState::SetUp => "set up",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub(crate) fn new() -> Self {
        SharedState(Arc::new(AtomicU8::new(EngineState::Constructed as u8)))
    }

    pub(crate) fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}
