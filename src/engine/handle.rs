use super::state::{EngineState, SharedState};
use crate::error::SpiderError;
use kanal::Sender;
use std::fmt;

/// Commands delivered to the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Unpause,
    Stop(String),
}

/// Cloneable remote control for a running engine.
///
/// Commands are queued on an unbounded channel and applied by the engine loop
/// in order, so they never block and are safe to issue from spider callbacks.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<ControlCommand>,
    state: SharedState,
}

impl EngineHandle {
    pub(crate) fn new(commands: Sender<ControlCommand>, state: SharedState) -> Self {
        Self { commands, state }
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn pause(&self) -> Result<(), SpiderError> {
        self.send(ControlCommand::Pause)
    }

    pub fn unpause(&self) -> Result<(), SpiderError> {
        self.send(ControlCommand::Unpause)
    }

    pub fn stop(&self, reason: impl Into<String>) -> Result<(), SpiderError> {
        self.send(ControlCommand::Stop(reason.into()))
    }

    fn send(&self, command: ControlCommand) -> Result<(), SpiderError> {
        self.commands
            .send(command)
            .map_err(|_| SpiderError::GeneralError("engine is no longer accepting commands".to_string()))
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").field("state", &self.state()).finish()
    }
}
