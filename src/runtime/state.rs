//! Network lifecycle state machine
//!
//! Uses the state-machines crate in dynamic mode so transitions can be
//! driven from runtime events.

use crate::error::Error;
use state_machines::state_machine;
use std::fmt;

state_machine! {
    name: NetworkMachine,
    dynamic: true,
    initial: Built,
    states: [Built, Starting, Running, Stopping, Stopped, Failed],
    events {
        start {
            transition: { from: Built, to: Starting }
        }
        started {
            transition: { from: Starting, to: Running }
        }
        stop {
            transition: { from: [Running, Failed], to: Stopping }
        }
        stopped {
            transition: { from: Stopping, to: Stopped }
        }
        fail {
            transition: { from: [Starting, Running, Stopping], to: Failed }
        }
        abandon {
            transition: { from: Built, to: Stopped }
        }
    }
}

/// Lifecycle state of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Built,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl NetworkState {
    fn parse(s: &str) -> Self {
        match s {
            "Built" => NetworkState::Built,
            "Starting" => NetworkState::Starting,
            "Running" => NetworkState::Running,
            "Stopping" => NetworkState::Stopping,
            "Stopped" => NetworkState::Stopped,
            _ => NetworkState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkState::Built => "Built",
            NetworkState::Starting => "Starting",
            NetworkState::Running => "Running",
            NetworkState::Stopping => "Stopping",
            NetworkState::Stopped => "Stopped",
            NetworkState::Failed => "Failed",
        }
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrapper around the dynamic machine that maps rejected events to
/// `Error::InvalidTransition`
pub struct Lifecycle {
    machine: DynamicNetworkMachine<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: NetworkMachine::new(()).into_dynamic(),
        }
    }

    pub fn state(&self) -> NetworkState {
        NetworkState::parse(self.machine.current_state())
    }

    fn fire(&mut self, event: NetworkMachineEvent, name: &str) -> crate::error::Result<()> {
        let before = self.state();
        self.machine
            .handle(event)
            .map_err(|_| Error::InvalidTransition {
                event: name.to_string(),
                state: before.to_string(),
            })
    }

    pub fn start(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Start, "start")
    }

    pub fn started(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Started, "started")
    }

    pub fn stop(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Stop, "stop")
    }

    pub fn stopped(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Stopped, "stopped")
    }

    pub fn fail(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Fail, "fail")
    }

    pub fn abandon(&mut self) -> crate::error::Result<()> {
        self.fire(NetworkMachineEvent::Abandon, "abandon")
    }
}
