//! Topology lifecycle state machine
//!
//! Declared -> Validated -> Active -> Destroyed, with Rejected reachable from
//! Declared (validation failure) and Validated (failed or cancelled realize).
//! Rejected and Destroyed are terminal.

use std::fmt;

use state_machines::state_machine;

state_machine! {
    name: TopologyMachine,
    dynamic: true,
    initial: Declared,
    states: [Declared, Validated, Active, Destroyed, Rejected],
    events {
        validate {
            transition: { from: Declared, to: Validated }
        }
        reject {
            transition: { from: [Declared, Validated], to: Rejected }
        }
        activate {
            transition: { from: Validated, to: Active }
        }
        destroy {
            transition: { from: Active, to: Destroyed }
        }
    }
}

/// Lifecycle state for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Declared,
    Validated,
    Active,
    Destroyed,
    Rejected,
}

impl Lifecycle {
    /// Parse the machine's state name
    pub fn from_state(s: &str) -> Self {
        match s {
            "Validated" => Lifecycle::Validated,
            "Active" => Lifecycle::Active,
            "Destroyed" => Lifecycle::Destroyed,
            "Rejected" => Lifecycle::Rejected,
            _ => Lifecycle::Declared,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Declared => "Declared",
            Lifecycle::Validated => "Validated",
            Lifecycle::Active => "Active",
            Lifecycle::Destroyed => "Destroyed",
            Lifecycle::Rejected => "Rejected",
        }
    }

    /// No further transitions are possible
    #[allow(dead_code)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Destroyed | Lifecycle::Rejected)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fresh machine in the Declared state
pub fn new_machine() -> DynamicTopologyMachine<()> {
    TopologyMachine::new(()).into_dynamic()
}
