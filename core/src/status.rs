//! Enumerations shared between the membership state machine and the wire
//! protocol: operational [`NodeStatus`] and two-phase-commit [`TxState`].

use serde::{Deserialize, Serialize};

/// Local operational status of a node, per the membership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Excluded from the quorum; replication senders/receivers are down.
    Disabled,
    /// Enabled but not yet caught up; replication connections are (re)starting.
    Recovery,
    /// Caught up on the control-file donor; waiting for receivers/senders to
    /// reach steady state before becoming `Online`.
    Recovered,
    /// Fully participating: may originate and accept committed writes.
    Online,
}

impl NodeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Disabled => "disabled",
            NodeStatus::Recovery => "recovery",
            NodeStatus::Recovered => "recovered",
            NodeStatus::Online => "online",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-transaction two-phase-commit state, as held in the durable
/// prepared-transaction log and reported over the `txreq`/`txresp` poll
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    NotFound,
    Prepared,
    PreCommitted,
    PreAborted,
    Committed,
    Aborted,
}

impl TxState {
    #[must_use]
    pub fn wire_code(self) -> u32 {
        match self {
            TxState::NotFound => 0,
            TxState::Prepared => 1,
            TxState::PreCommitted => 2,
            TxState::PreAborted => 3,
            TxState::Committed => 4,
            TxState::Aborted => 5,
        }
    }

    /// Decode a wire-level transaction-state code. Unknown codes are a
    /// protocol violation (spec §7): logged at the call site, not here.
    #[must_use]
    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TxState::NotFound),
            1 => Some(TxState::Prepared),
            2 => Some(TxState::PreCommitted),
            3 => Some(TxState::PreAborted),
            4 => Some(TxState::Committed),
            5 => Some(TxState::Aborted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_state_wire_code_roundtrip() {
        for state in [
            TxState::NotFound,
            TxState::Prepared,
            TxState::PreCommitted,
            TxState::PreAborted,
            TxState::Committed,
            TxState::Aborted,
        ] {
            assert_eq!(TxState::from_wire_code(state.wire_code()), Some(state));
        }
    }

    #[test]
    fn tx_state_unknown_code_is_none() {
        assert_eq!(TxState::from_wire_code(99), None);
    }

    #[test]
    fn node_status_display() {
        assert_eq!(NodeStatus::Recovered.to_string(), "recovered");
    }
}
