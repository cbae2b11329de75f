//! Wire-level types for the cluster membership and liveness core.
//!
//! This crate holds everything that crosses a process boundary or gets
//! passed around by value between the membership components in `mm-node`:
//!
//! - **Node mask** ([`node_mask`]): `NodeId`, `NodeMask`, the fixed-width
//!   bitset used for disabled/connectivity/clique/receiver/sender sets.
//! - **Status** ([`status`]): `NodeStatus`, `TxState`.
//! - **Wire** ([`wire`]): the fixed-layout `ArbiterMessage` codec used on
//!   the `txreq`/`txresp` streams.
//!
//! Kept free of an async runtime dependency so it can be linked into both
//! the node process and any lightweight tooling that only needs to decode
//! the wire format.

pub mod node_mask;
pub mod status;
pub mod wire;

pub use node_mask::{bit_of, node_of_bit, NodeId, NodeMask, MAX_NODES};
pub use status::{NodeStatus, TxState};
pub use wire::{ArbiterMessage, WireError, CODE_EXTENSION_MIN, CODE_POLL_REQUEST, CODE_POLL_STATUS};
