//! Cluster membership and liveness core.
//!
//! Five components, wired together by [`monitor::Monitor`]:
//!
//! - [`connectivity`]: per-peer reachability, local and gossiped.
//! - [`clique`]: deterministic maximum-clique search over the symmetrised
//!   connectivity matrix.
//! - [`referee`]: the external split-brain tie-breaker, consulted only on a
//!   genuine even split.
//! - [`state`]: the [`MembershipState`] data and the [`Membership`] state
//!   machine guarding it behind one lock.
//! - [`monitor`]: the background task driving the other four and answering
//!   `txreq`/`txresp` polls.
//! - [`durable`]: collaborator traits for the two durable stores the core
//!   depends on (the referee-decision cache and the control file), plus
//!   `redb`- and `sqlx`-backed reference implementations.

pub mod clique;
pub mod connectivity;
pub mod durable;
pub mod monitor;
pub mod referee;
pub mod state;

pub use connectivity::ConnectivityTracker;
pub use durable::{ControlFile, RefereeStore, StoreError, TwoPhaseStore};
pub use monitor::{execute_actions, refresh_cluster_status, Monitor, MonitorConfig, MonitorShared};
pub use referee::{RefereeClient, RefereeError, RefereeTransport};
pub use state::{Event, Membership, MembershipState, NeighborEvent, PendingAction, StateSnapshot};

pub use crate::traits::ReceiverStartHook;
