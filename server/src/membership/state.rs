//! The authoritative shared snapshot ([`MembershipState`]) and the state
//! machine that mutates it ([`Membership`]), guarded by a single
//! reader/writer lock (spec §4.4, §5).
//!
//! Every mutation path goes through one of the `apply_*` methods and ends
//! with [`Membership::check_state`] under the same lock. No collaborator
//! I/O happens while the lock is held: anything that needs to call the
//! resolver, the referee, or a durable store comes back from these methods
//! as a [`PendingAction`] the caller executes afterward.

use std::sync::Arc;

use mm_wire::node_mask::{bit_of, node_of_bit, NodeId, NodeMask};
use mm_wire::status::NodeStatus;
use parking_lot::RwLock;

use super::connectivity::ConnectivityTracker;

/// Work a `Membership` mutation discovered but could not perform itself,
/// because performing it needs I/O (the resolver, the referee's durable
/// store, the control file) and the membership lock must never be held
/// across an `.await` point (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Resolve in-doubt transactions touching exactly this node (a peer was
    /// just disabled while the local node was Online).
    ResolveFor(NodeId),
    /// Resolve in-doubt transactions cluster-wide.
    ResolveAll,
    /// Entering Recovered: persist `donor` as the recovery donor in the
    /// control file.
    PersistRecoveryDonor(NodeId),
    /// Entering Online: check whether a stale referee winner is cached
    /// without a current grant, and if so resolve cluster-wide and load it.
    CheckStaleReferee,
    /// `NONRECOVERABLE_ERROR`: the whole process group must shut down.
    Shutdown,
}

/// Events raised about a *peer* node (spec §4.4 "Neighbor events"). Never
/// raised about the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEvent {
    CliqueDisable,
    WalReceiverStart,
    WalSenderStartRecovery,
    WalSenderStartRecovered,
    RecoveryCaughtUp,
}

/// Events raised about the local node (spec §4.4 "Local events").
/// `RecoveryStart{1,2}` carry the donor node id: the spec names the event
/// but not how `recovery_slot` gets set, and the donor is the only piece of
/// information a recovery-start event could plausibly be carrying (see
/// DESIGN.md for this decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CliqueDisable,
    ArbiterReceiverStart,
    RecoveryStart1(NodeId),
    RecoveryStart2(NodeId),
    RecoveryFinish1,
    RecoveryFinish2,
    NonrecoverableError,
}

/// The fields of spec §3's data model table. Lives behind `Membership`'s
/// lock; never handed out by reference.
#[derive(Debug, Clone)]
pub struct MembershipState {
    pub self_id: NodeId,
    pub n_nodes: u32,
    pub status: NodeStatus,
    pub status_reason: String,
    pub disabled_mask: NodeMask,
    pub connectivity: ConnectivityTracker,
    pub clique: NodeMask,
    pub receiver_mask: NodeMask,
    pub sender_mask: NodeMask,
    pub stopped_mask: NodeMask,
    pub referee_winner_id: NodeId,
    pub referee_grant: bool,
    pub recovery_count: u64,
    pub recovery_slot: NodeId,
    pub node_timeline: Vec<u64>,
    pub major_node: bool,
}

impl MembershipState {
    fn new(self_id: NodeId, n_nodes: u32, major_node: bool) -> Self {
        let mut disabled_mask = NodeMask::EMPTY;
        disabled_mask.set(bit_of(self_id));
        MembershipState {
            self_id,
            n_nodes,
            status: NodeStatus::Disabled,
            status_reason: "node is disabled by default".to_string(),
            disabled_mask,
            connectivity: ConnectivityTracker::new(self_id, n_nodes),
            clique: NodeMask::all(n_nodes as usize),
            receiver_mask: NodeMask::EMPTY,
            sender_mask: NodeMask::EMPTY,
            stopped_mask: NodeMask::EMPTY,
            referee_winner_id: 0,
            referee_grant: false,
            recovery_count: 0,
            recovery_slot: 0,
            node_timeline: vec![0; n_nodes as usize],
            major_node,
        }
    }

    fn n_enabled(&self) -> u32 {
        self.disabled_mask.complement(self.n_nodes as usize).popcount()
    }

    fn n_connected(&self) -> u32 {
        self.connectivity.self_mask().complement(self.n_nodes as usize).popcount()
    }
}

/// A point-in-time copy of the scalar fields of [`MembershipState`], safe
/// to hold onto after the shared lock is released.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub self_id: NodeId,
    pub n_nodes: u32,
    pub status: NodeStatus,
    pub status_reason: String,
    pub disabled_mask: NodeMask,
    pub self_connectivity_mask: NodeMask,
    pub clique: NodeMask,
    pub receiver_mask: NodeMask,
    pub sender_mask: NodeMask,
    pub stopped_mask: NodeMask,
    pub referee_winner_id: NodeId,
    pub referee_grant: bool,
    pub recovery_count: u64,
    pub recovery_slot: NodeId,
    /// Per-peer generation counters, bumped on disable (spec §3
    /// `node_timeline`); carried in replication metadata by the (out of
    /// scope) sender/receiver to detect a resurrected node.
    pub node_timeline: Vec<u64>,
}

impl From<&MembershipState> for StateSnapshot {
    fn from(s: &MembershipState) -> Self {
        StateSnapshot {
            self_id: s.self_id,
            n_nodes: s.n_nodes,
            status: s.status,
            status_reason: s.status_reason.clone(),
            disabled_mask: s.disabled_mask,
            self_connectivity_mask: s.connectivity.self_mask(),
            clique: s.clique,
            receiver_mask: s.receiver_mask,
            sender_mask: s.sender_mask,
            stopped_mask: s.stopped_mask,
            referee_winner_id: s.referee_winner_id,
            referee_grant: s.referee_grant,
            recovery_count: s.recovery_count,
            recovery_slot: s.recovery_slot,
            node_timeline: s.node_timeline.clone(),
        }
    }
}

/// Owns the single reader/writer lock over [`MembershipState`] (spec §5)
/// and every event-handler entry point permitted to mutate it.
pub struct Membership {
    inner: RwLock<MembershipState>,
    receiver_hook: Arc<dyn super::ReceiverStartHook>,
}

impl Membership {
    #[must_use]
    pub fn new(self_id: NodeId, n_nodes: u32, major_node: bool, receiver_hook: Arc<dyn super::ReceiverStartHook>) -> Self {
        Membership {
            inner: RwLock::new(MembershipState::new(self_id, n_nodes, major_node)),
            receiver_hook,
        }
    }

    // -- accessors: shared lock, copy scalars out, release -----------------

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from(&*self.inner.read())
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.inner.read().status
    }

    #[must_use]
    pub fn self_id(&self) -> NodeId {
        self.inner.read().self_id
    }

    #[must_use]
    pub fn self_connectivity_mask(&self) -> NodeMask {
        self.inner.read().connectivity.self_mask()
    }

    #[must_use]
    pub fn clique(&self) -> NodeMask {
        self.inner.read().clique
    }

    #[must_use]
    pub fn build_matrix(&self) -> Vec<NodeMask> {
        self.inner.read().connectivity.build_matrix()
    }

    #[must_use]
    pub fn trivial_clique(&self) -> NodeMask {
        self.inner.read().connectivity.trivial_clique()
    }

    /// True iff connectivity currently splits the cluster exactly in half —
    /// the only condition under which the referee is consulted.
    #[must_use]
    pub fn half_split(&self) -> bool {
        let g = self.inner.read();
        g.n_connected() == g.n_nodes / 2
    }

    #[must_use]
    pub fn has_cached_referee_winner(&self) -> bool {
        self.inner.read().referee_winner_id != 0
    }

    /// True iff every node is enabled, status is Online, and a referee
    /// winner is cached — the sole condition under which the cached grant
    /// is cleared (spec §4.5 step 2b).
    #[must_use]
    pub fn should_clear_referee(&self) -> bool {
        let g = self.inner.read();
        g.referee_winner_id != 0 && g.n_enabled() == g.n_nodes && g.status == NodeStatus::Online
    }

    pub fn drop_referee_grant(&self) {
        let mut g = self.inner.write();
        g.referee_winner_id = 0;
        g.referee_grant = false;
        tracing::info!(node = g.self_id, "cleared cached referee decision");
    }

    pub fn stop_node(&self, node: NodeId) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        g.stopped_mask.set(bit_of(node));
        self.check_state(&mut g)
    }

    // -- connectivity ingress -----------------------------------------------

    pub fn on_peer_connect(&self, node: NodeId) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        g.connectivity.on_peer_connected(node);
        self.check_state(&mut g)
    }

    /// Transport told us `node` disconnected. If this is a newly observed
    /// disconnect, disables it immediately rather than waiting for the
    /// clique detector, which might anyway find a clique containing just
    /// the local node (spec §4.4 `WAL_RECEIVER_START`/original
    /// `MtmOnNodeDisconnect`).
    pub fn on_peer_disconnect(&self, node: NodeId) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        if !g.connectivity.on_peer_disconnected(node) {
            return Vec::new();
        }
        let mut actions = self.disable_node(&mut g, node);
        actions.extend(self.check_state(&mut g));
        actions
    }

    pub fn on_heartbeat(&self, from: NodeId, their_mask: NodeMask) {
        self.inner.write().connectivity.on_heartbeat(from, their_mask);
    }

    // -- event application ---------------------------------------------------

    pub fn apply_neighbor_event(&self, node: NodeId, ev: NeighborEvent) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        self.apply_neighbor_event_locked(&mut g, node, ev)
    }

    fn apply_neighbor_event_locked(&self, g: &mut MembershipState, node: NodeId, ev: NeighborEvent) -> Vec<PendingAction> {
        debug_assert_ne!(node, g.self_id, "neighbor events are never raised about the local node");
        let mut actions = Vec::new();
        match ev {
            NeighborEvent::CliqueDisable => actions.extend(self.disable_node(g, node)),
            NeighborEvent::WalReceiverStart => {
                g.receiver_mask.set(bit_of(node));
                self.receiver_hook.on_receiver_started(node);
            }
            NeighborEvent::WalSenderStartRecovery => {
                if !g.disabled_mask.bit(bit_of(node)) {
                    tracing::warn!(node, "node started recovery, but it wasn't disabled");
                    actions.extend(self.disable_node(g, node));
                }
            }
            NeighborEvent::WalSenderStartRecovered => {
                g.sender_mask.set(bit_of(node));
                self.enable_node(g, node);
            }
            NeighborEvent::RecoveryCaughtUp => self.enable_node(g, node),
        }
        actions.extend(self.check_state(g));
        actions
    }

    pub fn apply_event(&self, ev: Event) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        self.apply_event_locked(&mut g, ev)
    }

    fn apply_event_locked(&self, g: &mut MembershipState, ev: Event) -> Vec<PendingAction> {
        if let Event::NonrecoverableError = ev {
            return vec![PendingAction::Shutdown];
        }

        match ev {
            Event::CliqueDisable => {
                g.disabled_mask.set(bit_of(g.self_id));
                g.recovery_count += 1;
            }
            Event::ArbiterReceiverStart => {}
            Event::RecoveryStart1(donor) | Event::RecoveryStart2(donor) => {
                g.recovery_slot = donor;
            }
            Event::RecoveryFinish1 | Event::RecoveryFinish2 => {
                self.enable_node(g, g.self_id);
                g.recovery_count += 1;
                g.recovery_slot = 0;
            }
            Event::NonrecoverableError => unreachable!("handled above"),
        }

        self.check_state(g)
    }

    /// Called by the Monitor once a stable clique has been adopted (spec
    /// §4.5 steps 2d/2e/2f). Disabling is the clique's only job: nodes
    /// absent from it get `CLIQUE_DISABLE`/`NEIGHBOR_CLIQUE_DISABLE`, all
    /// inside the one lock acquisition the original takes around this walk.
    pub fn adopt_clique(&self, new_clique: NodeMask) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        g.clique = new_clique;

        // Never act on our own clique view while under a referee grant —
        // we could otherwise disable ourselves the moment a partitioned
        // peer's absence shows up in the matrix (spec §4.5 step 2d).
        if g.referee_grant {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let n = g.n_nodes as usize;
        for i in 0..n {
            let was_disabled = g.disabled_mask.bit(i);
            let now_excluded = !new_clique.bit(i);
            if now_excluded && now_excluded != was_disabled {
                let node = node_of_bit(i);
                if node == g.self_id {
                    actions.extend(self.apply_event_locked(g, Event::CliqueDisable));
                } else {
                    actions.extend(self.apply_neighbor_event_locked(g, node, NeighborEvent::CliqueDisable));
                }
            }
        }
        actions.extend(self.check_state(g));
        actions
    }

    /// Spec §4.5 step 2a, the part that runs under the lock: recheck that
    /// the even-split condition and the winner's continued absence still
    /// hold (the referee RPC happened without the lock held, so the world
    /// may have moved on), then grant.
    pub fn grant_referee(&self, winner: NodeId) -> Vec<PendingAction> {
        let mut g = self.inner.write();
        let still_half_split = g.n_connected() == g.n_nodes / 2;
        let winner_still_unreachable = !g.connectivity.self_mask().bit(bit_of(winner));
        if !(still_half_split && winner_still_unreachable) {
            return Vec::new();
        }

        tracing::info!(winner, "referee allowed to proceed with half of the nodes");
        g.referee_grant = true;
        g.referee_winner_id = winner;

        let mut actions = Vec::new();
        if g.connectivity.self_mask().complement(g.n_nodes as usize).popcount() == 1 {
            actions.push(PendingAction::ResolveAll);
        }
        self.enable_node(&mut g, g.self_id);
        actions.extend(self.check_state(&mut g));
        actions
    }

    // -- internal mutation helpers --------------------------------------------

    fn enable_node(&self, g: &mut MembershipState, node: NodeId) {
        g.disabled_mask.clear_bit(bit_of(node));
    }

    /// Port of `MtmDisableNode`: idempotent, bumps the node's timeline, and
    /// — only if the local node is currently Online — resolves in-doubt
    /// transactions touching it. Called for both peers (neighbor
    /// `CLIQUE_DISABLE`, disconnects) and the local node (the generic
    /// "any status, not enabled -> Disabled" transition); in the latter
    /// case the status has already flipped to Disabled by the time this
    /// runs, so the resolve branch never fires for a self-disable.
    fn disable_node(&self, g: &mut MembershipState, node: NodeId) -> Vec<PendingAction> {
        let bit = bit_of(node);
        if g.disabled_mask.bit(bit) {
            return Vec::new();
        }
        g.disabled_mask.set(bit);
        g.node_timeline[bit] += 1;
        if g.status == NodeStatus::Online {
            vec![PendingAction::ResolveFor(node)]
        } else {
            Vec::new()
        }
    }

    fn set_status(&self, g: &mut MembershipState, new: NodeStatus, reason: &str) -> Vec<PendingAction> {
        if g.status == new {
            return Vec::new();
        }
        tracing::info!(node = g.self_id, from = %g.status, to = %new, reason, "membership status transition");
        g.status = new;
        g.status_reason = reason.to_string();

        match new {
            NodeStatus::Disabled => {
                g.recovery_slot = 0;
                g.receiver_mask = NodeMask::EMPTY;
                g.sender_mask = NodeMask::EMPTY;
                g.recovery_count += 1;
                Vec::new()
            }
            NodeStatus::Recovery => Vec::new(),
            NodeStatus::Recovered => vec![PendingAction::PersistRecoveryDonor(g.recovery_slot)],
            NodeStatus::Online => vec![PendingAction::CheckStaleReferee],
        }
    }

    /// Port of `MtmCheckState`. Recomputes `enabled_now` from scratch every
    /// call (spec §4.4) and cascades: a transition that lands on a status
    /// whose own preconditions are already satisfied re-runs this function
    /// once more, so `Disabled -> Recovery -> Recovered` can collapse into
    /// one observable change (spec §8 Property 5).
    fn check_state(&self, g: &mut MembershipState) -> Vec<PendingAction> {
        let self_bit = bit_of(g.self_id);
        let n_connected = g.n_connected();
        let n_enabled = g.n_enabled();

        let mut enabled_now = false;
        let mut reason = "node is disabled by default";
        if n_connected >= g.n_nodes / 2 + 1 {
            enabled_now = true;
            reason = "node belongs to the majority group";
        }
        if !enabled_now && n_connected == g.n_nodes / 2 && g.major_node {
            enabled_now = true;
            reason = "node is a major node";
        }
        if !enabled_now && n_connected == g.n_nodes / 2 && g.referee_grant {
            enabled_now = true;
            reason = "node has a referee grant";
        }
        if enabled_now && !g.clique.bit(self_bit) && !g.referee_grant {
            enabled_now = false;
            reason = "node is not in clique and has no referee grant";
        }
        if enabled_now && g.stopped_mask.bit(self_bit) {
            enabled_now = false;
            reason = "node is stopped manually";
        }

        if !enabled_now {
            let mut actions = self.set_status(g, NodeStatus::Disabled, reason);
            actions.extend(self.disable_node(g, g.self_id));
            return actions;
        }

        match g.status {
            NodeStatus::Disabled => {
                let old = g.status;
                let mut actions = self.set_status(g, NodeStatus::Recovery, reason);
                if old != g.status {
                    actions.extend(self.check_state(g));
                }
                actions
            }
            NodeStatus::Recovery => {
                if !g.disabled_mask.bit(self_bit) {
                    let old = g.status;
                    let mut actions = self.set_status(g, NodeStatus::Recovered, reason);
                    if old != g.status {
                        actions.extend(self.check_state(g));
                    }
                    actions
                } else {
                    Vec::new()
                }
            }
            NodeStatus::Recovered => {
                let n_recv = g.receiver_mask.popcount();
                let n_send = g.sender_mask.popcount();
                if n_enabled > 0 && n_recv == n_enabled - 1 && n_send == n_enabled - 1 && n_enabled == n_connected {
                    let old = g.status;
                    let mut actions = self.set_status(g, NodeStatus::Online, reason);
                    if old != g.status {
                        actions.extend(self.check_state(g));
                    }
                    actions
                } else {
                    Vec::new()
                }
            }
            // The majority invariant failing while Online is already
            // covered by the `!enabled_now` branch above (it's computed
            // the same way regardless of current status), so there is
            // nothing left to do here.
            NodeStatus::Online => Vec::new(),
        }
    }
}
