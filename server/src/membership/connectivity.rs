//! Per-peer reachability tracking: the local node's own view, derived from
//! transport connect/disconnect events, plus the latest gossiped view from
//! every peer, carried piggy-backed on heartbeats.
//!
//! Kept as a standalone value type (rather than folded directly into
//! [`super::state::MembershipState`]) so the symmetrisation algorithm can be
//! unit-tested without constructing a full `Membership` and its lock.

use mm_wire::node_mask::{bit_of, NodeId, NodeMask};

/// Tracks `self_connectivity_mask` and `peer_connectivity[i]` for one node.
#[derive(Debug, Clone)]
pub struct ConnectivityTracker {
    self_id: NodeId,
    n_nodes: u32,
    self_mask: NodeMask,
    peer_masks: Vec<NodeMask>,
}

impl ConnectivityTracker {
    #[must_use]
    pub fn new(self_id: NodeId, n_nodes: u32) -> Self {
        ConnectivityTracker {
            self_id,
            n_nodes,
            self_mask: NodeMask::EMPTY,
            peer_masks: vec![NodeMask::EMPTY; n_nodes as usize],
        }
    }

    #[must_use]
    pub fn self_mask(&self) -> NodeMask {
        self.self_mask
    }

    #[must_use]
    pub fn peer_mask(&self, peer: NodeId) -> NodeMask {
        self.peer_masks[bit_of(peer)]
    }

    /// Clears the unreachable bit for `node`. Idempotent.
    pub fn on_peer_connected(&mut self, node: NodeId) {
        self.self_mask.clear_bit(bit_of(node));
    }

    /// Sets the unreachable bit for `node`. Returns `true` iff the bit was
    /// previously clear (a *newly* observed disconnect) so the caller can
    /// decide whether to react; repeated disconnects are a no-op.
    pub fn on_peer_disconnected(&mut self, node: NodeId) -> bool {
        let bit = bit_of(node);
        if self.self_mask.bit(bit) {
            false
        } else {
            self.self_mask.set(bit);
            true
        }
    }

    /// Overwrites the gossiped connectivity mask last heard from `from`.
    pub fn on_heartbeat(&mut self, from: NodeId, their_mask: NodeMask) {
        self.peer_masks[bit_of(from)] = their_mask;
    }

    /// Builds the symmetrised disconnect matrix consumed by
    /// [`super::clique::max_clique`]: row `i` is peer `i`'s gossiped view
    /// (the local node's own view for its own row), OR-ed with every other
    /// row's claim about it, so a disconnect reported by either endpoint is
    /// treated as real. The self-diagonal is always forced clear, regardless
    /// of what either side's gossip claims.
    #[must_use]
    pub fn build_matrix(&self) -> Vec<NodeMask> {
        let n = self.n_nodes as usize;
        let self_bit = bit_of(self.self_id);
        let mut matrix: Vec<NodeMask> = (0..n)
            .map(|i| if i == self_bit { self.self_mask } else { self.peer_masks[i] })
            .collect();

        for i in 0..n {
            for j in 0..i {
                if matrix[i].bit(j) || matrix[j].bit(i) {
                    matrix[i].set(j);
                    matrix[j].set(i);
                }
            }
        }
        for (i, row) in matrix.iter_mut().enumerate() {
            row.clear_bit(i);
        }
        matrix
    }

    /// The trivial clique: peers reachable with no cross-view reasoning
    /// applied. Used only as a baseline for "nothing interesting happened".
    #[must_use]
    pub fn trivial_clique(&self) -> NodeMask {
        self.self_mask.complement(self.n_nodes as usize)
    }
}
