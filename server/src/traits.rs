//! Callback interfaces through which the membership core reaches the two
//! external subsystems it would otherwise depend on cyclically: the
//! two-phase-commit transaction resolver and the replication receiver
//! start-up path.
//!
//! Per the inversion-of-dependency design note: the core never imports the
//! resolver or the receiver manager directly. Both are injected at
//! `Monitor::new` as `Arc<dyn ...>` and invoked through these traits.

use async_trait::async_trait;
use mm_wire::NodeId;

/// Entry points into the two-phase-commit transaction resolver.
///
/// Implemented by the host process; the membership core only ever calls
/// through this trait, never the resolver's own types.
#[async_trait]
pub trait ResolverCallbacks: Send + Sync {
    /// Resolve in-doubt transactions touching exactly `node` (called when a
    /// single peer is disabled while the local node is Online).
    async fn resolve_transactions_for(&self, node: NodeId);

    /// Resolve in-doubt transactions cluster-wide (called on the two named
    /// call sites: a stale referee winner found at Recovered->Online, and a
    /// referee grant while alone at Monitor step 2a).
    async fn resolve_all_transactions(&self);
}

/// Single-slot hook invoked after the core mutates `receiver_mask`.
///
/// The core calls this once per receiver-start event, after the mutation is
/// durably reflected in `MembershipState`, so the host can wire up whatever
/// downstream notification (metrics, replication bookkeeping) it needs
/// without the core depending on it.
pub trait ReceiverStartHook: Send + Sync {
    fn on_receiver_started(&self, node: NodeId);
}

/// A hook that does nothing; the default when the host registers none.
pub struct NoopReceiverStartHook;

impl ReceiverStartHook for NoopReceiverStartHook {
    fn on_receiver_started(&self, _node: NodeId) {}
}

/// Terminates the whole process group. The only action the core cannot take
/// itself: a `NONRECOVERABLE_ERROR` event (spec §7) means continuing to run
/// risks corrupting replicated state, and restart is the host's job, not the
/// core's.
pub trait ProcessShutdown: Send + Sync {
    fn shutdown_process_group(&self);
}

/// A shutdown hook that does nothing; useful in tests where a
/// `NONRECOVERABLE_ERROR` path is exercised without tearing down the test
/// process itself.
pub struct NoopProcessShutdown;

impl ProcessShutdown for NoopProcessShutdown {
    fn shutdown_process_group(&self) {}
}
