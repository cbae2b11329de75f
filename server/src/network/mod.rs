//! The opaque inter-node transport boundary, and the shutdown controller
//! the `Monitor` task integrates with.

pub mod shutdown;

pub use shutdown::{HealthState, InFlightGuard, ShutdownController};

use async_trait::async_trait;
use mm_wire::NodeId;

/// A destination handle returned by [`Transport::destination_add`], opaque
/// to the membership core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestId(pub u64);

/// Transport send/receive failed. The core treats this as transient I/O
/// (spec §7): never promoted to an invariant violation on its own.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no destination registered for node {0}")]
    UnknownDestination(NodeId),
    #[error("stream {0:?} not subscribed")]
    NotSubscribed(&'static str),
    #[error("transport I/O error: {0}")]
    Io(#[from] anyhow::Error),
}

/// The reliable inter-node message transport, consumed as an opaque
/// collaborator per spec §1/§6. The core never manages connections itself;
/// it only pushes and pops bytes on named streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a peer destination. `ping_period` drives the transport's own
    /// heartbeat; the core learns about liveness only through
    /// `on_connect`/`on_disconnect` callbacks it registers separately.
    async fn destination_add(
        &self,
        connstr: &str,
        local_name: &str,
        remote_name: &str,
        ping_period_ms: u64,
    ) -> Result<DestId, TransportError>;

    /// Attach a receiver for the named remote, at the given shard index.
    async fn attach_receiver(&self, remote_name: &str, index: u32) -> Result<(), TransportError>;

    /// Declare interest in a named stream (e.g. `"txreq"`).
    async fn stream_subscribe(&self, stream_name: &'static str) -> Result<(), TransportError>;

    /// Send `bytes` to `dest` on `stream_name`.
    async fn push(
        &self,
        dest: DestId,
        stream_name: &'static str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Non-blocking receive from `stream_name`, restricted to peers not
    /// marked unreachable in `connectivity_mask`. Returns `None` on
    /// would-block.
    async fn pop(
        &self,
        stream_name: &'static str,
        connectivity_mask: mm_wire::NodeMask,
    ) -> Result<Option<(NodeId, Vec<u8>)>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_wire::NodeMask;
    use std::sync::Mutex;

    /// An in-memory transport double: queues pushed bytes per stream and
    /// replays them to `pop`. Enough to exercise the poll-request round-trip
    /// scenario without a real network.
    #[derive(Default)]
    struct LoopbackTransport {
        queues: Mutex<std::collections::HashMap<&'static str, Vec<(NodeId, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn destination_add(
            &self,
            _connstr: &str,
            _local_name: &str,
            _remote_name: &str,
            _ping_period_ms: u64,
        ) -> Result<DestId, TransportError> {
            Ok(DestId(1))
        }

        async fn attach_receiver(&self, _remote_name: &str, _index: u32) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stream_subscribe(&self, _stream_name: &'static str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn push(
            &self,
            _dest: DestId,
            stream_name: &'static str,
            bytes: Vec<u8>,
        ) -> Result<(), TransportError> {
            self.queues
                .lock()
                .unwrap()
                .entry(stream_name)
                .or_default()
                .push((1, bytes));
            Ok(())
        }

        async fn pop(
            &self,
            stream_name: &'static str,
            _connectivity_mask: NodeMask,
        ) -> Result<Option<(NodeId, Vec<u8>)>, TransportError> {
            Ok(self
                .queues
                .lock()
                .unwrap()
                .get_mut(stream_name)
                .and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) }))
        }
    }

    #[tokio::test]
    async fn loopback_push_then_pop() {
        let transport = LoopbackTransport::default();
        let dest = transport.destination_add("", "n1", "n2", 1000).await.unwrap();
        transport.push(dest, "txreq", vec![1, 2, 3]).await.unwrap();
        let (from, bytes) = transport.pop("txreq", NodeMask::EMPTY).await.unwrap().unwrap();
        assert_eq!(from, 1);
        assert_eq!(bytes, vec![1, 2, 3]);
        assert!(transport.pop("txreq", NodeMask::EMPTY).await.unwrap().is_none());
    }
}
