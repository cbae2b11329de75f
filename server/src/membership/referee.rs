//! External tie-breaker protocol used only when connectivity splits the
//! cluster exactly in half (spec §4.3).
//!
//! [`RefereeTransport`] is the collaborator boundary standing in for the
//! actual RPC to the arbiter's `referee.get_winner`/`referee.clean`
//! procedures; [`RefereeClient`] owns the timeout, validation, and local
//! durable-store bookkeeping around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mm_wire::node_mask::NodeId;

use super::durable::{RefereeStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RefereeError {
    #[error("referee connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("referee RPC failed: {0}")]
    Rpc(#[from] anyhow::Error),
    #[error("referee responded with out-of-range node_id {winner} (n_nodes={n_nodes})")]
    OutOfRange { winner: NodeId, n_nodes: u32 },
}

/// The external arbiter RPC boundary (spec §1: "reliable inter-node message
/// transport" is out of scope; this is the analogous boundary for the
/// referee, which is a separate process/service from cluster peers).
#[async_trait]
pub trait RefereeTransport: Send + Sync {
    /// Invokes `referee.get_winner(self_id)`. Implementations are expected
    /// to apply their own connect timeout; [`RefereeClient::get_winner`]
    /// additionally wraps the whole call in [`CONNECT_TIMEOUT`].
    async fn get_winner(&self, self_id: NodeId) -> Result<NodeId, RefereeError>;

    /// Invokes `referee.clean()`. Returns `Ok(true)` iff the arbiter
    /// confirms the grant was cleared.
    async fn clear(&self) -> Result<bool, RefereeError>;
}

pub struct RefereeClient {
    transport: Option<Arc<dyn RefereeTransport>>,
    store: Arc<dyn RefereeStore>,
    n_nodes: u32,
}

impl RefereeClient {
    #[must_use]
    pub fn new(transport: Option<Arc<dyn RefereeTransport>>, store: Arc<dyn RefereeStore>, n_nodes: u32) -> Self {
        RefereeClient { transport, store, n_nodes }
    }

    /// No referee configured (`referee_connstr` empty, spec §6).
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    /// Spec §4.3 `get_winner`: any network or protocol error yields `None`
    /// — the caller remains Disabled and retries on the next Monitor tick.
    pub async fn get_winner(&self, self_id: NodeId) -> Option<NodeId> {
        let Some(transport) = &self.transport else { return None };

        let result = tokio::time::timeout(CONNECT_TIMEOUT, transport.get_winner(self_id)).await;
        let winner = match result {
            Ok(Ok(w)) => w,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "referee get_winner failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(timeout = ?CONNECT_TIMEOUT, "referee get_winner timed out");
                return None;
            }
        };

        if winner < 1 || winner > self.n_nodes {
            tracing::warn!(winner, n_nodes = self.n_nodes, "referee returned out-of-range node_id");
            return None;
        }

        match self.store.write_winner_if_absent(winner).await {
            Ok(Some(old)) if old != winner => {
                tracing::warn!(old, new = winner, "overriding old referee decision");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to persist referee decision locally"),
        }

        Some(winner)
    }

    /// Spec §4.3 `clear_winner`: clears the local durable row *before*
    /// asking the arbiter to clear its own grant. If the process crashes
    /// between the two, a restart observes no stored winner rather than a
    /// stale one that could grant two masters at once.
    pub async fn clear_winner(&self) -> bool {
        if let Err(e) = self.store.delete_winner().await {
            tracing::warn!(error = %e, "failed to clear local referee decision; aborting clear");
            return false;
        }

        let Some(transport) = &self.transport else { return true };
        match transport.clear().await {
            Ok(cleared) => cleared,
            Err(e) => {
                tracing::warn!(error = %e, "failed to clear referee decision remotely");
                false
            }
        }
    }

    /// Spec §4.3 `read_saved_winner`: re-seeds `referee_winner_id` after a
    /// restart, or answers the Recovered→Online stale-winner check.
    pub async fn read_saved_winner(&self) -> Result<Option<NodeId>, StoreError> {
        self.store.read_winner().await
    }
}
