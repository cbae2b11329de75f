use mm_wire::NodeId;

use crate::membership::MonitorConfig;

/// Host-level configuration wrapping the membership core's own config plus
/// the identity fields the host must supply at startup.
///
/// Configuration loading, CLI parsing, and file-watching reload are out of
/// scope for the core (spec §1); this struct is simply the value a host's
/// own config layer populates and hands to [`crate::service::ServiceContext`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's identity, in `[1, n_nodes]`.
    pub node_id: NodeId,
    /// Cluster size.
    pub n_nodes: u32,
    /// Statically designated tie-breaker, an alternative to the referee.
    pub major_node: bool,
    /// Membership core tuning (referee connection string, heartbeat
    /// timeouts, bit-width of `NodeMask`).
    pub monitor: MonitorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            n_nodes: 1,
            major_node: false,
            monitor: MonitorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.n_nodes, 1);
        assert!(!config.major_node);
    }
}
