//! Node configuration

use crate::error::{NodeError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use veil_discovery::dht::{
    ALPHA, DEFAULT_QUERY_TIMEOUT, K, LookupParams, MAX_ADDRS_PER_PEER, MAX_ROUNDS,
};
use veil_transport::ChannelConfig;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Secure channel parameters
    pub channel: ChannelConfig,

    /// Routing table and lookup parameters
    pub dht: DhtConfig,

    /// RPC dispatch parameters
    pub rpc: RpcConfig,

    /// Relay fallback parameters
    pub relay: RelayConfig,

    /// Upper bound for opening a transport link
    pub connect_timeout: Duration,

    /// Seed peers for bootstrap
    pub bootstrap: Vec<SocketAddr>,

    /// Addresses other nodes should dial us on. Empty means the transport's
    /// listen address; an unspecified IP there is filled in by each peer
    /// from the address it sees us connect from.
    pub advertised_addrs: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            dht: DhtConfig::default(),
            rpc: RpcConfig::default(),
            relay: RelayConfig::default(),
            connect_timeout: Duration::from_secs(5),
            bootstrap: Vec::new(),
            advertised_addrs: Vec::new(),
        }
    }
}

/// Routing table and maintenance configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity
    pub k: usize,

    /// Lookup parallelism
    pub alpha: usize,

    /// Round cap for one lookup
    pub max_rounds: usize,

    /// Timeout for one FIND_NODE query
    pub query_timeout: Duration,

    /// Timeout for the liveness probe of a full bucket's oldest entry
    pub probe_timeout: Duration,

    /// Buckets untouched for this long get a refresh lookup
    pub refresh_interval: Duration,

    /// How often the maintenance loop runs
    pub maintenance_interval: Duration,

    /// Consecutive failures after which a peer is pruned
    pub failure_threshold: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            max_rounds: MAX_ROUNDS,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            probe_timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(15 * 60),
            maintenance_interval: Duration::from_secs(60),
            failure_threshold: 5,
        }
    }
}

impl DhtConfig {
    /// Parameters for [`veil_discovery::dht::iterative_find`]
    #[must_use]
    pub fn lookup_params(&self) -> LookupParams {
        LookupParams {
            k: self.k,
            alpha: self.alpha,
            max_rounds: self.max_rounds,
            query_timeout: self.query_timeout,
        }
    }
}

/// RPC dispatch configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Timeout used by calls that do not pass their own
    pub default_timeout: Duration,

    /// How often expired calls are swept
    pub sweep_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(10),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Use relays when direct connection fails, and forward for others
    pub enabled: bool,

    /// Tunnels this node forwards at once
    pub max_tunnels: usize,

    /// Relays tried per destination before giving up
    pub max_attempts: usize,

    /// Frames buffered per tunnel direction
    pub tunnel_queue: usize,

    /// Forwarded frames buffered for diagnostic subscribers
    pub traffic_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tunnels: 64,
            max_attempts: 3,
            tunnel_queue: 256,
            traffic_buffer: 1024,
        }
    }
}

impl NodeConfig {
    /// Check the configuration for values the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        fn positive(d: Duration, field: &'static str) -> Result<()> {
            if d.is_zero() {
                Err(NodeError::invalid_config(field))
            } else {
                Ok(())
            }
        }

        if self.dht.k == 0 {
            return Err(NodeError::invalid_config("dht.k must be positive"));
        }
        if self.dht.alpha == 0 {
            return Err(NodeError::invalid_config("dht.alpha must be positive"));
        }
        if self.dht.max_rounds == 0 {
            return Err(NodeError::invalid_config("dht.max_rounds must be positive"));
        }
        if self.dht.failure_threshold == 0 {
            return Err(NodeError::invalid_config(
                "dht.failure_threshold must be positive",
            ));
        }
        positive(self.dht.query_timeout, "dht.query_timeout must be positive")?;
        positive(self.dht.probe_timeout, "dht.probe_timeout must be positive")?;
        positive(
            self.dht.maintenance_interval,
            "dht.maintenance_interval must be positive",
        )?;
        positive(self.rpc.default_timeout, "rpc.default_timeout must be positive")?;
        positive(self.rpc.sweep_interval, "rpc.sweep_interval must be positive")?;
        positive(self.connect_timeout, "connect_timeout must be positive")?;
        positive(
            self.channel.handshake_timeout,
            "channel.handshake_timeout must be positive",
        )?;
        positive(self.channel.idle_timeout, "channel.idle_timeout must be positive")?;

        if self.channel.outbound_queue == 0 || self.channel.inbound_queue == 0 {
            return Err(NodeError::invalid_config(
                "channel queues must hold at least one frame",
            ));
        }
        if self.channel.max_payload() <= crate::node::relay::TUNNEL_OVERHEAD {
            return Err(NodeError::invalid_config(
                "channel.max_frame_size too small to carry a tunnel",
            ));
        }
        if self.advertised_addrs.len() > MAX_ADDRS_PER_PEER {
            return Err(NodeError::invalid_config("too many advertised_addrs"));
        }
        if self
            .advertised_addrs
            .iter()
            .any(|addr| addr.ip().is_unspecified() || addr.port() == 0)
        {
            return Err(NodeError::invalid_config(
                "advertised_addrs must name a concrete IP and port",
            ));
        }
        if self.relay.enabled && (self.relay.max_attempts == 0 || self.relay.tunnel_queue == 0) {
            return Err(NodeError::invalid_config(
                "relay.max_attempts and relay.tunnel_queue must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.dht.max_rounds, 20);
        assert_eq!(config.dht.failure_threshold, 5);
        assert_eq!(config.dht.refresh_interval, Duration::from_secs(900));
        assert_eq!(config.rpc.sweep_interval, Duration::from_millis(10));
        assert_eq!(config.rpc.default_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.relay.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_params_follow_config() {
        let config = DhtConfig {
            k: 8,
            alpha: 2,
            ..DhtConfig::default()
        };
        let params = config.lookup_params();
        assert_eq!(params.k, 8);
        assert_eq!(params.alpha, 2);
        assert_eq!(params.max_rounds, MAX_ROUNDS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.dht.k = 0;
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));

        let mut config = NodeConfig::default();
        config.rpc.sweep_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval"));

        let mut config = NodeConfig::default();
        config.channel.max_frame_size = 32;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.relay.max_attempts = 0;
        assert!(config.validate().is_err());
        config.relay.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_advertised_addrs() {
        let mut config = NodeConfig::default();
        config.advertised_addrs = vec!["203.0.113.7:7400".parse().unwrap()];
        assert!(config.validate().is_ok());

        config.advertised_addrs = vec!["0.0.0.0:7400".parse().unwrap()];
        assert!(config.validate().is_err());

        config.advertised_addrs = vec!["203.0.113.7:0".parse().unwrap()];
        assert!(config.validate().is_err());
    }
}
