use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::codec::{ENDPOINT_LEN, HEADER_LEN, MAX_MEMBER_RECORD_LEN};
use crate::listener::{MemberEventsListener, MemberListener};

// Default configuration constants
pub(crate) const DEFAULT_IP_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub(crate) const DEFAULT_PORT: u16 = 5870;
pub(crate) const DEFAULT_PROTOCOL_PERIOD: u64 = 1_000; // 1 second
pub(crate) const DEFAULT_MAX_UDP_PACKET_SIZE: usize = 508; // largest payload that never fragments
pub(crate) const MAX_UDP_PAYLOAD_SIZE: usize = 65_507;
pub(crate) const DEFAULT_FANOUT: usize = 5;
pub(crate) const DEFAULT_INDIRECT_ENDPOINTS: usize = 3;
pub(crate) const DEAD_TIMEOUT_PERIODS: u32 = 5;
pub(crate) const DEAD_COOL_OFF_PERIODS: u32 = 300;
pub(crate) const PRUNE_TIMEOUT_PERIODS: u32 = 600;
pub(crate) const MAX_PROTOCOL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
// Longest cool-off or prune timeout: the derived prune timeout of the longest period.
pub(crate) const MAX_SCHEDULE_TIMEOUT: Duration = Duration::from_secs(PRUNE_TIMEOUT_PERIODS as u64 * 24 * 60 * 60);

// Header with an endpoint, the sender record and room for one more full record.
pub(crate) const MIN_UDP_PACKET_SIZE: usize = HEADER_LEN + ENDPOINT_LEN + 2 * MAX_MEMBER_RECORD_LEN;

/// [`GossiperConfig`] configuration of a gossip member. Immutable once built.
#[derive(Clone)]
pub struct GossiperConfig {
    /// IPv4 address the node binds to and advertises to its peers
    pub(crate) ip_addr: Ipv4Addr,

    /// Port number on which the node will listen for gossip messages
    pub(crate) port: u16,

    /// Length of one protocol period: one probe and one sweep per period
    pub(crate) protocol_period: Duration,

    /// Time to wait for an ACK before moving to the next probe stage (period / 2)
    pub(crate) ack_timeout: Duration,

    /// Time after the first unanswered probe at which a member is declared dead (period × 5)
    pub(crate) dead_timeout: Duration,

    /// How long a dead member is still gossiped before it is scheduled for pruning
    pub(crate) dead_cool_off: Duration,

    /// How long a member stays scheduled for pruning before it is removed
    pub(crate) prune_timeout: Duration,

    /// Upper bound on the size of every outgoing datagram
    pub(crate) max_udp_packet_size: usize,

    /// Number of members told directly when this node leaves
    pub(crate) fanout: usize,

    /// Number of members asked to probe a target that missed its direct ACK
    pub(crate) indirect_endpoints: usize,

    /// Members pinged at startup until the first one answers
    pub(crate) seeds: Vec<SocketAddrV4>,

    /// Service tag advertised with this node's record
    pub(crate) service: u8,

    /// Service port advertised with this node's record
    pub(crate) service_port: u16,

    pub(crate) member_listeners: Vec<Arc<dyn MemberListener>>,
    pub(crate) member_events_listeners: Vec<Arc<dyn MemberEventsListener>>,
}

impl GossiperConfig {
    pub fn ip_addr(&self) -> Ipv4Addr {
        self.ip_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol_period(&self) -> Duration {
        self.protocol_period
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn dead_timeout(&self) -> Duration {
        self.dead_timeout
    }

    pub fn dead_cool_off(&self) -> Duration {
        self.dead_cool_off
    }

    pub fn prune_timeout(&self) -> Duration {
        self.prune_timeout
    }

    pub fn max_udp_packet_size(&self) -> usize {
        self.max_udp_packet_size
    }

    pub fn seeds(&self) -> &[SocketAddrV4] {
        &self.seeds
    }
}

pub struct GossiperConfigBuilder {
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) protocol_period: Duration,
    pub(crate) ack_timeout: Duration,
    pub(crate) dead_timeout: Duration,
    pub(crate) dead_cool_off: Option<Duration>,
    pub(crate) prune_timeout: Option<Duration>,
    pub(crate) max_udp_packet_size: usize,
    pub(crate) fanout: usize,
    pub(crate) indirect_endpoints: usize,
    pub(crate) seeds: Vec<SocketAddrV4>,
    pub(crate) service: u8,
    pub(crate) service_port: u16,
    pub(crate) member_listeners: Vec<Arc<dyn MemberListener>>,
    pub(crate) member_events_listeners: Vec<Arc<dyn MemberEventsListener>>,
}

impl Default for GossiperConfigBuilder {
    fn default() -> GossiperConfigBuilder {
        let builder = Self {
            ip_addr: DEFAULT_IP_ADDR,
            port: DEFAULT_PORT,
            protocol_period: Duration::ZERO,
            ack_timeout: Duration::ZERO,
            dead_timeout: Duration::ZERO,
            dead_cool_off: None,
            prune_timeout: None,
            max_udp_packet_size: DEFAULT_MAX_UDP_PACKET_SIZE,
            fanout: DEFAULT_FANOUT,
            indirect_endpoints: DEFAULT_INDIRECT_ENDPOINTS,
            seeds: Vec::new(),
            service: 0,
            service_port: 0,
            member_listeners: Vec::new(),
            member_events_listeners: Vec::new(),
        };
        builder.with_protocol_period(Duration::from_millis(DEFAULT_PROTOCOL_PERIOD))
    }
}

impl GossiperConfigBuilder {
    /// Creates a new [`GossiperConfigBuilder`] with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the IPv4 address for the node
    pub fn with_addr(mut self, addr: impl Into<Ipv4Addr>) -> Self {
        self.ip_addr = addr.into();
        self
    }

    /// Sets the port number for the node
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the protocol period and recomputes the timeouts derived from it:
    /// the ACK timeout (half a period) and the dead timeout (five periods).
    pub fn with_protocol_period(mut self, period: Duration) -> Self {
        self.protocol_period = period;
        self.ack_timeout = period / 2;
        self.dead_timeout = period.saturating_mul(DEAD_TIMEOUT_PERIODS);
        self
    }

    /// Overrides how long dead members keep being gossiped before they are
    /// scheduled for pruning. Defaults to 300 protocol periods.
    pub fn with_dead_cool_off(mut self, cool_off: Duration) -> Self {
        self.dead_cool_off = Some(cool_off);
        self
    }

    /// Overrides how long a member stays scheduled for pruning. Defaults to 600
    /// protocol periods.
    pub fn with_prune_timeout(mut self, timeout: Duration) -> Self {
        self.prune_timeout = Some(timeout);
        self
    }

    pub fn with_max_udp_packet_size(mut self, size: usize) -> Self {
        self.max_udp_packet_size = size;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Sets how many members relay a probe when the direct one goes unanswered
    pub fn with_indirect_endpoints(mut self, count: usize) -> Self {
        self.indirect_endpoints = count;
        self
    }

    /// Adds a seed member to contact while this node knows nobody
    pub fn with_seed(mut self, seed: SocketAddrV4) -> Self {
        self.seeds.push(seed);
        self
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = SocketAddrV4>) -> Self {
        self.seeds.extend(seeds);
        self
    }

    /// Sets the service tag and port advertised to other members
    pub fn with_service(mut self, service: u8, service_port: u16) -> Self {
        self.service = service;
        self.service_port = service_port;
        self
    }

    pub fn with_member_listener(mut self, listener: Arc<dyn MemberListener>) -> Self {
        self.member_listeners.push(listener);
        self
    }

    pub fn with_member_events_listener(mut self, listener: Arc<dyn MemberEventsListener>) -> Self {
        self.member_events_listeners.push(listener);
        self
    }

    /// Validates the current configuration
    pub(crate) fn validate(&self) -> Result<()> {
        if self.ip_addr.is_unspecified() {
            anyhow::bail!("bind address must be a concrete IPv4 address, peers identify members by it");
        }
        if self.port == 0 {
            anyhow::bail!("bind port is not set");
        }
        if self.ack_timeout.is_zero() {
            anyhow::bail!("protocol period is too short, it must leave a non-zero ACK timeout");
        }
        if self.protocol_period > MAX_PROTOCOL_PERIOD {
            anyhow::bail!(
                "protocol period must not exceed {:?}, got {:?}",
                MAX_PROTOCOL_PERIOD,
                self.protocol_period,
            );
        }
        match self.dead_cool_off {
            Some(cool_off) if cool_off.is_zero() => anyhow::bail!("dead cool-off must be greater than zero"),
            Some(cool_off) if cool_off > MAX_SCHEDULE_TIMEOUT => {
                anyhow::bail!("dead cool-off must not exceed {:?}, got {:?}", MAX_SCHEDULE_TIMEOUT, cool_off)
            }
            _ => {}
        }
        match self.prune_timeout {
            Some(timeout) if timeout.is_zero() => anyhow::bail!("prune timeout must be greater than zero"),
            Some(timeout) if timeout > MAX_SCHEDULE_TIMEOUT => {
                anyhow::bail!("prune timeout must not exceed {:?}, got {:?}", MAX_SCHEDULE_TIMEOUT, timeout)
            }
            _ => {}
        }
        if self.max_udp_packet_size < MIN_UDP_PACKET_SIZE || self.max_udp_packet_size > MAX_UDP_PAYLOAD_SIZE {
            anyhow::bail!(
                "max UDP packet size must be between {} and {} bytes, got {}",
                MIN_UDP_PACKET_SIZE,
                MAX_UDP_PAYLOAD_SIZE,
                self.max_udp_packet_size,
            );
        }
        if self.fanout == 0 {
            anyhow::bail!("fanout must be greater than zero(0)");
        }

        Ok(())
    }

    /// Builds the final GossiperConfig
    pub async fn build(self) -> Result<GossiperConfig> {
        self.validate()?;

        let period = self.protocol_period;
        Ok(GossiperConfig {
            ip_addr: self.ip_addr,
            port: self.port,
            protocol_period: period,
            ack_timeout: self.ack_timeout,
            dead_timeout: self.dead_timeout,
            dead_cool_off: self.dead_cool_off.unwrap_or(period * DEAD_COOL_OFF_PERIODS),
            prune_timeout: self.prune_timeout.unwrap_or(period * PRUNE_TIMEOUT_PERIODS),
            max_udp_packet_size: self.max_udp_packet_size,
            fanout: self.fanout,
            indirect_endpoints: self.indirect_endpoints,
            seeds: self.seeds,
            service: self.service,
            service_port: self.service_port,
            member_listeners: self.member_listeners,
            member_events_listeners: self.member_events_listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults() -> Result<()> {
        let config = GossiperConfigBuilder::new().build().await?;

        assert_eq!(config.ip_addr(), Ipv4Addr::LOCALHOST);
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.protocol_period(), Duration::from_secs(1));
        assert_eq!(config.ack_timeout(), Duration::from_millis(500));
        assert_eq!(config.dead_timeout(), Duration::from_secs(5));
        assert_eq!(config.dead_cool_off(), Duration::from_secs(300));
        assert_eq!(config.prune_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_udp_packet_size(), 508);
        assert_eq!(config.fanout, 5);
        assert_eq!(config.indirect_endpoints, 3);
        assert!(config.seeds().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_period_recomputes_derived_timeouts() -> Result<()> {
        let config = GossiperConfigBuilder::new()
            .with_protocol_period(Duration::from_millis(50))
            .with_seed(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000))
            .build()
            .await?;

        assert_eq!(config.ack_timeout(), Duration::from_millis(25));
        assert_eq!(config.dead_timeout(), Duration::from_millis(250));
        assert_eq!(config.dead_cool_off(), Duration::from_millis(15_000));
        assert_eq!(config.prune_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.seeds().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_cool_off_and_prune_survive_period_change() -> Result<()> {
        let config = GossiperConfigBuilder::new()
            .with_dead_cool_off(Duration::from_millis(100))
            .with_prune_timeout(Duration::from_millis(200))
            .with_protocol_period(Duration::from_millis(40))
            .build()
            .await?;

        assert_eq!(config.dead_cool_off(), Duration::from_millis(100));
        assert_eq!(config.prune_timeout(), Duration::from_millis(200));
        assert_eq!(config.ack_timeout(), Duration::from_millis(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_configurations_fail_fast() {
        assert!(GossiperConfigBuilder::new().with_port(0).build().await.is_err());
        assert!(GossiperConfigBuilder::new().with_addr(Ipv4Addr::UNSPECIFIED).build().await.is_err());
        assert!(GossiperConfigBuilder::new()
            .with_protocol_period(Duration::from_millis(1))
            .build()
            .await
            .is_err());
        assert!(GossiperConfigBuilder::new()
            .with_dead_cool_off(Duration::ZERO)
            .build()
            .await
            .is_err());
        assert!(GossiperConfigBuilder::new().with_max_udp_packet_size(16).build().await.is_err());
        assert!(GossiperConfigBuilder::new().with_max_udp_packet_size(70_000).build().await.is_err());
        assert!(GossiperConfigBuilder::new().with_fanout(0).build().await.is_err());
    }

    #[tokio::test]
    async fn test_timeouts_too_long_to_schedule_are_rejected() -> Result<()> {
        let huge = Duration::from_millis(u64::MAX);
        assert!(GossiperConfigBuilder::new().with_protocol_period(huge).build().await.is_err());
        assert!(GossiperConfigBuilder::new()
            .with_protocol_period(MAX_PROTOCOL_PERIOD + Duration::from_millis(1))
            .build()
            .await
            .is_err());
        assert!(GossiperConfigBuilder::new().with_dead_cool_off(huge).build().await.is_err());
        assert!(GossiperConfigBuilder::new().with_prune_timeout(huge).build().await.is_err());

        // The longest accepted period still yields deadlines that fit an Instant.
        let config = GossiperConfigBuilder::new()
            .with_protocol_period(MAX_PROTOCOL_PERIOD)
            .build()
            .await?;
        let now = tokio::time::Instant::now();
        for timeout in [config.dead_timeout(), config.dead_cool_off(), config.prune_timeout()] {
            assert!(now.checked_add(timeout).is_some());
        }
        Ok(())
    }
}
