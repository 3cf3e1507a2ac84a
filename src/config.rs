use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

use crate::messaging::frame_reader::FrameLimits;
use crate::messaging::handshake::ProtocolVersion;

#[derive(Debug, Clone)]
pub struct ServentConfig {
    pub listen_addr: SocketAddr,
    /// The address other servents can reach us at. It is advertised in our own pongs and used as
    ///  the callback address in push requests. `None` means we are not reachable, in which case
    ///  we neither answer pings with our own pong nor send push requests.
    pub advertised_addr: Option<SocketAddrV4>,
    pub user_agent: String,
    pub protocol_version: ProtocolVersion,
    pub handshake_timeout: Duration,

    pub max_payload_len: u32,
    pub hard_max_ttl: u8,
    /// Requests that would travel further than this are trimmed (see [FrameLimits]). Off by
    ///  default.
    pub soft_max_ttl: Option<u8>,
    pub default_ttl: u8,
    /// number of messages that can be queued for sending per connection before messages are
    ///  dropped
    pub outbound_queue_len: usize,

    pub ping_route_window: Duration,
    pub query_route_window: Duration,
    pub push_route_window: Duration,
    /// A route table's 'new' map is rotated once it reaches this size, even if its time window
    ///  did not elapse yet.
    pub max_route_table_size: usize,
    /// Reply bytes that are forwarded per query if the reply has a single hop left. Replies
    ///  with more remaining hops get a proportionally smaller budget.
    pub max_reply_bytes_per_query: u64,
    pub max_replies_per_query: u32,

    pub push_ttl: u8,
    pub push_expiry: Duration,
    pub push_sweep_interval: Duration,
    pub direct_connect_timeout: Duration,
    pub exchange_read_timeout: Duration,
    /// Whether our own address is in a private range. Peers with private addresses are only
    ///  connected to directly if we are on a private network ourselves.
    pub local_is_private: bool,

    pub reply_cache_num_hops: u8,
    pub reply_cache_base_capacity: usize,
    pub reply_cache_capacity_increment: usize,
    pub reply_cache_expiry: Duration,
    pub reply_cache_sweep_interval: Duration,
    pub reply_cache_min_version: ProtocolVersion,

    pub shared_files: u32,
    pub shared_kb: u32,
}

impl ServentConfig {
    pub fn new(listen_addr: SocketAddr) -> ServentConfig {
        ServentConfig {
            listen_addr,
            advertised_addr: None,
            user_agent: format!("servent/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: ProtocolVersion::V0_6,
            handshake_timeout: Duration::from_secs(10),
            max_payload_len: 65536,
            hard_max_ttl: 14,
            soft_max_ttl: None,
            default_ttl: 7,
            outbound_queue_len: 256,
            ping_route_window: Duration::from_secs(2*60),
            query_route_window: Duration::from_secs(5*60),
            push_route_window: Duration::from_secs(7*60),
            max_route_table_size: 50_000,
            max_reply_bytes_per_query: 200 * 1024,
            max_replies_per_query: 100,
            push_ttl: 6,
            push_expiry: Duration::from_secs(15),
            push_sweep_interval: Duration::from_secs(5),
            direct_connect_timeout: Duration::from_secs(10),
            exchange_read_timeout: Duration::from_secs(10),
            local_is_private: true,
            reply_cache_num_hops: 6,
            reply_cache_base_capacity: 1,
            reply_cache_capacity_increment: 1,
            reply_cache_expiry: Duration::from_secs(3),
            reply_cache_sweep_interval: Duration::from_secs(1),
            reply_cache_min_version: ProtocolVersion::V0_6,
            shared_files: 0,
            shared_kb: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hard_max_ttl == 0 {
            bail!("hard max TTL must be positive");
        }
        if let Some(soft_max_ttl) = self.soft_max_ttl {
            if soft_max_ttl > self.hard_max_ttl {
                bail!("soft max TTL {} exceeds hard max TTL {}", soft_max_ttl, self.hard_max_ttl);
            }
        }
        if self.default_ttl == 0 || self.default_ttl > self.hard_max_ttl {
            bail!("default TTL {} must be between 1 and the hard max TTL {}", self.default_ttl, self.hard_max_ttl);
        }
        if self.push_ttl == 0 || self.push_ttl > self.hard_max_ttl {
            bail!("push TTL {} must be between 1 and the hard max TTL {}", self.push_ttl, self.hard_max_ttl);
        }
        if self.outbound_queue_len == 0 {
            bail!("outbound queue length must be positive");
        }
        if self.max_route_table_size == 0 {
            bail!("route table size must be positive");
        }
        if self.ping_route_window.is_zero() || self.query_route_window.is_zero() || self.push_route_window.is_zero() {
            bail!("route table windows must be positive");
        }
        if self.push_sweep_interval.is_zero() || self.reply_cache_sweep_interval.is_zero() {
            bail!("sweep intervals must be positive");
        }
        if self.push_sweep_interval > self.push_expiry {
            bail!("push sweep interval {:?} is longer than the push expiry {:?}", self.push_sweep_interval, self.push_expiry);
        }
        if self.reply_cache_num_hops == 0 {
            bail!("reply cache needs at least one hop bucket");
        }
        Ok(())
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_payload_len: self.max_payload_len,
            hard_max_ttl: self.hard_max_ttl,
            soft_max_ttl: self.soft_max_ttl,
        }
    }
}
