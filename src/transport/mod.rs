//! Links to the ground station.
//!
//! A `LinkHandle` moves opaque byte blocks to one peer over one physical
//! path. The dispatch controller owns every link and is the only caller;
//! links keep their own retransmission and statistics state and only
//! advance it inside `tick`.

pub mod loopback;
pub mod udp;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub use loopback::LoopbackLink;
pub use udp::UdpBlockLink;

/// Index of a link inside the dispatch controller.
pub type LinkId = usize;
/// Per-link block identifier assigned by `send`.
pub type BlockId = u64;
/// Called once when every byte of a block has been acknowledged.
pub type CompletionCallback = Box<dyn FnOnce(BlockId) + Send>;

pub trait LinkHandle: Send {
    fn name(&self) -> &str;

    /// Advance retransmission/ack state, keeping at most `max_in_flight`
    /// unacknowledged chunks and at most `max_queue` waiting blocks.
    fn tick(&mut self, max_in_flight: usize, max_queue: usize);

    /// Next fully received block, waiting at most `timeout`.
    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    /// Queue a block. Lower `priority` values go first.
    fn send(
        &mut self,
        payload: Vec<u8>,
        priority: u32,
        on_complete: Option<CompletionCallback>,
    ) -> Result<BlockId>;

    /// Blocks queued or in flight.
    fn queued(&self) -> usize;

    /// Configured budget in bytes per second.
    fn bandwidth_budget(&self) -> f64;

    /// Unique payload bytes delivered per byte put on the wire.
    fn efficiency(&self) -> f64;

    /// Recent send rate in bytes per second.
    fn bandwidth_used(&self) -> f64;

    /// Smoothed round-trip time in seconds.
    fn rtt_estimate(&self) -> f64;

    /// Drop a queued or in-flight block. Returns false if it was already done.
    fn cancel(&mut self, block: BlockId) -> bool;
}

/// Per-link statistics, recomputed by the dispatch cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LinkState {
    pub name: String,
    pub queued: usize,
    pub bandwidth_budget: f64,
    pub efficiency: f64,
    pub bandwidth_used: f64,
    pub rtt_estimate: f64,
    /// Wall-clock time of the last heartbeat received on this link.
    pub last_heartbeat: Option<f64>,
}

impl LinkState {
    pub fn observe(link: &dyn LinkHandle, last_heartbeat: Option<f64>) -> Self {
        Self {
            name: link.name().to_string(),
            queued: link.queued(),
            bandwidth_budget: link.bandwidth_budget(),
            efficiency: link.efficiency(),
            bandwidth_used: link.bandwidth_used(),
            rtt_estimate: link.rtt_estimate(),
            last_heartbeat,
        }
    }
}

/// One configured peer address.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEndpoint {
    /// `remote_ip:remote_port:local_port:bandwidth`
    Udp {
        remote: SocketAddr,
        local_port: u16,
        bandwidth: u32,
    },
    /// `stub://name`: in-process sink.
    Stub(String),
}

impl LinkEndpoint {
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if let Some(name) = entry.strip_prefix("stub://") {
            if name.is_empty() {
                return Err(anyhow!("stub endpoint needs a name"));
            }
            return Ok(LinkEndpoint::Stub(name.to_string()));
        }
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 4 {
            return Err(anyhow!(
                "link endpoint '{}' must be remIP:remPort:localPort:bandwidth",
                entry
            ));
        }
        let remote_port: u16 = parts[1]
            .parse()
            .map_err(|_| anyhow!("bad remote port in '{}'", entry))?;
        let local_port: u16 = parts[2]
            .parse()
            .map_err(|_| anyhow!("bad local port in '{}'", entry))?;
        let bandwidth: u32 = parts[3]
            .parse()
            .map_err(|_| anyhow!("bad bandwidth in '{}'", entry))?;
        if bandwidth == 0 {
            return Err(anyhow!("bandwidth must be > 0 in '{}'", entry));
        }
        let remote = (parts[0], remote_port)
            .to_socket_addrs()
            .map_err(|e| anyhow!("cannot resolve '{}': {}", parts[0], e))?
            .next()
            .ok_or_else(|| anyhow!("no address for '{}'", parts[0]))?;
        Ok(LinkEndpoint::Udp {
            remote,
            local_port,
            bandwidth,
        })
    }

    /// Parse a comma separated list, logging and skipping bad entries.
    pub fn parse_list(csv: &str) -> Vec<Self> {
        csv.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match Self::parse(entry) {
                Ok(endpoint) => Some(endpoint),
                Err(err) => {
                    log::warn!("ignoring link endpoint: {}", err);
                    None
                }
            })
            .collect()
    }

    pub fn open(&self) -> Result<Box<dyn LinkHandle>> {
        match self {
            LinkEndpoint::Udp {
                remote,
                local_port,
                bandwidth,
            } => Ok(Box::new(UdpBlockLink::bind(
                *remote,
                *local_port,
                *bandwidth,
            )?)),
            LinkEndpoint::Stub(name) => Ok(Box::new(LoopbackLink::sink(name))),
        }
    }
}

/// Open every endpoint in `csv`; endpoints that fail to open are logged and skipped.
pub fn open_links(csv: &str) -> Vec<Box<dyn LinkHandle>> {
    LinkEndpoint::parse_list(csv)
        .iter()
        .filter_map(|endpoint| match endpoint.open() {
            Ok(link) => {
                log::info!("opened link {}", link.name());
                Some(link)
            }
            Err(err) => {
                log::warn!("failed to open link {:?}: {}", endpoint, err);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_and_stub_endpoints() {
        let list = LinkEndpoint::parse_list("127.0.0.1:14550:14551:40000, stub://radio2, bogus");
        assert_eq!(list.len(), 2);
        assert_eq!(
            list[0],
            LinkEndpoint::Udp {
                remote: "127.0.0.1:14550".parse().unwrap(),
                local_port: 14551,
                bandwidth: 40000,
            }
        );
        assert_eq!(list[1], LinkEndpoint::Stub("radio2".to_string()));
    }

    #[test]
    fn rejects_zero_bandwidth_and_bad_ports() {
        assert!(LinkEndpoint::parse("127.0.0.1:14550:14551:0").is_err());
        assert!(LinkEndpoint::parse("127.0.0.1:99999:14551:100").is_err());
        assert!(LinkEndpoint::parse("stub://").is_err());
    }
}
