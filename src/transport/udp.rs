//! Reliable block transfer over a single UDP path.
//!
//! Blocks are split into chunks of at most `CHUNK_SIZE` bytes. Every chunk
//! is acknowledged individually and resent after a retransmission timeout
//! derived from the smoothed RTT. A token bucket keeps the send rate under
//! the configured bandwidth.
//!
//! Datagram layout (big endian):
//!
//! ```text
//! DATA: 0x01 | block u64 | chunk u16 | count u16 | payload
//! ACK:  0x02 | block u64 | chunk u16
//! ```

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use super::{BlockId, CompletionCallback, LinkHandle};

pub const CHUNK_SIZE: usize = 1000;

const KIND_DATA: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const DATA_HEADER: usize = 1 + 8 + 2 + 2;
const ACK_LEN: usize = 1 + 8 + 2;
const MAX_DATAGRAM: usize = DATA_HEADER + CHUNK_SIZE;

const INITIAL_RTT: f64 = 1.0;
const MIN_RTO: f64 = 0.2;
const RTT_ALPHA: f64 = 0.125;
const RATE_ALPHA: f64 = 0.2;
const MAX_PARTIAL_BLOCKS: usize = 64;
const COMPLETED_MEMORY: usize = 1024;
const RECEIVE_POLL: Duration = Duration::from_millis(5);

struct Chunk {
    acked: bool,
    sent_at: Option<Instant>,
    sends: u32,
}

struct OutBlock {
    id: BlockId,
    payload: Vec<u8>,
    chunks: Vec<Chunk>,
    unacked: usize,
    on_complete: Option<CompletionCallback>,
}

impl OutBlock {
    fn chunk_bytes(&self, idx: usize) -> &[u8] {
        let start = idx * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.payload.len());
        &self.payload[start..end]
    }
}

struct InBlock {
    chunks: Vec<Option<Vec<u8>>>,
    missing: usize,
}

pub struct UdpBlockLink {
    name: String,
    socket: UdpSocket,
    remote: SocketAddr,
    bandwidth: f64,
    next_id: BlockId,
    outgoing: BTreeMap<(u32, BlockId), OutBlock>,
    incoming: HashMap<BlockId, InBlock>,
    incoming_order: VecDeque<BlockId>,
    completed_in: HashSet<BlockId>,
    completed_order: VecDeque<BlockId>,
    received: VecDeque<Vec<u8>>,
    tokens: f64,
    last_tick: Instant,
    rtt: f64,
    bytes_sent: u64,
    unique_bytes: u64,
    sent_since_tick: u64,
    rate: f64,
}

/// Token bucket depth. Always holds one full datagram so slow links still send.
fn burst_size(bandwidth: f64) -> f64 {
    bandwidth.max(MAX_DATAGRAM as f64)
}

impl UdpBlockLink {
    /// Bind `local_port` on all interfaces and talk to `remote` at up to
    /// `bandwidth` bytes per second.
    pub fn bind(remote: SocketAddr, local_port: u16, bandwidth: u32) -> Result<Self> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], local_port).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, local_port).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .with_context(|| format!("failed to bind udp port {}", local_port))?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self {
            name: format!("udp:{}->{}", local.port(), remote),
            socket,
            remote,
            bandwidth: bandwidth as f64,
            // Random start so a restarted sender does not reuse ids the peer
            // still remembers as completed.
            next_id: rand::random::<u32>() as BlockId + 1,
            outgoing: BTreeMap::new(),
            incoming: HashMap::new(),
            incoming_order: VecDeque::new(),
            completed_in: HashSet::new(),
            completed_order: VecDeque::new(),
            received: VecDeque::new(),
            tokens: burst_size(bandwidth as f64),
            last_tick: Instant::now(),
            rtt: INITIAL_RTT,
            bytes_sent: 0,
            unique_bytes: 0,
            sent_since_tick: 0,
            rate: 0.0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn rto(&self) -> Duration {
        Duration::from_secs_f64((2.0 * self.rtt).max(MIN_RTO))
    }

    /// Read every datagram currently waiting on the socket.
    fn pump(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from != self.remote {
                        log::trace!("{}: ignoring datagram from {}", self.name, from);
                        continue;
                    }
                    if let Err(err) = self.handle_datagram(&buf[..len]) {
                        log::debug!("{}: bad datagram: {}", self.name, err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => continue,
                Err(err) => {
                    log::warn!("{}: receive failed: {}", self.name, err);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        let kind = *datagram.first().ok_or_else(|| anyhow!("empty datagram"))?;
        match kind {
            KIND_ACK if datagram.len() == ACK_LEN => {
                let block = read_u64(&datagram[1..9]);
                let chunk = read_u16(&datagram[9..11]) as usize;
                self.on_ack(block, chunk);
                Ok(())
            }
            KIND_DATA if datagram.len() > DATA_HEADER => {
                let block = read_u64(&datagram[1..9]);
                let chunk = read_u16(&datagram[9..11]) as usize;
                let count = read_u16(&datagram[11..13]) as usize;
                if count == 0 || chunk >= count {
                    return Err(anyhow!("chunk {} of {}", chunk, count));
                }
                self.send_ack(block, chunk as u16);
                self.on_data(block, chunk, count, &datagram[DATA_HEADER..]);
                Ok(())
            }
            other => Err(anyhow!("kind {:#x}, {} bytes", other, datagram.len())),
        }
    }

    fn on_ack(&mut self, block: BlockId, chunk: usize) {
        let Some(key) = self.outgoing.keys().find(|(_, id)| *id == block).copied() else {
            return;
        };
        let mut done = false;
        if let Some(out) = self.outgoing.get_mut(&key) {
            if let Some(state) = out.chunks.get_mut(chunk) {
                if !state.acked {
                    state.acked = true;
                    out.unacked -= 1;
                    // Only first transmissions give an unambiguous sample.
                    if state.sends == 1 {
                        if let Some(sent_at) = state.sent_at {
                            let sample = sent_at.elapsed().as_secs_f64();
                            self.rtt += RTT_ALPHA * (sample - self.rtt);
                        }
                    }
                }
            }
            done = out.unacked == 0;
        }
        if done {
            if let Some(out) = self.outgoing.remove(&key) {
                self.unique_bytes += out.payload.len() as u64;
                if let Some(cb) = out.on_complete {
                    cb(out.id);
                }
            }
        }
    }

    fn on_data(&mut self, block: BlockId, chunk: usize, count: usize, payload: &[u8]) {
        if self.completed_in.contains(&block) {
            return;
        }
        if !self.incoming.contains_key(&block) {
            if self.incoming_order.len() >= MAX_PARTIAL_BLOCKS {
                if let Some(old) = self.incoming_order.pop_front() {
                    self.incoming.remove(&old);
                }
            }
            self.incoming_order.push_back(block);
            self.incoming.insert(
                block,
                InBlock {
                    chunks: vec![None; count],
                    missing: count,
                },
            );
        }
        let Some(entry) = self.incoming.get_mut(&block) else {
            return;
        };
        if entry.chunks.len() != count {
            return;
        }
        if entry.chunks[chunk].is_none() {
            entry.chunks[chunk] = Some(payload.to_vec());
            entry.missing -= 1;
        }
        if entry.missing > 0 {
            return;
        }
        if let Some(entry) = self.incoming.remove(&block) {
            self.incoming_order.retain(|id| *id != block);
            let data: Vec<u8> = entry.chunks.into_iter().flatten().flatten().collect();
            self.received.push_back(data);
            self.completed_in.insert(block);
            self.completed_order.push_back(block);
            while self.completed_order.len() > COMPLETED_MEMORY {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed_in.remove(&old);
                }
            }
        }
    }

    fn send_ack(&mut self, block: BlockId, chunk: u16) {
        let mut ack = [0u8; ACK_LEN];
        ack[0] = KIND_ACK;
        ack[1..9].copy_from_slice(&block.to_be_bytes());
        ack[9..11].copy_from_slice(&chunk.to_be_bytes());
        if let Err(err) = self.socket.send_to(&ack, self.remote) {
            log::debug!("{}: ack send failed: {}", self.name, err);
        }
    }

    fn transmit(&mut self, max_in_flight: usize) {
        let now = Instant::now();
        let rto = self.rto();
        let mut in_flight = self
            .outgoing
            .values()
            .flat_map(|b| b.chunks.iter())
            .filter(|c| !c.acked && c.sent_at.is_some_and(|t| now.duration_since(t) < rto))
            .count();

        let mut datagram = Vec::with_capacity(MAX_DATAGRAM);
        let keys: Vec<(u32, BlockId)> = self.outgoing.keys().copied().collect();
        'blocks: for key in keys {
            let Some(block) = self.outgoing.get(&key) else {
                continue;
            };
            let count = block.chunks.len() as u16;
            for idx in 0..block.chunks.len() {
                if in_flight >= max_in_flight {
                    break 'blocks;
                }
                let Some(block) = self.outgoing.get(&key) else {
                    continue 'blocks;
                };
                let chunk = &block.chunks[idx];
                let due = !chunk.acked && chunk.sent_at.map_or(true, |t| now.duration_since(t) >= rto);
                if !due {
                    continue;
                }
                let bytes = block.chunk_bytes(idx);
                let wire_len = (DATA_HEADER + bytes.len()) as f64;
                if self.tokens < wire_len {
                    break 'blocks;
                }
                datagram.clear();
                datagram.push(KIND_DATA);
                datagram.extend_from_slice(&block.id.to_be_bytes());
                datagram.extend_from_slice(&(idx as u16).to_be_bytes());
                datagram.extend_from_slice(&count.to_be_bytes());
                datagram.extend_from_slice(bytes);
                match self.socket.send_to(&datagram, self.remote) {
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break 'blocks,
                    Err(err) => {
                        log::debug!("{}: send failed: {}", self.name, err);
                        break 'blocks;
                    }
                }
                self.tokens -= wire_len;
                self.bytes_sent += wire_len as u64;
                self.sent_since_tick += wire_len as u64;
                if let Some(block) = self.outgoing.get_mut(&key) {
                    let chunk = &mut block.chunks[idx];
                    chunk.sent_at = Some(now);
                    chunk.sends += 1;
                }
                in_flight += 1;
            }
        }
    }
}

impl LinkHandle for UdpBlockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, max_in_flight: usize, max_queue: usize) {
        self.pump();

        while self.outgoing.len() > max_queue {
            if let Some((key, _)) = self.outgoing.pop_last() {
                log::debug!("{}: trimmed block {} (priority {})", self.name, key.1, key.0);
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        self.tokens = (self.tokens + self.bandwidth * dt).min(burst_size(self.bandwidth));
        if dt > 0.0 {
            let sample = self.sent_since_tick as f64 / dt;
            self.rate += RATE_ALPHA * (sample - self.rate);
        }
        self.sent_since_tick = 0;

        self.transmit(max_in_flight);
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(block) = self.received.pop_front() {
                return Some(block);
            }
            self.pump();
            if let Some(block) = self.received.pop_front() {
                return Some(block);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(RECEIVE_POLL.min(deadline - now));
        }
    }

    fn send(
        &mut self,
        payload: Vec<u8>,
        priority: u32,
        on_complete: Option<CompletionCallback>,
    ) -> Result<BlockId> {
        let count = payload.len().div_ceil(CHUNK_SIZE).max(1);
        if count > u16::MAX as usize {
            return Err(anyhow!(
                "{}: block of {} bytes exceeds the link limit",
                self.name,
                payload.len()
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        let chunks = (0..count)
            .map(|_| Chunk {
                acked: false,
                sent_at: None,
                sends: 0,
            })
            .collect();
        self.outgoing.insert(
            (priority, id),
            OutBlock {
                id,
                payload,
                chunks,
                unacked: count,
                on_complete,
            },
        );
        Ok(id)
    }

    fn queued(&self) -> usize {
        self.outgoing.len()
    }

    fn bandwidth_budget(&self) -> f64 {
        self.bandwidth
    }

    fn efficiency(&self) -> f64 {
        if self.bytes_sent == 0 {
            1.0
        } else {
            (self.unique_bytes as f64 / self.bytes_sent as f64).min(1.0)
        }
    }

    fn bandwidth_used(&self) -> f64 {
        self.rate
    }

    fn rtt_estimate(&self) -> f64 {
        self.rtt
    }

    fn cancel(&mut self, block: BlockId) -> bool {
        let key = self.outgoing.keys().find(|(_, id)| *id == block).copied();
        key.and_then(|key| self.outgoing.remove(&key)).is_some()
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn pair() -> (UdpBlockLink, UdpBlockLink) {
        let probe_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let probe_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port_a = probe_a.local_addr().unwrap().port();
        let port_b = probe_b.local_addr().unwrap().port();
        drop((probe_a, probe_b));
        let a = UdpBlockLink::bind(([127, 0, 0, 1], port_b).into(), port_a, 1_000_000).unwrap();
        let b = UdpBlockLink::bind(([127, 0, 0, 1], port_a).into(), port_b, 1_000_000).unwrap();
        (a, b)
    }

    #[test]
    fn multi_chunk_block_is_reassembled_and_acknowledged() {
        let (mut air, mut ground) = pair();
        // Bind on all interfaces but peer on loopback: the source address
        // of loopback traffic is 127.0.0.1, matching `remote`.
        let payload: Vec<u8> = (0..3500u32).map(|i| (i % 251) as u8).collect();
        let done = Arc::new(AtomicBool::new(false));
        let done_cb = done.clone();
        air.send(
            payload.clone(),
            10_000,
            Some(Box::new(move |_| done_cb.store(true, Ordering::SeqCst))),
        )
        .unwrap();
        assert_eq!(air.queued(), 1);

        let mut got = None;
        for _ in 0..200 {
            air.tick(100, 100);
            ground.tick(100, 100);
            if got.is_none() {
                got = ground.receive(Duration::from_millis(5));
            }
            if got.is_some() && done.load(Ordering::SeqCst) {
                break;
            }
        }
        assert_eq!(got.unwrap(), payload);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(air.queued(), 0);
        assert!(air.efficiency() > 0.9);
    }

    #[test]
    fn link_slower_than_one_datagram_still_delivers() {
        let probe_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let probe_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port_a = probe_a.local_addr().unwrap().port();
        let port_b = probe_b.local_addr().unwrap().port();
        drop((probe_a, probe_b));
        let mut air = UdpBlockLink::bind(([127, 0, 0, 1], port_b).into(), port_a, 800).unwrap();
        let mut ground =
            UdpBlockLink::bind(([127, 0, 0, 1], port_a).into(), port_b, 800).unwrap();

        let payload = vec![7u8; 2000];
        air.send(payload.clone(), 10_000, None).unwrap();
        let deadline = Instant::now() + Duration::from_secs(6);
        let mut got = None;
        while got.is_none() && Instant::now() < deadline {
            air.tick(10, 10);
            ground.tick(10, 10);
            got = ground.receive(Duration::from_millis(10));
        }
        assert_eq!(got, Some(payload));
        assert!(air.bytes_sent >= 2000);
    }

    #[test]
    fn trims_least_urgent_blocks_beyond_max_queue() {
        let (mut air, _ground) = pair();
        air.send(vec![1; 10], 10_000, None).unwrap();
        let urgent = air.send(vec![2; 10], 1_000, None).unwrap();
        air.tick(0, 1);
        assert_eq!(air.queued(), 1);
        assert!(air.cancel(urgent));
        assert_eq!(air.queued(), 0);
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        let (mut air, _ground) = pair();
        assert!(air.handle_datagram(&[]).is_err());
        assert!(air.handle_datagram(&[0x7f, 1, 2]).is_err());
        let mut bad = vec![KIND_DATA];
        bad.extend_from_slice(&1u64.to_be_bytes());
        bad.extend_from_slice(&5u16.to_be_bytes());
        bad.extend_from_slice(&2u16.to_be_bytes());
        bad.push(0);
        assert!(air.handle_datagram(&bad).is_err());
    }
}
