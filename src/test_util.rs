//! An in-memory fabric for testing endpoints without hardware: datagram
//! devices wired through a shared switch, a registrar that publishes
//! exposed memory for device reads, and a table-driven resolver. Used for
//! testing the transport itself, and exported so applications can test
//! against an `Endpoint` the same way.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::clock::ManualClock;
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::pools::packet_pool::PacketHandle;
use crate::transport::{
    AddressResolver, Completion, CompletionKind, CompletionStatus, DatagramDevice, MemoryAccess,
    MemoryRegistrar, MrHandle, PeerAddr, PeerDescriptor,
};

/// Switch port: one per (endpoint address, device kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PortId {
    addr: PeerAddr,
    loopback: bool,
}

#[derive(Default)]
struct Port {
    posted_recvs: VecDeque<PacketHandle>,
    completions: VecDeque<Completion>,
    /// Datagrams parked by `hold`, delivered on `release`.
    held: VecDeque<(PeerAddr, Bytes)>,
    holding: bool,
    /// Sends towards this port that bounce with receiver-not-ready,
    /// regardless of posted buffers.
    forced_bounces: u32,
    /// Sizes of the datagrams delivered into this port, in order.
    delivered_sizes: Vec<usize>,
}

#[derive(Default)]
struct FabricInner {
    ports: HashMap<PortId, Port>,
    /// Memory exposed through the registrar, readable by remote devices.
    regions: HashMap<PeerAddr, HashMap<u64, Bytes>>,
    next_key: u64,
}

impl FabricInner {
    fn port(&mut self, id: PortId) -> &mut Port {
        self.ports.entry(id).or_default()
    }

    fn deliver(&mut self, from: PeerAddr, to: PortId, payload: Bytes) -> CompletionStatus {
        let port = self.port(to);
        if port.holding {
            port.held.push_back((from, payload));
            return CompletionStatus::Ok;
        }
        if port.forced_bounces > 0 {
            port.forced_bounces -= 1;
            return CompletionStatus::ReceiverNotReady;
        }
        let Some(slot) = port.posted_recvs.pop_front() else {
            return CompletionStatus::ReceiverNotReady;
        };
        port.delivered_sizes.push(payload.len());
        port.completions.push_back(Completion {
            ctx: slot,
            status: CompletionStatus::Ok,
            kind: CompletionKind::Recv { src: Some(from), payload },
        });
        CompletionStatus::Ok
    }
}

/// The shared switch. Cloning yields another handle to the same fabric.
#[derive(Clone, Default)]
pub struct TestFabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl TestFabric {
    pub fn new() -> TestFabric {
        TestFabric::default()
    }

    pub fn device(&self, addr: PeerAddr, max_payload: usize, supports_read: bool) -> Box<dyn DatagramDevice> {
        Box::new(InMemDevice {
            fabric: self.inner.clone(),
            port: PortId { addr, loopback: false },
            max_payload,
            supports_read,
        })
    }

    pub fn loopback_device(&self, addr: PeerAddr, max_payload: usize) -> Box<dyn DatagramDevice> {
        Box::new(InMemDevice {
            fabric: self.inner.clone(),
            port: PortId { addr, loopback: true },
            max_payload,
            supports_read: true,
        })
    }

    pub fn registrar(&self, addr: PeerAddr) -> Box<dyn MemoryRegistrar> {
        Box::new(InMemRegistrar { fabric: self.inner.clone(), addr })
    }

    /// The next `n` datagrams towards `addr` bounce with receiver-not-ready.
    pub fn bounce_next(&self, addr: PeerAddr, n: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.port(PortId { addr, loopback: false }).forced_bounces += n;
    }

    /// Parks all datagrams towards `addr` until `release` / `release_reversed`.
    pub fn hold(&self, addr: PeerAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.port(PortId { addr, loopback: false }).holding = true;
    }

    pub fn release(&self, addr: PeerAddr) {
        self.release_impl(addr, false);
    }

    /// Delivers held datagrams in reverse arrival order, simulating an
    /// unordered fabric.
    pub fn release_reversed(&self, addr: PeerAddr) {
        self.release_impl(addr, true);
    }

    /// Sizes of all datagrams delivered to `addr` so far, in arrival order.
    pub fn delivered_sizes(&self, addr: PeerAddr) -> Vec<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.port(PortId { addr, loopback: false }).delivered_sizes.clone()
    }

    /// Receive slots currently posted at `addr`'s hardware port.
    pub fn posted_recv_slots(&self, addr: PeerAddr) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.port(PortId { addr, loopback: false }).posted_recvs.len()
    }

    /// Sizes of the datagrams currently parked by `hold` towards `addr`.
    pub fn held_sizes(&self, addr: PeerAddr) -> Vec<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.port(PortId { addr, loopback: false }).held.iter().map(|(_, p)| p.len()).collect()
    }

    fn release_impl(&self, addr: PeerAddr, reversed: bool) {
        let mut inner = self.inner.lock().unwrap();
        let id = PortId { addr, loopback: false };
        let mut held: Vec<(PeerAddr, Bytes)> = {
            let port = inner.port(id);
            port.holding = false;
            port.held.drain(..).collect()
        };
        if reversed {
            held.reverse();
        }
        for (from, payload) in held {
            inner.deliver(from, id, payload);
        }
    }
}

struct InMemDevice {
    fabric: Arc<Mutex<FabricInner>>,
    port: PortId,
    max_payload: usize,
    supports_read: bool,
}

impl DatagramDevice for InMemDevice {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn supports_read(&self) -> bool {
        self.supports_read
    }

    fn post_send(&mut self, to: PeerAddr, packet: &[u8], ctx: PacketHandle, _more: bool) -> Result<()> {
        let mut inner = self.fabric.lock().unwrap();
        let target = PortId { addr: to, loopback: self.port.loopback };
        let status = inner.deliver(self.port.addr, target, Bytes::copy_from_slice(packet));
        inner.port(self.port).completions.push_back(Completion {
            ctx,
            status,
            kind: CompletionKind::Send,
        });
        Ok(())
    }

    fn post_recv(&mut self, _capacity: usize, ctx: PacketHandle, _more: bool) -> Result<()> {
        let mut inner = self.fabric.lock().unwrap();
        inner.port(self.port).posted_recvs.push_back(ctx);
        Ok(())
    }

    fn post_read(&mut self, from: PeerAddr, key: u64, offset: u64, len: u64, ctx: PacketHandle) -> Result<()> {
        let mut inner = self.fabric.lock().unwrap();
        let completion = match inner
            .regions
            .get(&from)
            .and_then(|regions| regions.get(&key))
            .and_then(|data| {
                let start = offset as usize;
                let end = start + len as usize;
                if end <= data.len() { Some(data.slice(start..end)) } else { None }
            }) {
            Some(payload) => Completion {
                ctx,
                status: CompletionStatus::Ok,
                kind: CompletionKind::Read { payload },
            },
            None => Completion {
                ctx,
                status: CompletionStatus::Error(-2),
                kind: CompletionKind::Read { payload: Bytes::new() },
            },
        };
        inner.port(self.port).completions.push_back(completion);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll(&mut self, max: usize, out: &mut Vec<Completion>) {
        let mut inner = self.fabric.lock().unwrap();
        let port = inner.port(self.port);
        for _ in 0..max {
            let Some(completion) = port.completions.pop_front() else { break };
            out.push(completion);
        }
    }
}

struct InMemRegistrar {
    fabric: Arc<Mutex<FabricInner>>,
    addr: PeerAddr,
}

impl MemoryRegistrar for InMemRegistrar {
    fn register(&mut self, _len: usize, _access: MemoryAccess) -> Result<MrHandle> {
        let mut inner = self.fabric.lock().unwrap();
        inner.next_key += 1;
        Ok(MrHandle(inner.next_key))
    }

    fn expose(&mut self, data: Bytes, _access: MemoryAccess) -> Result<MrHandle> {
        let mut inner = self.fabric.lock().unwrap();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.regions.entry(self.addr).or_default().insert(key, data);
        Ok(MrHandle(key))
    }

    fn deregister(&mut self, mr: MrHandle) -> Result<()> {
        let mut inner = self.fabric.lock().unwrap();
        if let Some(regions) = inner.regions.get_mut(&self.addr) {
            regions.remove(&mr.0);
        }
        Ok(())
    }
}

/// Resolver over a fixed routing table; addresses not listed resolve as
/// remote peers.
pub struct TableResolver {
    local: Vec<PeerAddr>,
}

impl TableResolver {
    pub fn all_remote() -> TableResolver {
        TableResolver { local: Vec::new() }
    }

    pub fn with_local(local: Vec<PeerAddr>) -> TableResolver {
        TableResolver { local }
    }
}

impl AddressResolver for TableResolver {
    fn resolve(&self, addr: PeerAddr) -> Option<PeerDescriptor> {
        Some(PeerDescriptor { is_local: self.local.contains(&addr) })
    }
}

/// Two endpoints on one fabric, with a shared hand-cranked clock.
pub struct TestPair {
    pub a: Endpoint,
    pub b: Endpoint,
    pub addr_a: PeerAddr,
    pub addr_b: PeerAddr,
    pub fabric: TestFabric,
    pub clock: ManualClock,
}

impl TestPair {
    pub fn new(config: EndpointConfig) -> TestPair {
        TestPair::with_read_support(config, false)
    }

    pub fn with_read_support(config: EndpointConfig, supports_read: bool) -> TestPair {
        let fabric = TestFabric::new();
        let clock = ManualClock::new(1);
        let (addr_a, addr_b) = (1, 2);
        let a = Endpoint::new(
            config.clone(),
            fabric.device(addr_a, config.max_payload_size, supports_read),
            None,
            fabric.registrar(addr_a),
            Box::new(TableResolver::all_remote()),
            Box::new(clock.clone()),
        )
        .unwrap();
        let b = Endpoint::new(
            config.clone(),
            fabric.device(addr_b, config.max_payload_size, supports_read),
            None,
            fabric.registrar(addr_b),
            Box::new(TableResolver::all_remote()),
            Box::new(clock.clone()),
        )
        .unwrap();
        TestPair { a, b, addr_a, addr_b, fabric, clock }
    }

    /// Runs `n` progress ticks on both endpoints.
    pub fn tick(&self, n: usize) {
        for _ in 0..n {
            self.a.progress();
            self.b.progress();
        }
    }
}

/// A small config suited to driving the protocol through all its phases
/// with little data: 64 byte payloads and a 4 credit budget.
pub fn small_config() -> EndpointConfig {
    let mut config = EndpointConfig::default_hw();
    config.max_payload_size = 64;
    config.tx_queue_size = 32;
    config.rx_queue_size = 32;
    config.tx_pool_chunk_size = 32;
    config.unexpected_pool_chunk_size = 8;
    config.out_of_order_pool_chunk_size = 8;
    config.ctrl_response_pool_chunk_size = 8;
    config.send_desc_pool_chunk_size = 8;
    config.tx_entry_count = 16;
    config.rx_entry_count = 16;
    config.read_entry_count = 16;
    config.peer_credits = 4;
    config.min_credits = 1;
    config
}
