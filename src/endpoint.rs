//! The endpoint: owns the packet pools, entry pools and per-peer state, and
//! exposes the submission API. All state lives behind one mutex; the
//! progress engine (see `progress`) and the submission paths both funnel
//! through it, so no field needs its own synchronization.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::flow_control::compute_credit_request;
use crate::peer::Peer;
use crate::pools::entry_pool::{EntryPool, Handle};
use crate::pools::packet_pool::{PacketHandle, PacketOwner, PacketPools, PoolId, PoolSizes, SentFrame};
use crate::read_entry::{ReadEntry, ReadOwner, ReadState};
use crate::rx_entry::{MatchSpec, RxEntry, RxState};
use crate::transport::{
    AddressResolver, DatagramDevice, MemoryAccess, MemoryRegistrar, PeerAddr,
};
use crate::tx_entry::{TxEntry, TxOp, TxState};
use crate::wire::{
    AtomicOp, AtomicRequestFrame, Frame, ReadRegion, RequestFrame, WireOp, FEATURE_DEVICE_READ,
};

/// Handle returned by the submission API, usable for `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpHandle {
    Tx(Handle<TxEntry>),
    Rx(Handle<RxEntry>),
}

/// User-visible operation completions, drained with `poll_completions`.
#[derive(Debug, PartialEq)]
pub enum OpCompletion {
    Send { context: u64, error: Option<Error> },
    Receive { context: u64, buffer: Vec<u8>, len: u64, error: Option<Error> },
    /// One message landed in a multi-recv buffer; the bytes sit at
    /// `offset..offset + len` of the buffer that `MultiRecvDone` returns.
    MultiRecv { context: u64, offset: usize, len: u64, error: Option<Error> },
    /// A multi-recv buffer is retired; no further messages land in it.
    MultiRecvDone { context: u64, buffer: Vec<u8> },
    Write { context: u64, error: Option<Error> },
    Read { context: u64, buffer: Vec<u8>, error: Option<Error> },
    Atomic { context: u64, value: Option<u64>, error: Option<Error> },
}

/// Errors not attributable to a single operation, drained with `poll_events`.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointEvent {
    pub peer: Option<PeerAddr>,
    pub error: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOption {
    MinMultiRecvSize(usize),
}

pub struct RecvRequest {
    pub from: Option<PeerAddr>,
    pub tag: Option<u64>,
    pub buffer: Vec<u8>,
    pub multi_recv: bool,
    pub context: u64,
}

pub struct Endpoint {
    core: Mutex<EndpointCore>,
}

impl Endpoint {
    pub fn new(
        config: EndpointConfig,
        hw: Box<dyn DatagramDevice>,
        loopback: Option<Box<dyn DatagramDevice>>,
        registrar: Box<dyn MemoryRegistrar>,
        resolver: Box<dyn AddressResolver>,
        clock: Box<dyn Clock>,
    ) -> anyhow::Result<Endpoint> {
        config.validate()?;
        Ok(Endpoint {
            core: Mutex::new(EndpointCore::new(config, hw, loopback, registrar, resolver, clock)),
        })
    }

    pub fn submit_send(
        &self,
        peer: PeerAddr,
        segments: Vec<Bytes>,
        tag: Option<u64>,
        context: u64,
    ) -> Result<OpHandle> {
        self.core.lock().unwrap().submit_transfer(peer, TxOp::Send { tag }, segments, context)
    }

    pub fn submit_recv(&self, request: RecvRequest) -> Result<OpHandle> {
        self.core.lock().unwrap().submit_recv(request)
    }

    pub fn submit_write(
        &self,
        peer: PeerAddr,
        segments: Vec<Bytes>,
        key: u64,
        offset: u64,
        context: u64,
    ) -> Result<OpHandle> {
        self.core.lock().unwrap()
            .submit_transfer(peer, TxOp::Write { key, offset }, segments, context)
    }

    pub fn submit_read(
        &self,
        peer: PeerAddr,
        key: u64,
        offset: u64,
        len: u64,
        context: u64,
    ) -> Result<OpHandle> {
        self.core.lock().unwrap().submit_read(peer, key, offset, len, context)
    }

    pub fn submit_atomic(
        &self,
        peer: PeerAddr,
        op: AtomicOp,
        key: u64,
        operand: u64,
        compare: u64,
        context: u64,
    ) -> Result<OpHandle> {
        self.core.lock().unwrap().submit_atomic(peer, op, key, operand, compare, context)
    }

    /// Cancels a posted receive. Returns whether the operation was found;
    /// receives that already matched are drained silently.
    pub fn cancel(&self, op: OpHandle) -> bool {
        self.core.lock().unwrap().cancel(op)
    }

    /// Runs one progress tick: polls the devices, replenishes receive
    /// buffers, drains queues and sends data as flow control allows.
    pub fn progress(&self) {
        self.core.lock().unwrap().progress_tick()
    }

    pub fn poll_completions(&self, max: usize) -> Vec<OpCompletion> {
        let mut core = self.core.lock().unwrap();
        let n = max.min(core.completions.len());
        core.completions.drain(..n).collect()
    }

    pub fn poll_events(&self, max: usize) -> Vec<EndpointEvent> {
        let mut core = self.core.lock().unwrap();
        let n = max.min(core.events.len());
        core.events.drain(..n).collect()
    }

    pub fn set_option(&self, option: EndpointOption) {
        let mut core = self.core.lock().unwrap();
        match option {
            EndpointOption::MinMultiRecvSize(size) => core.min_multi_recv_size = size,
        }
    }

    pub fn min_multi_recv_size(&self) -> usize {
        self.core.lock().unwrap().min_multi_recv_size
    }

    /// Exposes an atomic cell remote peers may operate on.
    pub fn expose_atomic(&self, key: u64, initial: u64) {
        self.core.lock().unwrap().atomic_cells.insert(key, initial);
    }

    pub fn atomic_value(&self, key: u64) -> Option<u64> {
        self.core.lock().unwrap().atomic_cells.get(&key).copied()
    }

    /// Exposes a region as a target for remote writes and a source for
    /// remote reads. Returns its key.
    pub fn expose_region(&self, data: Vec<u8>) -> Result<u64> {
        self.core.lock().unwrap().expose_region(data)
    }

    pub fn region(&self, key: u64) -> Option<Vec<u8>> {
        self.core.lock().unwrap().exposed_regions.get(&key).cloned()
    }

    /// Releases all device-visible memory.
    pub fn close(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let EndpointCore { pools, registrar, .. } = &mut *core;
        pools.deregister_all(registrar.as_mut())
    }
}

pub(crate) struct EndpointCore {
    pub(crate) config: EndpointConfig,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) hw: Box<dyn DatagramDevice>,
    pub(crate) loopback: Option<Box<dyn DatagramDevice>>,
    pub(crate) registrar: Box<dyn MemoryRegistrar>,
    pub(crate) resolver: Box<dyn AddressResolver>,

    pub(crate) pools: PacketPools,
    pub(crate) tx_entries: EntryPool<TxEntry>,
    pub(crate) rx_entries: EntryPool<RxEntry>,
    pub(crate) read_entries: EntryPool<ReadEntry>,

    pub(crate) peers: FxHashMap<PeerAddr, Peer>,

    /// Receives posted by the application, in posting order.
    pub(crate) posted_recvs: Vec<Handle<RxEntry>>,
    /// Unexpected-message entries, in arrival order.
    pub(crate) unexpected: Vec<Handle<RxEntry>>,

    pub(crate) rx_queued_rnr: Vec<Handle<RxEntry>>,
    pub(crate) rx_queued_ctrl: Vec<Handle<RxEntry>>,
    pub(crate) tx_queued_rnr: Vec<Handle<TxEntry>>,
    pub(crate) tx_queued_ctrl: Vec<Handle<TxEntry>>,

    /// Transfers with data left to send.
    pub(crate) tx_pending: Vec<Handle<TxEntry>>,
    /// Read fragments not yet posted to the device.
    pub(crate) read_pending: Vec<Handle<ReadEntry>>,
    /// Atomic replies (acks or fetch responses) that could not be posted.
    pub(crate) queued_atomic_responses: Vec<(PeerAddr, Frame)>,

    /// In-flight posts per device, bounded by `config.tx_queue_size`.
    pub(crate) hw_outstanding: u32,
    pub(crate) loopback_outstanding: u32,

    /// Receive buffers currently posted / owed to each device.
    pub(crate) hw_rx_posted: u32,
    pub(crate) hw_rx_to_post: u32,
    pub(crate) loopback_rx_posted: u32,
    pub(crate) loopback_rx_to_post: u32,

    /// Receive-side budget backing CTS grants.
    pub(crate) available_data_bufs: u32,
    /// When the budget hit zero; zero while the budget is positive.
    pub(crate) data_bufs_exhausted_since: u64,

    pub(crate) first_tick_done: bool,
    pub(crate) min_multi_recv_size: usize,

    pub(crate) exposed_regions: FxHashMap<u64, Vec<u8>>,
    pub(crate) atomic_cells: FxHashMap<u64, u64>,

    pub(crate) completions: VecDeque<OpCompletion>,
    pub(crate) events: VecDeque<EndpointEvent>,
}

impl EndpointCore {
    pub(crate) fn new(
        config: EndpointConfig,
        hw: Box<dyn DatagramDevice>,
        loopback: Option<Box<dyn DatagramDevice>>,
        registrar: Box<dyn MemoryRegistrar>,
        resolver: Box<dyn AddressResolver>,
        clock: Box<dyn Clock>,
    ) -> EndpointCore {
        let entry_size = config.max_payload_size + Frame::MAX_HEADER_LEN;
        let pools = PacketPools::new(&PoolSizes {
            entry_size,
            hw_tx_chunk: config.tx_pool_chunk_size,
            hw_rx_chunk: config.rx_queue_size,
            loopback_tx_chunk: config.loopback_tx_pool_chunk_size,
            loopback_rx_chunk: config.loopback_rx_pool_chunk_size,
            unexpected_chunk: config.unexpected_pool_chunk_size,
            out_of_order_chunk: config.out_of_order_pool_chunk_size,
            read_copy_size: config.read_copy_pool_size,
            ctrl_response_chunk: config.ctrl_response_pool_chunk_size,
            send_desc_chunk: config.send_desc_pool_chunk_size,
        });
        let available_data_bufs = config.rx_queue_size;
        let min_multi_recv_size = config.min_multi_recv_size;
        EndpointCore {
            tx_entries: EntryPool::new("tx", config.tx_entry_count),
            rx_entries: EntryPool::new("rx", config.rx_entry_count),
            read_entries: EntryPool::new("read", config.read_entry_count),
            config,
            clock,
            hw,
            loopback,
            registrar,
            resolver,
            pools,
            peers: FxHashMap::default(),
            posted_recvs: Vec::new(),
            unexpected: Vec::new(),
            rx_queued_rnr: Vec::new(),
            rx_queued_ctrl: Vec::new(),
            tx_queued_rnr: Vec::new(),
            tx_queued_ctrl: Vec::new(),
            tx_pending: Vec::new(),
            read_pending: Vec::new(),
            queued_atomic_responses: Vec::new(),
            hw_outstanding: 0,
            loopback_outstanding: 0,
            hw_rx_posted: 0,
            hw_rx_to_post: 0,
            loopback_rx_posted: 0,
            loopback_rx_to_post: 0,
            available_data_bufs,
            data_bufs_exhausted_since: 0,
            first_tick_done: false,
            min_multi_recv_size,
            exposed_regions: FxHashMap::default(),
            atomic_cells: FxHashMap::default(),
            completions: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    // ---- peers --------------------------------------------------------

    pub(crate) fn peer_mut(&mut self, addr: PeerAddr) -> Result<&mut Peer> {
        if !self.peers.contains_key(&addr) {
            let descriptor = self.resolver.resolve(addr)
                .ok_or(Error::InvalidArgument("unknown peer address"))?;
            if descriptor.is_local && self.loopback.is_none() {
                return Err(Error::InvalidArgument("local peer but no loopback device"));
            }
            let peer = Peer::new(
                addr,
                descriptor.is_local,
                self.config.peer_credits,
                self.config.rnr_backoff_initial,
                self.config.rnr_backoff_cap,
            );
            self.peers.insert(addr, peer);
        }
        Ok(self.peers.get_mut(&addr).unwrap())
    }

    pub(crate) fn is_backed_off(&self, addr: PeerAddr) -> bool {
        self.peers.get(&addr).map(|p| p.backoff.is_backed_off()).unwrap_or(false)
    }

    // ---- submission ---------------------------------------------------

    /// Common admission path for sends and writes: take a credit share,
    /// allocate the entry, and post (or queue) the request.
    pub(crate) fn submit_transfer(
        &mut self,
        peer_addr: PeerAddr,
        op: TxOp,
        segments: Vec<Bytes>,
        context: u64,
    ) -> Result<OpHandle> {
        let total_len: u64 = segments.iter().map(|s| s.len() as u64).sum();
        let max_payload = self.config.max_payload_size;
        let min_credits = self.config.min_credits;

        let peer = self.peer_mut(peer_addr)?;
        let credit_request = compute_credit_request(
            peer.tx_credits,
            peer.outstanding_ops,
            total_len,
            max_payload,
            min_credits,
        );
        if !peer.try_consume_credits(credit_request) {
            trace!(peer = peer_addr, credit_request, "admission blocked on credits");
            return Err(Error::Exhausted);
        }
        peer.outstanding_ops += 1;
        // writes bypass ordered delivery and carry no message id
        let msg_id = if matches!(op, TxOp::Send { .. }) { peer.alloc_msg_id() } else { 0 };
        let offer_read = peer.features & FEATURE_DEVICE_READ != 0
            && matches!(op, TxOp::Send { .. });

        let mut entry = TxEntry::new(peer_addr, op, msg_id, segments, context);
        entry.credit_request = credit_request;
        entry.credits_consumed = credit_request;

        // large transfers towards read-capable peers expose their segments
        // so the receiver can pull them with device reads; segments below
        // the registration threshold are cheaper to stream than to register
        if offer_read
            && self.config.read_offload_threshold.map(|t| total_len >= t).unwrap_or(false)
            && entry.segments.iter().all(|s| s.len() >= self.config.memory_registration_threshold)
        {
            for segment in entry.segments.clone() {
                match self.registrar.expose(segment, MemoryAccess::ReadTarget) {
                    Ok(mr) => entry.exposed_mrs.push(mr),
                    Err(e) => {
                        warn!(peer = peer_addr, "segment registration failed: {}", e);
                        for mr in entry.exposed_mrs.drain(..) {
                            self.registrar.deregister(mr).ok();
                        }
                        break;
                    }
                }
            }
        }

        let handle = match self.tx_entries.alloc(entry) {
            Ok(handle) => handle,
            Err(e) => {
                let peer = self.peers.get_mut(&peer_addr).unwrap();
                peer.return_credits(credit_request);
                peer.outstanding_ops -= 1;
                return Err(e);
            }
        };

        match self.post_tx_request(handle) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                self.tx_entries.get_mut(handle).unwrap().state = TxState::QueuedCtrl;
                self.tx_queued_ctrl.push(handle);
            }
            Err(e) => {
                self.abort_tx_submission(handle);
                return Err(e);
            }
        }
        Ok(OpHandle::Tx(handle))
    }

    pub(crate) fn submit_recv(&mut self, request: RecvRequest) -> Result<OpHandle> {
        let spec = MatchSpec { from: request.from, tag: request.tag };
        let entry = RxEntry::posted(spec, request.buffer, request.multi_recv, request.context);
        let handle = self.rx_entries.alloc(entry)?;
        self.posted_recvs.push(handle);

        // replay staged unexpected messages in arrival order; multi-recv
        // buffers may consume several of them
        loop {
            let Some(unexpected) = self.claim_unexpected(handle) else { break };
            let (staged, src) = {
                let entry = self.rx_entries.get_mut(unexpected).unwrap();
                (entry.staged_packet.take().unwrap(), entry.peer.unwrap())
            };
            self.rx_entries.release(unexpected);

            let raw: Vec<u8> = self.pools.get(staged).unwrap().buf.as_ref().to_vec();
            self.pools.release(staged);
            match Frame::deser(&mut &raw[..]) {
                Ok(Frame::Request(req)) => self.process_matched_request(handle, src, req),
                _ => panic!("staged unexpected packet must hold a request frame"),
            }
            // the posted entry is consumed unless it is a live multi-recv
            let still_open = self.rx_entries.get(handle)
                .map(|e| e.multi_recv && !e.retired && e.state == RxState::Init)
                .unwrap_or(false);
            if !still_open {
                break;
            }
        }
        if self.config.zero_copy_receive {
            self.post_user_recv_slot(handle);
        }
        Ok(OpHandle::Rx(handle))
    }

    /// Zero-copy mode: hands the posted buffer to the hardware device as a
    /// receive slot, tagged with its rx entry. The slot is posted again
    /// after every completion for as long as the entry stays unmatched.
    pub(crate) fn post_user_recv_slot(&mut self, handle: Handle<RxEntry>) {
        let capacity = {
            let Some(entry) = self.rx_entries.get(handle) else { return };
            if entry.state != RxState::Init || entry.retired {
                return;
            }
            entry.buffer.len() + Frame::MAX_HEADER_LEN
        };
        let ctx = match self.pools.acquire(PoolId::HwRx, self.registrar.as_mut()) {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        self.pools.get_mut(ctx).unwrap().owner = Some(PacketOwner::Rx(handle));
        match self.hw.post_recv(capacity, ctx, false) {
            Ok(()) => {}
            Err(e) => {
                self.pools.release(ctx);
                if !e.is_transient() {
                    self.push_event(None, e);
                }
            }
        }
    }

    /// Oldest staged unexpected message matching the posted receive. For
    /// multi-recv buffers the oldest match must also fit in the remaining
    /// space; if it does not, the message waits for another receive.
    fn claim_unexpected(&mut self, posted: Handle<RxEntry>) -> Option<Handle<RxEntry>> {
        let (spec, fits_in) = {
            let entry = self.rx_entries.get(posted)?;
            if entry.state != RxState::Init || entry.retired {
                return None;
            }
            let fits_in = if entry.multi_recv {
                Some((entry.buffer.len() - entry.consumed) as u64)
            } else {
                None
            };
            (entry.spec, fits_in)
        };
        let rx_entries = &self.rx_entries;
        let position = self.unexpected.iter().position(|&h| {
            rx_entries.get(h)
                .map(|u| spec.matches(u.peer.unwrap(), u.spec.tag))
                .unwrap_or(false)
        })?;
        if let Some(remaining) = fits_in {
            let staged = self.rx_entries.get(self.unexpected[position]).unwrap();
            if staged.total_len > remaining {
                return None;
            }
        }
        Some(self.unexpected.remove(position))
    }

    pub(crate) fn submit_read(
        &mut self,
        peer_addr: PeerAddr,
        key: u64,
        offset: u64,
        len: u64,
        context: u64,
    ) -> Result<OpHandle> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length read"));
        }
        if !self.hw.supports_read() {
            return Err(Error::InvalidArgument("device does not support reads"));
        }
        self.peer_mut(peer_addr)?;

        let mut entry = TxEntry::new(peer_addr, TxOp::Read { key, offset }, 0, Vec::new(), context);
        entry.total_len = len;
        entry.read_buffer = vec![0; len as usize];
        let handle = self.tx_entries.alloc(entry)?;

        let fragment_size = self.config.read_fragment_size;
        let mut fragments = Vec::new();
        let mut local_offset = 0u64;
        while local_offset < len {
            let fragment_len = fragment_size.min(len - local_offset);
            let read = ReadEntry {
                peer: peer_addr,
                key,
                remote_offset: offset + local_offset,
                local_offset,
                len: fragment_len,
                state: ReadState::Pending,
                owner: ReadOwner::Tx(handle),
            };
            match self.read_entries.alloc(read) {
                Ok(h) => fragments.push(h),
                Err(e) => {
                    for h in fragments {
                        self.read_entries.release(h);
                    }
                    self.tx_entries.release(handle);
                    return Err(e);
                }
            }
            local_offset += fragment_len;
        }
        self.tx_entries.get_mut(handle).unwrap().read_fragments_total = fragments.len() as u32;
        self.read_pending.extend(fragments);
        Ok(OpHandle::Tx(handle))
    }

    pub(crate) fn submit_atomic(
        &mut self,
        peer_addr: PeerAddr,
        op: AtomicOp,
        key: u64,
        operand: u64,
        compare: u64,
        context: u64,
    ) -> Result<OpHandle> {
        self.peer_mut(peer_addr)?;
        let fetch = op != AtomicOp::Add;
        let entry = TxEntry::new(
            peer_addr,
            TxOp::Atomic { op, key, operand, compare, fetch },
            0,
            Vec::new(),
            context,
        );
        let handle = self.tx_entries.alloc(entry)?;

        match self.post_tx_request(handle) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                self.tx_entries.get_mut(handle).unwrap().state = TxState::QueuedCtrl;
                self.tx_queued_ctrl.push(handle);
            }
            Err(e) => {
                self.abort_tx_submission(handle);
                return Err(e);
            }
        }
        Ok(OpHandle::Tx(handle))
    }

    /// Unwinds a submission that failed before anything reached the wire;
    /// no completion is delivered.
    fn abort_tx_submission(&mut self, handle: Handle<TxEntry>) {
        let Some(entry) = self.tx_entries.release(handle) else { return };
        if let Some(peer) = self.peers.get_mut(&entry.peer) {
            if entry.credits_consumed > 0 {
                peer.return_credits(entry.credits_consumed);
            }
            if matches!(entry.op, TxOp::Send { .. } | TxOp::Write { .. }) {
                peer.outstanding_ops -= 1;
            }
        }
        for mr in &entry.exposed_mrs {
            self.registrar.deregister(*mr).ok();
        }
    }

    pub(crate) fn cancel(&mut self, op: OpHandle) -> bool {
        let OpHandle::Rx(handle) = op else { return false };
        let immediate = match self.rx_entries.get(handle) {
            Some(entry) => entry.cancellable_immediately(),
            None => return false,
        };

        if immediate {
            // a multi-recv parent with carved children cannot be unwound;
            // retire it and let the last child hand the buffer back
            let has_children =
                self.rx_entries.get(handle).map(|e| e.active_children > 0).unwrap_or(false);
            if has_children {
                let entry = self.rx_entries.get_mut(handle).unwrap();
                entry.cancelled = true;
                entry.retired = true;
                self.posted_recvs.retain(|&h| h != handle);
                debug!(?handle, "multi-recv cancel deferred to active children");
                return true;
            }
            let mut entry = self.rx_entries.release(handle).unwrap();
            if let Some(staged) = entry.staged_packet.take() {
                self.pools.release(staged);
            }
            self.posted_recvs.retain(|&h| h != handle);
            self.unexpected.retain(|&h| h != handle);
            self.completions.push_back(OpCompletion::Receive {
                context: entry.user_context,
                buffer: entry.buffer,
                len: 0,
                error: Some(Error::Cancelled),
            });
            debug!(?handle, "receive cancelled before matching");
        } else {
            // too late to unwind the wire protocol; drain silently
            self.rx_entries.get_mut(handle).unwrap().cancelled = true;
            debug!(?handle, "receive cancelled mid-transfer, suppressing completion");
        }
        true
    }

    pub(crate) fn expose_region(&mut self, data: Vec<u8>) -> Result<u64> {
        let mr = self.registrar.expose(Bytes::from(data.clone()), MemoryAccess::ReadTarget)?;
        self.exposed_regions.insert(mr.0, data);
        Ok(mr.0)
    }

    // ---- posting ------------------------------------------------------

    /// Serializes `frame` into a fresh tx packet and posts it. On failure
    /// the packet is released and the error propagated; transient errors
    /// leave it to the caller to queue a retry.
    pub(crate) fn post_frame(
        &mut self,
        peer_addr: PeerAddr,
        frame: &Frame,
        owner: Option<PacketOwner>,
        sent_frame: SentFrame,
        more: bool,
    ) -> Result<()> {
        let is_local = self.peers.get(&peer_addr).map(|p| p.is_local).unwrap_or(false);
        let pool = match sent_frame {
            SentFrame::AtomicResponse => PoolId::CtrlResponse,
            _ if is_local => PoolId::LoopbackTx,
            _ => PoolId::HwTx,
        };
        let handle = self.pools.acquire(pool, self.registrar.as_mut())?;
        {
            let entry = self.pools.get_mut(handle).unwrap();
            frame.ser(&mut entry.buf);
            entry.peer = Some(peer_addr);
            entry.owner = owner;
            entry.sent_frame = Some(sent_frame);
        }
        match self.post_packet(handle, more) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pools.release(handle);
                Err(e)
            }
        }
    }

    /// Posts an already serialized packet (fresh or re-queued after RNR).
    pub(crate) fn post_packet(&mut self, handle: PacketHandle, more: bool) -> Result<()> {
        let to = self.pools.get(handle)
            .and_then(|p| p.peer)
            .ok_or(Error::InvalidArgument("stale packet handle"))?;
        let is_local = self.peers.get(&to).map(|p| p.is_local).unwrap_or(false);

        let outstanding = if is_local { self.loopback_outstanding } else { self.hw_outstanding };
        if outstanding >= self.config.tx_queue_size {
            return Err(Error::Exhausted);
        }

        let entry = self.pools.get(handle).unwrap();
        let device: &mut dyn DatagramDevice = if is_local {
            self.loopback.as_deref_mut().ok_or(Error::InvalidArgument("no loopback device"))?
        } else {
            self.hw.as_mut()
        };
        device.post_send(to, entry.buf.as_ref(), handle, more)?;

        if is_local {
            self.loopback_outstanding += 1;
        } else {
            self.hw_outstanding += 1;
        }
        if let Some(peer) = self.peers.get_mut(&to) {
            peer.outstanding_tx_packets += 1;
        }
        trace!(?handle, to, "posted packet");
        Ok(())
    }

    /// Builds and posts the initial request (or atomic request) of a
    /// transfer.
    pub(crate) fn post_tx_request(&mut self, handle: Handle<TxEntry>) -> Result<()> {
        let (frame, sent_frame, peer_addr) = {
            let entry = self.tx_entries.get(handle).ok_or(Error::InvalidArgument("stale tx"))?;
            match &entry.op {
                TxOp::Atomic { op, key, operand, compare, fetch } => {
                    let frame = Frame::AtomicRequest(AtomicRequestFrame {
                        tx_id: handle.to_wire(),
                        op: *op,
                        key: *key,
                        operand: *operand,
                        compare: *compare,
                    });
                    (frame, SentFrame::AtomicRequest { expects_response: *fetch }, entry.peer)
                }
                TxOp::Read { .. } => unreachable!("reads never produce request frames"),
                TxOp::Send { .. } | TxOp::Write { .. } => {
                    let tag = if let TxOp::Send { tag } = &entry.op { *tag } else { None };
                    let write_target = if let TxOp::Write { key, offset } = &entry.op {
                        Some((*key, *offset))
                    } else {
                        None
                    };
                    let eager = entry.total_len as usize <= self.config.max_payload_size
                        && entry.exposed_mrs.is_empty();
                    let eager_payload = if eager {
                        let mut payload = bytes::BytesMut::with_capacity(entry.total_len as usize);
                        entry.copy_payload(0, entry.total_len as usize, &mut payload);
                        Some(payload.freeze())
                    } else {
                        None
                    };
                    let read_regions: Vec<ReadRegion> = entry.exposed_mrs.iter()
                        .zip(&entry.segments)
                        .map(|(mr, segment)| ReadRegion { key: mr.0, len: segment.len() as u64 })
                        .collect();
                    let op = if write_target.is_some() { WireOp::Write } else { WireOp::Send };
                    let frame = Frame::Request(RequestFrame {
                        tx_id: handle.to_wire(),
                        op,
                        msg_id: entry.msg_id,
                        total_len: entry.total_len,
                        credit_request: entry.credit_request,
                        tag,
                        write_target,
                        read_regions,
                        eager_payload,
                    });
                    (frame, SentFrame::Request { eager }, entry.peer)
                }
            }
        };
        self.post_frame(peer_addr, &frame, Some(PacketOwner::Tx(handle)), sent_frame, false)?;
        let entry = self.tx_entries.get_mut(handle).unwrap();
        entry.request_sent = true;
        if entry.state == TxState::QueuedCtrl {
            entry.state = TxState::Request;
        }
        Ok(())
    }

    // ---- completion delivery ------------------------------------------

    /// Completes a tx entry: returns credits, drops registrations, emits
    /// the user completion, releases queued packets and the entry itself.
    pub(crate) fn finalize_tx(&mut self, handle: Handle<TxEntry>, error: Option<Error>) {
        let Some(entry) = self.tx_entries.release(handle) else { return };

        if let Some(peer) = self.peers.get_mut(&entry.peer) {
            if entry.credits_consumed > 0 {
                peer.return_credits(entry.credits_consumed);
            }
            if matches!(entry.op, TxOp::Send { .. } | TxOp::Write { .. }) {
                peer.outstanding_ops -= 1;
            }
        }
        for mr in &entry.exposed_mrs {
            self.registrar.deregister(*mr).ok();
        }
        for packet in &entry.queued_packets {
            self.pools.release(*packet);
        }

        let completion = match entry.op {
            TxOp::Send { .. } => OpCompletion::Send { context: entry.user_context, error },
            TxOp::Write { .. } => OpCompletion::Write { context: entry.user_context, error },
            TxOp::Read { .. } => OpCompletion::Read {
                context: entry.user_context,
                buffer: entry.read_buffer,
                error,
            },
            TxOp::Atomic { .. } => OpCompletion::Atomic {
                context: entry.user_context,
                value: entry.atomic_result,
                error,
            },
        };
        self.completions.push_back(completion);
    }

    /// Completes an rx entry. Cancelled entries drain silently; multi-recv
    /// children report into their parent's buffer.
    pub(crate) fn finalize_rx(&mut self, handle: Handle<RxEntry>, error: Option<Error>) {
        let Some(entry) = self.rx_entries.release(handle) else { return };

        self.available_data_bufs += entry.credits_granted;
        for packet in &entry.queued_packets {
            self.pools.release(*packet);
        }

        let error = error.or_else(|| {
            let capacity = if entry.parent.is_some() {
                u64::MAX // fit was checked when the child was carved
            } else {
                entry.buffer.len() as u64
            };
            if entry.write_target.is_none() && entry.total_len > capacity {
                Some(Error::Truncated { required: entry.total_len, provided: capacity })
            } else {
                None
            }
        });

        if entry.write_target.is_some() {
            // remote write: nothing user-visible on the target side
            return;
        }
        if !entry.cancelled {
            if let Some(parent) = entry.parent {
                self.completions.push_back(OpCompletion::MultiRecv {
                    context: self.rx_entries.get(parent).map(|p| p.user_context).unwrap_or(0),
                    offset: entry.buffer_offset,
                    len: entry.total_len,
                    error,
                });
            } else {
                self.completions.push_back(OpCompletion::Receive {
                    context: entry.user_context,
                    buffer: entry.buffer,
                    len: entry.total_len,
                    error,
                });
            }
        }
        if let Some(parent) = entry.parent {
            self.release_multi_recv_child(parent);
        }
    }

    /// A child of `parent` finished; retires the parent's buffer once it is
    /// both consumed and childless.
    pub(crate) fn release_multi_recv_child(&mut self, parent: Handle<RxEntry>) {
        let Some(entry) = self.rx_entries.get_mut(parent) else { return };
        entry.active_children -= 1;
        if entry.retired && entry.active_children == 0 {
            let entry = self.rx_entries.release(parent).unwrap();
            if entry.cancelled {
                self.completions.push_back(OpCompletion::Receive {
                    context: entry.user_context,
                    buffer: entry.buffer,
                    len: 0,
                    error: Some(Error::Cancelled),
                });
            } else {
                self.completions.push_back(OpCompletion::MultiRecvDone {
                    context: entry.user_context,
                    buffer: entry.buffer,
                });
            }
        }
    }

    pub(crate) fn push_event(&mut self, peer: Option<PeerAddr>, error: Error) {
        warn!(?peer, %error, "endpoint event");
        self.events.push_back(EndpointEvent { peer, error });
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::clock::ManualClock;
    use crate::test_util::{small_config, TableResolver, TestFabric, TestPair};
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn recv(buffer_len: usize, context: u64) -> RecvRequest {
        RecvRequest {
            from: None,
            tag: None,
            buffer: vec![0; buffer_len],
            multi_recv: false,
            context,
        }
    }

    #[test]
    fn test_eager_roundtrip() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        pair.b.submit_recv(recv(64, 100)).unwrap();
        let data = pattern(16, 1);
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 7).unwrap();
        pair.tick(4);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 7, error: None }]
        );
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 100, buffer, len: 16, error: None }] => {
                assert_eq!(&buffer[..16], &data[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_windowed_transfer_multi_segment() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        pair.b.submit_recv(recv(1024, 100)).unwrap();
        let first = pattern(700, 3);
        let second = pattern(324, 5);
        pair.a
            .submit_send(
                pair.addr_b,
                vec![Bytes::from(first.clone()), Bytes::from(second.clone())],
                None,
                8,
            )
            .unwrap();
        pair.tick(60);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 8, error: None }]
        );
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 100, buffer, len: 1024, error: None }] => {
                assert_eq!(&buffer[..700], &first[..]);
                assert_eq!(&buffer[700..1024], &second[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_message_waits_for_matching_receive() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        let data = pattern(24, 9);
        pair.a
            .submit_send(pair.addr_b, vec![Bytes::from(data.clone())], Some(9), 1)
            .unwrap();
        pair.tick(3);
        assert!(pair.b.poll_completions(16).is_empty());

        // an untagged receive must not match the tagged message
        pair.b.submit_recv(recv(64, 50)).unwrap();
        pair.tick(3);
        assert!(pair.b.poll_completions(16).is_empty());

        let tagged = RecvRequest { tag: Some(9), ..recv(64, 51) };
        pair.b.submit_recv(tagged).unwrap();
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 51, buffer, len: 24, error: None }] => {
                assert_eq!(&buffer[..24], &data[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_receiver_not_ready_backs_off_until_clock_advances() {
        let pair = TestPair::new(small_config());
        pair.tick(1);
        pair.b.submit_recv(recv(64, 100)).unwrap();

        pair.fabric.bounce_next(pair.addr_b, 1);
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(16, 2))], None, 3).unwrap();
        pair.tick(5);

        // bounced and backed off; nothing completes while time stands still
        assert!(pair.a.poll_completions(16).is_empty());
        assert!(pair.b.poll_completions(16).is_empty());

        pair.clock.advance(200);
        pair.tick(4);
        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 3, error: None }]
        );
        assert_eq!(pair.b.poll_completions(16).len(), 1);
    }

    #[test]
    fn test_queued_handshake_waits_out_backoff() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        // the answering handshake bounces; the peer enters backoff with the
        // handshake queued
        pair.b.submit_send(pair.addr_a, vec![Bytes::from(pattern(16, 1))], None, 1).unwrap();
        pair.fabric.bounce_next(pair.addr_b, 1);
        pair.tick(3);

        let before = pair.fabric.delivered_sizes(pair.addr_b).len();
        pair.tick(5);
        assert_eq!(
            pair.fabric.delivered_sizes(pair.addr_b).len(),
            before,
            "queued handshake must not be re-posted while the peer is backed off"
        );

        pair.clock.advance(200);
        pair.tick(2);
        assert!(pair.fabric.delivered_sizes(pair.addr_b).len() > before);
    }

    #[test]
    fn test_cancel_unmatched_receive_returns_buffer() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        let op = pair.b.submit_recv(recv(48, 10)).unwrap();
        assert!(pair.b.cancel(op));
        assert_eq!(
            pair.b.poll_completions(16),
            vec![OpCompletion::Receive {
                context: 10,
                buffer: vec![0; 48],
                len: 0,
                error: Some(Error::Cancelled),
            }]
        );
        // a second cancel finds nothing
        assert!(!pair.b.cancel(op));
    }

    #[test]
    fn test_cancel_after_matching_drains_silently() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        let op = pair.b.submit_recv(recv(1024, 10)).unwrap();
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(1024, 4))], None, 3).unwrap();
        pair.tick(2); // request matched, window granted
        assert!(pair.b.cancel(op));
        pair.tick(60);

        // the sender still completes; the receiver stays silent
        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 3, error: None }]
        );
        assert!(pair.b.poll_completions(16).is_empty());
    }

    #[test]
    fn test_cancel_multi_recv_with_active_child_defers_to_child() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        let request = RecvRequest {
            from: None,
            tag: None,
            buffer: vec![0; 1024],
            multi_recv: true,
            context: 77,
        };
        let op = pair.b.submit_recv(request).unwrap();

        let data = pattern(512, 5);
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 1).unwrap();
        pair.tick(2); // matched and carved, data still in flight
        assert!(pair.b.cancel(op));
        pair.tick(40);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 1, error: None }]
        );
        // the carved child still completes into the buffer; the buffer comes
        // back as cancelled once the child is done
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::MultiRecv { context: 77, offset: 0, len: 512, error: None }, OpCompletion::Receive { context: 77, buffer, len: 0, error: Some(Error::Cancelled) }] =>
            {
                assert_eq!(&buffer[..512], &data[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_tx_entry_exhaustion_is_recoverable() {
        let mut config = small_config();
        config.tx_entry_count = 1;
        let pair = TestPair::new(config);
        pair.tick(1);
        pair.b.submit_recv(recv(64, 100)).unwrap();
        pair.b.submit_recv(recv(64, 101)).unwrap();

        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(8, 1))], None, 1).unwrap();
        let err = pair.a
            .submit_send(pair.addr_b, vec![Bytes::from(pattern(8, 2))], None, 2)
            .unwrap_err();
        assert_eq!(err, Error::Exhausted);

        pair.tick(4);
        assert_eq!(pair.a.poll_completions(16).len(), 1);

        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(8, 2))], None, 2).unwrap();
        pair.tick(4);
        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 2, error: None }]
        );
    }

    #[test]
    fn test_multi_recv_carves_until_retired() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        let request = RecvRequest {
            from: None,
            tag: None,
            buffer: vec![0; 160],
            multi_recv: true,
            context: 77,
        };
        pair.b.submit_recv(request).unwrap();

        for seed in 0..3u8 {
            pair.a
                .submit_send(pair.addr_b, vec![Bytes::from(pattern(48, seed))], None, seed as u64)
                .unwrap();
            pair.tick(4);
        }

        let completions = pair.b.poll_completions(16);
        assert_eq!(completions.len(), 4);
        for (i, completion) in completions[..3].iter().enumerate() {
            match completion {
                OpCompletion::MultiRecv { context: 77, offset, len: 48, error: None } => {
                    assert_eq!(*offset, i * 48);
                }
                other => panic!("unexpected completion: {:?}", other),
            }
        }
        match &completions[3] {
            OpCompletion::MultiRecvDone { context: 77, buffer } => {
                for seed in 0..3u8 {
                    let at = seed as usize * 48;
                    assert_eq!(&buffer[at..at + 48], &pattern(48, seed)[..]);
                }
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn test_write_lands_in_exposed_region() {
        let pair = TestPair::new(small_config());
        let key = pair.b.expose_region(vec![0; 128]).unwrap();
        pair.tick(1);

        let data = pattern(100, 6);
        pair.a
            .submit_write(pair.addr_b, vec![Bytes::from(data.clone())], key, 8, 4)
            .unwrap();
        pair.tick(40);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Write { context: 4, error: None }]
        );
        assert!(pair.b.poll_completions(16).is_empty());
        let region = pair.b.region(key).unwrap();
        assert_eq!(&region[8..108], &data[..]);
        assert_eq!(&region[..8], &[0; 8]);
    }

    #[test]
    fn test_read_pulls_from_exposed_region() {
        let pair = TestPair::with_read_support(small_config(), true);
        let content = pattern(256, 8);
        let key = {
            let mut region = content.clone();
            region.truncate(256);
            pair.b.expose_region(region).unwrap()
        };
        pair.tick(1);

        pair.a.submit_read(pair.addr_b, key, 16, 64, 5).unwrap();
        pair.tick(4);

        let completions = pair.a.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Read { context: 5, buffer, error: None }] => {
                assert_eq!(&buffer[..], &content[16..80]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[rstest]
    #[case::add(AtomicOp::Add, 7, 0, None, 17)]
    #[case::swap(AtomicOp::Swap, 7, 0, Some(10), 7)]
    #[case::compare_swap_hit(AtomicOp::CompareSwap, 7, 10, Some(10), 7)]
    #[case::compare_swap_miss(AtomicOp::CompareSwap, 7, 99, Some(10), 10)]
    fn test_atomic_ops(
        #[case] op: AtomicOp,
        #[case] operand: u64,
        #[case] compare: u64,
        #[case] expected_value: Option<u64>,
        #[case] expected_cell: u64,
    ) {
        let pair = TestPair::new(small_config());
        pair.b.expose_atomic(42, 10);
        pair.tick(1);

        pair.a.submit_atomic(pair.addr_b, op, 42, operand, compare, 6).unwrap();
        pair.tick(4);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Atomic { context: 6, value: expected_value, error: None }]
        );
        assert_eq!(pair.b.atomic_value(42), Some(expected_cell));
    }

    #[test]
    fn test_atomic_on_unknown_cell_is_rejected() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        pair.a.submit_atomic(pair.addr_b, AtomicOp::Add, 99, 5, 0, 6).unwrap();
        pair.tick(4);

        assert!(pair.a.poll_completions(16).is_empty());
        assert_eq!(pair.b.atomic_value(99), None);
        let events = pair.b.poll_events(16);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peer, Some(pair.addr_a));
        assert_eq!(events[0].error, Error::InvalidArgument("atomic on unknown cell"));
    }

    #[test]
    fn test_zero_copy_receive_posts_user_buffers() {
        let mut config = small_config();
        config.zero_copy_receive = true;
        let pair = TestPair::new(config);
        pair.tick(1);
        // exactly one internally owned slot per endpoint
        assert_eq!(pair.fabric.posted_recv_slots(pair.addr_b), 1);

        pair.b.submit_recv(recv(64, 100)).unwrap();
        assert_eq!(pair.fabric.posted_recv_slots(pair.addr_b), 2);

        let data = pattern(48, 3);
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 1).unwrap();
        pair.tick(6);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 1, error: None }]
        );
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 100, buffer, len: 48, error: None }] => {
                assert_eq!(&buffer[..48], &data[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_reordered_requests_deliver_in_send_order() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        pair.fabric.hold(pair.addr_b);
        let m1 = pattern(16, 1);
        let m2 = pattern(16, 2);
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(m1.clone())], None, 1).unwrap();
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(m2.clone())], None, 2).unwrap();

        pair.b.submit_recv(recv(64, 100)).unwrap();
        pair.b.submit_recv(recv(64, 101)).unwrap();
        pair.fabric.release_reversed(pair.addr_b);
        pair.tick(4);

        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 100, buffer: b1, .. }, OpCompletion::Receive { context: 101, buffer: b2, .. }] =>
            {
                assert_eq!(&b1[..16], &m1[..]);
                assert_eq!(&b2[..16], &m2[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_send_to_self_via_loopback() {
        let fabric = TestFabric::new();
        let clock = ManualClock::new(1);
        let config = small_config();
        let endpoint = Endpoint::new(
            config.clone(),
            fabric.device(1, config.max_payload_size, false),
            Some(fabric.loopback_device(1, config.max_payload_size)),
            fabric.registrar(1),
            Box::new(TableResolver::with_local(vec![1])),
            Box::new(clock),
        )
        .unwrap();
        for _ in 0..2 {
            endpoint.progress();
        }

        endpoint.submit_recv(recv(64, 100)).unwrap();
        let data = pattern(20, 3);
        endpoint.submit_send(1, vec![Bytes::from(data.clone())], None, 1).unwrap();
        for _ in 0..6 {
            endpoint.progress();
        }

        let completions = endpoint.poll_completions(16);
        assert_eq!(completions.len(), 2);
        assert!(completions.contains(&OpCompletion::Send { context: 1, error: None }));
        assert!(completions.iter().any(|c| matches!(
            c,
            OpCompletion::Receive { context: 100, len: 20, error: None, .. }
        )));
    }

    #[test]
    fn test_truncated_receive_reports_required_length() {
        let pair = TestPair::new(small_config());
        pair.tick(1);

        pair.b.submit_recv(recv(8, 100)).unwrap();
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(32, 4))], None, 1).unwrap();
        pair.tick(4);

        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 100, len: 32, error, .. }] => {
                assert_eq!(*error, Some(Error::Truncated { required: 32, provided: 8 }));
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_large_send_offloaded_to_receiver_reads() {
        let mut config = small_config();
        config.read_offload_threshold = Some(128);
        config.memory_registration_threshold = 128;
        config.read_copy_pool_size = 4;
        let pair = TestPair::with_read_support(config, true);
        pair.tick(1);

        // a first exchange carries the handshakes that advertise read support
        pair.b.submit_recv(recv(64, 100)).unwrap();
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(pattern(8, 1))], None, 1).unwrap();
        pair.tick(6);
        pair.a.poll_completions(16);
        pair.b.poll_completions(16);

        let data = pattern(256, 7);
        pair.b.submit_recv(recv(256, 101)).unwrap();
        pair.a.submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 2).unwrap();
        pair.tick(20);

        assert_eq!(
            pair.a.poll_completions(16),
            vec![OpCompletion::Send { context: 2, error: None }]
        );
        let completions = pair.b.poll_completions(16);
        match &completions[..] {
            [OpCompletion::Receive { context: 101, buffer, len: 256, error: None }] => {
                assert_eq!(&buffer[..], &data[..]);
            }
            other => panic!("unexpected completions: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let fabric = TestFabric::new();
        let mut config = small_config();
        config.peer_credits = 0;
        let result = Endpoint::new(
            config.clone(),
            fabric.device(1, config.max_payload_size, false),
            None,
            fabric.registrar(1),
            Box::new(TableResolver::all_remote()),
            Box::new(ManualClock::new(0)),
        );
        assert!(result.is_err());
    }
}
