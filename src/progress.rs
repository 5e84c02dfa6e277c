//! The progress engine. One tick polls both devices, replenishes receive
//! buffers, retries queued work and paces data out under the granted
//! windows. Everything runs single-threaded on the caller's stack under
//! the endpoint lock; nothing here blocks.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::endpoint::EndpointCore;
use crate::error::Error;
use crate::peer::HandshakeStatus;
use crate::pools::entry_pool::Handle;
use crate::pools::packet_pool::{PacketHandle, PacketOwner, PoolId, SentFrame};
use crate::read_entry::{ReadEntry, ReadOwner, ReadState};
use crate::rx_entry::{MatchSpec, PendingCtrl, RxEntry, RxState};
use crate::transport::{Completion, CompletionKind, CompletionStatus, PeerAddr};
use crate::tx_entry::{TxEntry, TxOp, TxState};
use crate::wire::{
    AckFrame, AtomicOp, AtomicRequestFrame, AtomicResponseFrame, CtsFrame, DataFrame, Frame,
    RequestFrame, WireOp, FEATURE_DEVICE_READ,
};

impl EndpointCore {
    pub(crate) fn progress_tick(&mut self) {
        let now = self.clock.now_micros();

        self.reclaim_stalled_budget(now);

        // completions first, so freed packets, credits and refilled windows
        // are visible to the steps below
        let mut completions = Vec::with_capacity(self.config.cq_poll_batch);
        self.hw.poll(self.config.cq_poll_batch, &mut completions);
        for completion in completions.drain(..) {
            self.handle_device_completion(completion, false, now);
        }
        if self.loopback.is_some() {
            let batch = self.config.loopback_cq_poll_batch;
            self.loopback.as_mut().unwrap().poll(batch, &mut completions);
            for completion in completions.drain(..) {
                self.handle_device_completion(completion, true, now);
            }
        }

        self.replenish_recv_buffers();
        self.expire_backoffs(now);
        self.drain_queued_handshakes();
        self.drain_rx_rnr_queue();
        self.drain_rx_ctrl_queue();
        self.drain_tx_rnr_queue();
        self.drain_tx_ctrl_queue();
        self.drain_atomic_responses();
        self.send_pending_data();
        self.submit_pending_reads();

        let flushed = self.hw.flush();
        if let Err(e) = flushed {
            self.push_event(None, e);
        }
        if let Some(loopback) = self.loopback.as_mut() {
            let flushed = loopback.flush();
            if let Err(e) = flushed {
                self.push_event(None, e);
            }
        }
        self.first_tick_done = true;
    }

    // ---- budget -------------------------------------------------------

    /// A budget pinned at zero for longer than the stall timeout means
    /// grants leaked (accounting drift, or entries stuck behind dead
    /// senders never finishing). Recompute it from the live entries.
    fn reclaim_stalled_budget(&mut self, now: u64) {
        if self.available_data_bufs > 0 {
            self.data_bufs_exhausted_since = 0;
            return;
        }
        if self.data_bufs_exhausted_since == 0 {
            self.data_bufs_exhausted_since = now;
            return;
        }
        let timeout = self.config.data_buffer_stall_timeout.as_micros() as u64;
        if now.saturating_sub(self.data_bufs_exhausted_since) < timeout {
            return;
        }
        let held: u32 = self
            .rx_entries
            .live_handles()
            .iter()
            .filter_map(|&h| self.rx_entries.get(h))
            .map(|e| e.credits_granted)
            .sum();
        self.available_data_bufs = self.config.rx_queue_size.saturating_sub(held);
        self.data_bufs_exhausted_since = 0;
        warn!(recovered = self.available_data_bufs, "receive budget stalled, recomputed");
    }

    // ---- device completions -------------------------------------------

    fn handle_device_completion(&mut self, completion: Completion, is_loopback: bool, now: u64) {
        match completion.kind {
            CompletionKind::Recv { src, payload } => {
                // slots tagged with an rx entry are application buffers
                // posted in zero-copy mode; only internal slots feed the
                // replenish accounting
                let user_slot = match self.pools.get(completion.ctx).and_then(|p| p.owner) {
                    Some(PacketOwner::Rx(h)) => Some(h),
                    _ => None,
                };
                if user_slot.is_none() {
                    if is_loopback {
                        self.loopback_rx_posted -= 1;
                        self.loopback_rx_to_post += 1;
                    } else {
                        self.hw_rx_posted -= 1;
                        self.hw_rx_to_post += 1;
                    }
                }
                self.pools.release(completion.ctx);
                if completion.status != CompletionStatus::Ok {
                    self.push_event(src, Error::Device(-1));
                    return;
                }
                let Some(src) = src else {
                    self.push_event(None, Error::MalformedPacket("datagram without source"));
                    return;
                };
                self.handle_datagram(src, payload);
                if let Some(rx) = user_slot {
                    self.post_user_recv_slot(rx);
                }
            }
            CompletionKind::Send => {
                if is_loopback {
                    self.loopback_outstanding -= 1;
                } else {
                    self.hw_outstanding -= 1;
                }
                self.handle_send_completion(completion.ctx, completion.status, now);
            }
            CompletionKind::Read { payload } => {
                if is_loopback {
                    self.loopback_outstanding -= 1;
                } else {
                    self.hw_outstanding -= 1;
                }
                self.handle_read_completion(completion.ctx, completion.status, payload);
            }
            CompletionKind::Atomic { value } => {
                if is_loopback {
                    self.loopback_outstanding -= 1;
                } else {
                    self.hw_outstanding -= 1;
                }
                self.handle_native_atomic_completion(completion.ctx, completion.status, value);
            }
        }
    }

    fn handle_send_completion(&mut self, ctx: PacketHandle, status: CompletionStatus, now: u64) {
        let Some(packet) = self.pools.get(ctx) else {
            warn!(?ctx, "send completion for unknown packet");
            return;
        };
        let peer_addr = packet.peer.unwrap_or(0);
        let owner = packet.owner;
        let sent_frame = packet.sent_frame;
        if let Some(peer) = self.peers.get_mut(&peer_addr) {
            peer.outstanding_tx_packets = peer.outstanding_tx_packets.saturating_sub(1);
        }

        match status {
            CompletionStatus::Ok => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.backoff.on_success();
                }
                self.pools.release(ctx);
                match (sent_frame, owner) {
                    // eager transfers carry everything in the request
                    (Some(SentFrame::Request { eager: true }), Some(PacketOwner::Tx(h))) => {
                        self.finalize_tx(h, None);
                    }
                    // a delivered end-of-read concludes the receive
                    (Some(SentFrame::EndOfRead), Some(PacketOwner::Rx(h))) => {
                        self.finalize_rx(h, None);
                    }
                    _ => {}
                }
            }
            CompletionStatus::ReceiverNotReady => {
                if let Some(peer) = self.peers.get_mut(&peer_addr) {
                    peer.backoff.on_receiver_not_ready(now);
                }
                debug!(peer = peer_addr, ?sent_frame, "packet bounced, receiver not ready");
                self.requeue_bounced_packet(ctx, peer_addr, owner, sent_frame);
            }
            CompletionStatus::Error(code) => {
                self.pools.release(ctx);
                match owner {
                    Some(PacketOwner::Tx(h)) => self.finalize_tx(h, Some(Error::Device(code))),
                    Some(PacketOwner::Rx(h)) => self.finalize_rx(h, Some(Error::Device(code))),
                    _ => self.push_event(Some(peer_addr), Error::Device(code)),
                }
            }
        }
    }

    /// Parks a bounced packet on its owner's retry queue; ownerless control
    /// packets are re-queued by kind.
    fn requeue_bounced_packet(
        &mut self,
        ctx: PacketHandle,
        peer_addr: PeerAddr,
        owner: Option<PacketOwner>,
        sent_frame: Option<SentFrame>,
    ) {
        match owner {
            Some(PacketOwner::Tx(h)) if self.tx_entries.get(h).is_some() => {
                let entry = self.tx_entries.get_mut(h).unwrap();
                entry.queued_packets.push_back(ctx);
                if entry.state != TxState::QueuedRnr {
                    entry.state = TxState::QueuedRnr;
                    self.tx_queued_rnr.push(h);
                }
            }
            Some(PacketOwner::Rx(h)) if self.rx_entries.get(h).is_some() => {
                let entry = self.rx_entries.get_mut(h).unwrap();
                entry.queued_packets.push_back(ctx);
                if entry.state != RxState::QueuedRnr {
                    entry.state = RxState::QueuedRnr;
                    self.rx_queued_rnr.push(h);
                }
            }
            _ => {
                match sent_frame {
                    Some(SentFrame::Handshake) => {
                        if let Some(peer) = self.peers.get_mut(&peer_addr) {
                            peer.handshake = HandshakeStatus::Queued;
                        }
                    }
                    Some(SentFrame::Ack) | Some(SentFrame::AtomicResponse) => {
                        // atomic replies carry no owner; recover the frame
                        // from the serialized packet
                        let raw: Vec<u8> =
                            self.pools.get(ctx).unwrap().buf.as_ref().to_vec();
                        if let Ok(frame) = Frame::deser(&mut &raw[..]) {
                            self.queued_atomic_responses.push((peer_addr, frame));
                        }
                    }
                    _ => trace!(peer = peer_addr, "dropping bounced orphan packet"),
                }
                self.pools.release(ctx);
            }
        }
    }

    fn handle_read_completion(&mut self, ctx: PacketHandle, status: CompletionStatus, payload: Bytes) {
        let owner = self.pools.get(ctx).and_then(|p| p.owner);
        self.pools.release(ctx);
        let Some(PacketOwner::Read(read_handle)) = owner else {
            warn!(?ctx, "read completion without read context");
            return;
        };
        let Some(read) = self.read_entries.release(read_handle) else { return };

        match status {
            CompletionStatus::Ok => match read.owner {
                ReadOwner::Tx(h) => {
                    let done = {
                        let Some(entry) = self.tx_entries.get_mut(h) else { return };
                        let start = read.local_offset as usize;
                        let end = (start + payload.len()).min(entry.read_buffer.len());
                        entry.read_buffer[start..end].copy_from_slice(&payload[..end - start]);
                        entry.read_fragments_done += 1;
                        entry.read_fragments_done == entry.read_fragments_total
                    };
                    if done {
                        self.finalize_tx(h, None);
                    }
                }
                ReadOwner::Rx(h) => {
                    self.deliver_data(h, read.local_offset, &payload);
                    let done = {
                        let Some(entry) = self.rx_entries.get_mut(h) else { return };
                        entry.read_fragments_done += 1;
                        entry.read_fragments_done == entry.read_fragments_total
                    };
                    if done {
                        self.post_end_of_read(h);
                    }
                }
            },
            CompletionStatus::ReceiverNotReady | CompletionStatus::Error(_) => {
                let code = if let CompletionStatus::Error(c) = status { c } else { -1 };
                match read.owner {
                    ReadOwner::Tx(h) => self.finalize_tx(h, Some(Error::Device(code))),
                    ReadOwner::Rx(h) => self.finalize_rx(h, Some(Error::Device(code))),
                }
            }
        }
    }

    /// The loopback device executes atomics natively and reports the prior
    /// value in the request packet's completion.
    fn handle_native_atomic_completion(
        &mut self,
        ctx: PacketHandle,
        status: CompletionStatus,
        value: u64,
    ) {
        let (owner, peer_addr) = match self.pools.get(ctx) {
            Some(p) => (p.owner, p.peer.unwrap_or(0)),
            None => return,
        };
        self.pools.release(ctx);
        if let Some(peer) = self.peers.get_mut(&peer_addr) {
            peer.outstanding_tx_packets = peer.outstanding_tx_packets.saturating_sub(1);
        }
        let Some(PacketOwner::Tx(h)) = owner else { return };
        match status {
            CompletionStatus::Ok => {
                let fetch = self
                    .tx_entries
                    .get(h)
                    .map(|e| e.op.expects_response())
                    .unwrap_or(false);
                if fetch {
                    if let Some(entry) = self.tx_entries.get_mut(h) {
                        entry.atomic_result = Some(value);
                    }
                }
                self.finalize_tx(h, None);
            }
            CompletionStatus::ReceiverNotReady => self.finalize_tx(h, Some(Error::ReceiverNotReady)),
            CompletionStatus::Error(code) => self.finalize_tx(h, Some(Error::Device(code))),
        }
    }

    // ---- inbound frames ------------------------------------------------

    fn handle_datagram(&mut self, src: PeerAddr, payload: Bytes) {
        let mut buf = payload.clone();
        let frame = match Frame::deser(&mut buf) {
            Ok(frame) => frame,
            Err(e) => {
                self.push_event(Some(src), e);
                return;
            }
        };
        if let Err(e) = self.ensure_contact(src) {
            self.push_event(Some(src), e);
            return;
        }
        trace!(src, ?frame, "datagram");

        match frame {
            Frame::Handshake { features } => {
                let peer = self.peers.get_mut(&src).unwrap();
                peer.features = features;
                if peer.handshake == HandshakeStatus::Sent {
                    peer.handshake = HandshakeStatus::Received;
                }
                debug!(peer = src, features, "handshake received");
            }
            Frame::Request(req) => self.handle_request(src, req, &payload),
            Frame::ClearToSend(cts) => self.handle_cts(cts),
            Frame::Data(data) => self.handle_data(data),
            Frame::Ack(ack) => self.handle_ack(ack),
            Frame::EndOfRead { tx_id } => {
                self.finalize_tx(Handle::from_wire(tx_id), None);
            }
            Frame::AtomicRequest(areq) => self.handle_atomic_request(src, areq),
            Frame::AtomicResponse(resp) => {
                let h: Handle<TxEntry> = Handle::from_wire(resp.tx_id);
                if let Some(entry) = self.tx_entries.get_mut(h) {
                    if entry.op.expects_response() {
                        entry.atomic_result = Some(resp.value);
                    }
                }
                self.finalize_tx(h, None);
            }
        }
    }

    /// Creates peer state on first contact and answers with our handshake.
    fn ensure_contact(&mut self, src: PeerAddr) -> crate::error::Result<()> {
        let supports_read = self.hw.supports_read();
        let peer = self.peer_mut(src)?;
        if !matches!(peer.handshake, HandshakeStatus::NotSent | HandshakeStatus::Queued) {
            return Ok(());
        }
        let features = if supports_read { FEATURE_DEVICE_READ } else { 0 };
        let frame = Frame::Handshake { features };
        match self.post_frame(src, &frame, None, SentFrame::Handshake, false) {
            Ok(()) => self.peers.get_mut(&src).unwrap().handshake = HandshakeStatus::Sent,
            Err(e) if e.is_transient() => {
                self.peers.get_mut(&src).unwrap().handshake = HandshakeStatus::Queued;
            }
            Err(e) => {
                self.peers.get_mut(&src).unwrap().handshake = HandshakeStatus::Queued;
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, src: PeerAddr, req: RequestFrame, raw: &[u8]) {
        if !(self.config.ordered_delivery && req.op == WireOp::Send) {
            self.process_request(src, req, raw);
            return;
        }

        let expected = self.peers.get(&src).unwrap().expected_msg_id;
        if req.msg_id > expected {
            self.stage_out_of_order(src, req.msg_id, raw);
            return;
        }
        if req.msg_id < expected {
            trace!(src, msg_id = req.msg_id, expected, "dropping duplicate request");
            return;
        }

        self.process_request(src, req, raw);
        self.peers.get_mut(&src).unwrap().expected_msg_id += 1;

        // release any consecutive requests that arrived early
        loop {
            let staged = {
                let peer = self.peers.get_mut(&src).unwrap();
                let next = peer.expected_msg_id;
                peer.reordered.remove(&next)
            };
            let Some(packet) = staged else { break };
            let raw: Vec<u8> = self.pools.get(packet).unwrap().buf.as_ref().to_vec();
            self.pools.release(packet);
            match Frame::deser(&mut &raw[..]) {
                Ok(Frame::Request(req)) => self.process_request(src, req, &raw),
                _ => unreachable!("reorder staging only holds request frames"),
            }
            self.peers.get_mut(&src).unwrap().expected_msg_id += 1;
        }
    }

    fn stage_out_of_order(&mut self, src: PeerAddr, msg_id: u64, raw: &[u8]) {
        let peer = self.peers.get(&src).unwrap();
        if peer.reordered.contains_key(&msg_id) {
            trace!(src, msg_id, "dropping duplicate early request");
            return;
        }
        let packet = match self.pools.acquire(PoolId::OutOfOrder, self.registrar.as_mut()) {
            Ok(packet) => packet,
            Err(e) => {
                self.push_event(Some(src), e);
                return;
            }
        };
        {
            let entry = self.pools.get_mut(packet).unwrap();
            entry.buf.clear();
            entry.buf.put_slice(raw);
            entry.peer = Some(src);
        }
        debug!(src, msg_id, "staging early request");
        self.peers.get_mut(&src).unwrap().reordered.insert(msg_id, packet);
    }

    fn process_request(&mut self, src: PeerAddr, req: RequestFrame, raw: &[u8]) {
        match req.op {
            WireOp::Write => self.process_write_request(src, req),
            WireOp::Send => match self.match_posted(src, &req) {
                Some(posted) => self.process_matched_request(posted, src, req),
                None => self.stage_unexpected(src, &req, raw),
            },
        }
    }

    /// Remote writes bypass matching; a synthetic rx entry tracks the
    /// transfer into the exposed region.
    fn process_write_request(&mut self, src: PeerAddr, req: RequestFrame) {
        let Some(write_target) = req.write_target else {
            self.push_event(Some(src), Error::MalformedPacket("write request without target"));
            return;
        };
        if !self.exposed_regions.contains_key(&write_target.0) {
            self.push_event(Some(src), Error::InvalidArgument("write to unknown region"));
            return;
        }
        let mut entry = RxEntry::posted(MatchSpec { from: Some(src), tag: None }, Vec::new(), false, 0);
        entry.write_target = Some(write_target);
        let handle = match self.rx_entries.alloc(entry) {
            Ok(handle) => handle,
            Err(e) => {
                self.push_event(Some(src), e);
                return;
            }
        };
        self.start_matched(handle, src, req);
    }

    /// First posted receive that matches; multi-recv buffers too small for
    /// the message retire on the spot.
    fn match_posted(&mut self, src: PeerAddr, req: &RequestFrame) -> Option<Handle<RxEntry>> {
        let candidates = self.posted_recvs.clone();
        for h in candidates {
            let Some(entry) = self.rx_entries.get(h) else {
                self.posted_recvs.retain(|&x| x != h);
                continue;
            };
            if entry.state != RxState::Init || entry.retired {
                continue;
            }
            if !entry.spec.matches(src, req.tag) {
                continue;
            }
            if entry.multi_recv {
                let remaining = (entry.buffer.len() - entry.consumed) as u64;
                if req.total_len > remaining {
                    self.retire_multi_recv(h);
                    continue;
                }
            }
            return Some(h);
        }
        None
    }

    fn stage_unexpected(&mut self, src: PeerAddr, req: &RequestFrame, raw: &[u8]) {
        let packet = match self.pools.acquire(PoolId::Unexpected, self.registrar.as_mut()) {
            Ok(packet) => packet,
            Err(e) => {
                self.push_event(Some(src), e);
                return;
            }
        };
        {
            let entry = self.pools.get_mut(packet).unwrap();
            entry.buf.clear();
            entry.buf.put_slice(raw);
            entry.peer = Some(src);
        }
        let mut staged = RxEntry::unexpected(src, req.tag, packet);
        staged.total_len = req.total_len;
        staged.msg_id = req.msg_id;
        match self.rx_entries.alloc(staged) {
            Ok(handle) => {
                debug!(src, msg_id = req.msg_id, "staging unexpected message");
                self.unexpected.push(handle);
            }
            Err(e) => {
                self.pools.release(packet);
                self.push_event(Some(src), e);
            }
        }
    }

    /// Consumes the posted receive `posted` for `req`. Multi-recv buffers
    /// carve a child entry and stay posted until they run out of space.
    pub(crate) fn process_matched_request(
        &mut self,
        posted: Handle<RxEntry>,
        src: PeerAddr,
        req: RequestFrame,
    ) {
        let is_multi = self.rx_entries.get(posted).map(|e| e.multi_recv).unwrap_or(false);
        let target = if is_multi {
            match self.carve_multi_recv_child(posted, req.total_len) {
                Some(child) => child,
                None => {
                    self.push_event(Some(src), Error::Exhausted);
                    return;
                }
            }
        } else {
            self.posted_recvs.retain(|&x| x != posted);
            posted
        };
        self.start_matched(target, src, req);
    }

    fn carve_multi_recv_child(
        &mut self,
        parent: Handle<RxEntry>,
        total_len: u64,
    ) -> Option<Handle<RxEntry>> {
        let offset = {
            let p = self.rx_entries.get_mut(parent)?;
            let offset = p.consumed;
            p.consumed += total_len as usize;
            p.active_children += 1;
            offset
        };
        let mut child = RxEntry::posted(MatchSpec { from: None, tag: None }, Vec::new(), false, 0);
        child.parent = Some(parent);
        child.buffer_offset = offset;
        let handle = match self.rx_entries.alloc(child) {
            Ok(handle) => handle,
            Err(_) => {
                let p = self.rx_entries.get_mut(parent).unwrap();
                p.consumed -= total_len as usize;
                p.active_children -= 1;
                return None;
            }
        };
        let exhausted = {
            let p = self.rx_entries.get(parent).unwrap();
            p.buffer.len() - p.consumed < self.min_multi_recv_size
        };
        if exhausted {
            self.retire_multi_recv(parent);
        }
        Some(handle)
    }

    /// Takes a retiring multi-recv buffer out of the posted list; the
    /// buffer itself is handed back once the last child finishes.
    fn retire_multi_recv(&mut self, handle: Handle<RxEntry>) {
        let Some(entry) = self.rx_entries.get_mut(handle) else { return };
        if entry.retired {
            return;
        }
        entry.retired = true;
        let childless = entry.active_children == 0;
        self.posted_recvs.retain(|&x| x != handle);
        if childless {
            let entry = self.rx_entries.release(handle).unwrap();
            if !entry.cancelled {
                self.completions.push_back(crate::endpoint::OpCompletion::MultiRecvDone {
                    context: entry.user_context,
                    buffer: entry.buffer,
                });
            }
        }
    }

    /// Common tail of matching: records the transfer, then finishes it
    /// eagerly, pulls it with device reads, or grants a send window.
    fn start_matched(&mut self, target: Handle<RxEntry>, src: PeerAddr, req: RequestFrame) {
        {
            let entry = self.rx_entries.get_mut(target).unwrap();
            entry.peer = Some(src);
            entry.state = RxState::Matched;
            entry.total_len = req.total_len;
            entry.remote_tx_id = Some(req.tx_id);
            entry.msg_id = req.msg_id;
            entry.credit_request = req.credit_request;
            entry.read_regions = req.read_regions.clone();
        }
        if let Some(payload) = req.eager_payload {
            self.deliver_data(target, 0, &payload);
            self.finalize_rx(target, None);
            return;
        }
        let can_read = !req.read_regions.is_empty()
            && self.config.read_copy_pool_size > 0
            && self.hw.supports_read();
        if can_read {
            self.start_receiver_reads(target, src);
        } else {
            self.grant_window(target);
        }
    }

    /// Pulls the sender's exposed segments with device reads instead of
    /// having it stream data packets. Falls back to a window grant when
    /// read entries run out.
    fn start_receiver_reads(&mut self, target: Handle<RxEntry>, src: PeerAddr) {
        let regions = self.rx_entries.get(target).unwrap().read_regions.clone();
        let fragment_size = self.config.read_fragment_size;
        let mut created = Vec::new();
        let mut region_base = 0u64;
        'regions: for region in &regions {
            let mut offset = 0u64;
            while offset < region.len {
                let len = fragment_size.min(region.len - offset);
                let read = ReadEntry {
                    peer: src,
                    key: region.key,
                    remote_offset: offset,
                    local_offset: region_base + offset,
                    len,
                    state: ReadState::Pending,
                    owner: ReadOwner::Rx(target),
                };
                match self.read_entries.alloc(read) {
                    Ok(handle) => created.push(handle),
                    Err(_) => break 'regions,
                }
                offset += len;
            }
            region_base += region.len;
        }

        let expected: u64 = regions.iter().map(|r| r.len.div_ceil(fragment_size)).sum();
        if (created.len() as u64) < expected {
            debug!(?target, "read entries exhausted, falling back to window grant");
            for handle in created {
                self.read_entries.release(handle);
            }
            self.grant_window(target);
            return;
        }

        let entry = self.rx_entries.get_mut(target).unwrap();
        entry.read_fragments_total = created.len() as u32;
        entry.state = RxState::Receiving;
        self.read_pending.extend(created);
    }

    /// Issues (or re-issues) the clear-to-send for a matched transfer. The
    /// grant is taken from the receive budget exactly once; re-entry after
    /// a transient post failure only retries the frame.
    fn grant_window(&mut self, target: Handle<RxEntry>) {
        let max_payload = self.config.max_payload_size as u64;
        let (peer, tx_id, needs_grant) = {
            let Some(entry) = self.rx_entries.get(target) else { return };
            (entry.peer.unwrap(), entry.remote_tx_id.unwrap(), entry.credits_granted == 0)
        };

        if needs_grant {
            let (credit_request, total_len) = {
                let entry = self.rx_entries.get(target).unwrap();
                (entry.credit_request, entry.total_len)
            };
            let need = total_len.div_ceil(max_payload).max(1);
            let need = u32::try_from(need).unwrap_or(u32::MAX);
            let grant = credit_request.max(1).min(need).min(self.available_data_bufs);
            if grant == 0 {
                let entry = self.rx_entries.get_mut(target).unwrap();
                entry.state = RxState::QueuedCtrl;
                entry.pending_ctrl = Some(PendingCtrl::ClearToSend);
                self.rx_queued_ctrl.push(target);
                trace!(?target, "no receive budget, grant deferred");
                return;
            }
            self.available_data_bufs -= grant;
            if self.available_data_bufs == 0 && self.data_bufs_exhausted_since == 0 {
                self.data_bufs_exhausted_since = self.clock.now_micros();
            }
            let entry = self.rx_entries.get_mut(target).unwrap();
            entry.credits_granted = grant;
            entry.window_granted = grant as u64 * max_payload;
        }

        let window_bytes = self.rx_entries.get(target).unwrap().window_granted;
        let frame = Frame::ClearToSend(CtsFrame { tx_id, rx_id: target.to_wire(), window_bytes });
        match self.post_frame(peer, &frame, Some(PacketOwner::Rx(target)), SentFrame::ClearToSend, false)
        {
            Ok(()) => {
                let entry = self.rx_entries.get_mut(target).unwrap();
                entry.pending_ctrl = None;
                entry.state = RxState::Receiving;
            }
            Err(e) if e.is_transient() => {
                let entry = self.rx_entries.get_mut(target).unwrap();
                if entry.state != RxState::QueuedCtrl {
                    entry.state = RxState::QueuedCtrl;
                    entry.pending_ctrl = Some(PendingCtrl::ClearToSend);
                    self.rx_queued_ctrl.push(target);
                }
            }
            Err(e) => self.finalize_rx(target, Some(e)),
        }
    }

    fn handle_cts(&mut self, cts: CtsFrame) {
        let h: Handle<TxEntry> = Handle::from_wire(cts.tx_id);
        let Some(entry) = self.tx_entries.get_mut(h) else {
            trace!(tx_id = cts.tx_id, "clear-to-send for released transfer");
            return;
        };
        entry.remote_rx_id = Some(cts.rx_id);
        entry.window = entry.window.max(cts.window_bytes);
        if entry.state != TxState::SendingData {
            entry.state = TxState::SendingData;
            self.tx_pending.push(h);
        }
    }

    fn handle_data(&mut self, data: DataFrame) {
        let h: Handle<RxEntry> = Handle::from_wire(data.rx_id);
        if self.rx_entries.get(h).is_none() {
            trace!(rx_id = data.rx_id, "data for released transfer");
            return;
        }
        self.deliver_data(h, data.offset, &data.payload);
        self.send_ack(h, data.payload.len() as u64);
    }

    /// Copies received bytes into their destination: an exposed region for
    /// writes, the parent's buffer for multi-recv children, or the entry's
    /// own buffer. Overruns are clamped; truncation is reported at the end.
    pub(crate) fn deliver_data(&mut self, handle: Handle<RxEntry>, offset: u64, payload: &[u8]) {
        let (write_target, parent, buffer_offset) = {
            let Some(entry) = self.rx_entries.get(handle) else { return };
            (entry.write_target, entry.parent, entry.buffer_offset)
        };

        if let Some((key, base)) = write_target {
            if let Some(region) = self.exposed_regions.get_mut(&key) {
                let start = (base + offset) as usize;
                if start < region.len() {
                    let end = (start + payload.len()).min(region.len());
                    region[start..end].copy_from_slice(&payload[..end - start]);
                }
            }
        } else if let Some(parent) = parent {
            if let Some(p) = self.rx_entries.get_mut(parent) {
                let start = buffer_offset + offset as usize;
                let end = (start + payload.len()).min(p.buffer.len());
                if start < end {
                    p.buffer[start..end].copy_from_slice(&payload[..end - start]);
                }
            }
        } else {
            let entry = self.rx_entries.get_mut(handle).unwrap();
            let start = offset as usize;
            if start < entry.buffer.len() {
                let end = (start + payload.len()).min(entry.buffer.len());
                entry.buffer[start..end].copy_from_slice(&payload[..end - start]);
            }
        }

        let entry = self.rx_entries.get_mut(handle).unwrap();
        entry.bytes_received += payload.len() as u64;
        if entry.state == RxState::Matched {
            entry.state = RxState::Receiving;
        }
    }

    /// Acknowledges `bytes` towards the sender, refilling its window. Acks
    /// that cannot be posted accumulate on the entry.
    fn send_ack(&mut self, handle: Handle<RxEntry>, bytes: u64) {
        let (peer, tx_id, total, complete) = {
            let Some(entry) = self.rx_entries.get(handle) else { return };
            let pending = match entry.pending_ctrl {
                Some(PendingCtrl::Ack { bytes }) => bytes,
                _ => 0,
            };
            (entry.peer.unwrap(), entry.remote_tx_id.unwrap(), pending + bytes, entry.is_complete())
        };

        let frame = Frame::Ack(AckFrame { tx_id, bytes: total });
        match self.post_frame(peer, &frame, Some(PacketOwner::Rx(handle)), SentFrame::Ack, true) {
            Ok(()) => {
                let entry = self.rx_entries.get_mut(handle).unwrap();
                entry.pending_ctrl = None;
                if complete {
                    self.finalize_rx(handle, None);
                }
            }
            Err(e) if e.is_transient() => {
                let entry = self.rx_entries.get_mut(handle).unwrap();
                entry.pending_ctrl = Some(PendingCtrl::Ack { bytes: total });
                if entry.state != RxState::QueuedCtrl && entry.state != RxState::QueuedRnr {
                    entry.state = RxState::QueuedCtrl;
                    self.rx_queued_ctrl.push(handle);
                }
            }
            Err(e) => self.finalize_rx(handle, Some(e)),
        }
    }

    fn post_end_of_read(&mut self, handle: Handle<RxEntry>) {
        let (peer, tx_id) = {
            let Some(entry) = self.rx_entries.get(handle) else { return };
            (entry.peer.unwrap(), entry.remote_tx_id.unwrap())
        };
        let frame = Frame::EndOfRead { tx_id };
        match self.post_frame(peer, &frame, Some(PacketOwner::Rx(handle)), SentFrame::EndOfRead, false)
        {
            // the receive finishes when the end-of-read is delivered
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                let entry = self.rx_entries.get_mut(handle).unwrap();
                entry.pending_ctrl = Some(PendingCtrl::EndOfRead);
                if entry.state != RxState::QueuedCtrl && entry.state != RxState::QueuedRnr {
                    entry.state = RxState::QueuedCtrl;
                    self.rx_queued_ctrl.push(handle);
                }
            }
            Err(e) => self.finalize_rx(handle, Some(e)),
        }
    }

    fn handle_ack(&mut self, ack: AckFrame) {
        let h: Handle<TxEntry> = Handle::from_wire(ack.tx_id);
        let Some(entry) = self.tx_entries.get_mut(h) else {
            trace!(tx_id = ack.tx_id, "ack for released transfer");
            return;
        };
        // non-fetch atomics are acknowledged with an empty ack
        if matches!(entry.op, TxOp::Atomic { .. }) {
            self.finalize_tx(h, None);
            return;
        }
        entry.bytes_acked += ack.bytes;
        let done = entry.bytes_sent >= entry.total_len && entry.all_data_acked();
        if done {
            self.finalize_tx(h, None);
        }
    }

    fn handle_atomic_request(&mut self, src: PeerAddr, req: AtomicRequestFrame) {
        if !self.atomic_cells.contains_key(&req.key) {
            self.push_event(Some(src), Error::InvalidArgument("atomic on unknown cell"));
            return;
        }
        let cell = self.atomic_cells.get_mut(&req.key).unwrap();
        let old = *cell;
        match req.op {
            AtomicOp::Add => *cell = cell.wrapping_add(req.operand),
            AtomicOp::Swap => *cell = req.operand,
            AtomicOp::CompareSwap => {
                if old == req.compare {
                    *cell = req.operand;
                }
            }
        }

        let (frame, sent) = if req.op == AtomicOp::Add {
            (Frame::Ack(AckFrame { tx_id: req.tx_id, bytes: 0 }), SentFrame::Ack)
        } else {
            (
                Frame::AtomicResponse(AtomicResponseFrame { tx_id: req.tx_id, value: old }),
                SentFrame::AtomicResponse,
            )
        };
        match self.post_frame(src, &frame, None, sent, false) {
            Ok(()) => {}
            Err(e) if e.is_transient() => self.queued_atomic_responses.push((src, frame)),
            Err(e) => self.push_event(Some(src), e),
        }
    }

    // ---- periodic steps -------------------------------------------------

    /// Keeps the devices stocked with receive buffers. With zero-copy
    /// receive the device owns at most one buffer beyond the completions it
    /// already returned, so posts go one at a time.
    fn replenish_recv_buffers(&mut self) {
        if !self.first_tick_done {
            self.hw_rx_to_post = if self.config.zero_copy_receive {
                1
            } else {
                self.config.rx_queue_size
            };
            if self.loopback.is_some() {
                self.loopback_rx_to_post = self.config.loopback_rx_pool_chunk_size;
            }
        }
        // zero-copy mode keeps at most one internal buffer posted so that
        // application buffers service the data path
        let zero_copy = self.config.zero_copy_receive;
        let batch_limit = match (zero_copy, self.hw_rx_posted) {
            (false, _) => u32::MAX,
            (true, 0) => 1,
            (true, _) => 0,
        };

        let mut posted = 0;
        while self.hw_rx_to_post > 0 && posted < batch_limit {
            let handle = match self.pools.acquire(PoolId::HwRx, self.registrar.as_mut()) {
                Ok(handle) => handle,
                Err(_) => break,
            };
            let capacity = self.pools.get(handle).unwrap().buf.capacity();
            let more = self.hw_rx_to_post > 1 && posted + 1 < batch_limit;
            match self.hw.post_recv(capacity, handle, more) {
                Ok(()) => {
                    self.hw_rx_to_post -= 1;
                    self.hw_rx_posted += 1;
                    posted += 1;
                }
                Err(e) => {
                    self.pools.release(handle);
                    if !e.is_transient() {
                        self.push_event(None, e);
                    }
                    break;
                }
            }
        }

        if self.loopback.is_none() {
            return;
        }
        let batch_limit = match (zero_copy, self.loopback_rx_posted) {
            (false, _) => u32::MAX,
            (true, 0) => 1,
            (true, _) => 0,
        };
        let mut posted = 0;
        while self.loopback_rx_to_post > 0 && posted < batch_limit {
            let handle = match self.pools.acquire(PoolId::LoopbackRx, self.registrar.as_mut()) {
                Ok(handle) => handle,
                Err(_) => break,
            };
            let capacity = self.pools.get(handle).unwrap().buf.capacity();
            let more = self.loopback_rx_to_post > 1 && posted + 1 < batch_limit;
            match self.loopback.as_mut().unwrap().post_recv(capacity, handle, more) {
                Ok(()) => {
                    self.loopback_rx_to_post -= 1;
                    self.loopback_rx_posted += 1;
                    posted += 1;
                }
                Err(e) => {
                    self.pools.release(handle);
                    if !e.is_transient() {
                        self.push_event(None, e);
                    }
                    break;
                }
            }
        }
    }

    fn expire_backoffs(&mut self, now: u64) {
        for peer in self.peers.values_mut() {
            if peer.backoff.clear_if_expired(now) {
                trace!(peer = peer.addr, "backoff expired");
            }
        }
    }

    fn drain_queued_handshakes(&mut self) {
        let owed: Vec<PeerAddr> = self
            .peers
            .values()
            .filter(|p| p.handshake == HandshakeStatus::Queued)
            .map(|p| p.addr)
            .collect();
        let features = if self.hw.supports_read() { FEATURE_DEVICE_READ } else { 0 };
        for addr in owed {
            if self.is_backed_off(addr) {
                continue;
            }
            let frame = Frame::Handshake { features };
            match self.post_frame(addr, &frame, None, SentFrame::Handshake, false) {
                Ok(()) => self.peers.get_mut(&addr).unwrap().handshake = HandshakeStatus::Sent,
                Err(e) if e.is_transient() => break,
                Err(e) => self.push_event(Some(addr), e),
            }
        }
    }

    /// Re-posts packets bounced with receiver-not-ready once the peer's
    /// backoff has lapsed. Entries may be released from inside the loop
    /// (a re-posted packet can be the transfer's last, handled via a stale
    /// handle turning up `None`).
    fn drain_rx_rnr_queue(&mut self) {
        let queued = std::mem::take(&mut self.rx_queued_rnr);
        let mut still = Vec::new();
        for h in queued {
            let Some(entry) = self.rx_entries.get(h) else { continue };
            let peer = entry.peer.unwrap_or(0);
            if self.is_backed_off(peer) {
                still.push(h);
                continue;
            }
            let mut blocked = false;
            loop {
                let packet = match self.rx_entries.get(h).and_then(|e| e.queued_packets.front()) {
                    Some(&packet) => packet,
                    None => break,
                };
                match self.post_packet(packet, false) {
                    Ok(()) => {
                        self.rx_entries.get_mut(h).unwrap().queued_packets.pop_front();
                    }
                    Err(e) if e.is_transient() => {
                        blocked = true;
                        break;
                    }
                    Err(e) => {
                        self.finalize_rx(h, Some(e));
                        break;
                    }
                }
            }
            if blocked {
                still.push(h);
                continue;
            }
            if let Some(entry) = self.rx_entries.get_mut(h) {
                if entry.queued_packets.is_empty() && entry.state == RxState::QueuedRnr {
                    if entry.pending_ctrl.is_some() {
                        entry.state = RxState::QueuedCtrl;
                        self.rx_queued_ctrl.push(h);
                    } else {
                        entry.state = RxState::Receiving;
                    }
                }
            }
        }
        still.extend(self.rx_queued_rnr.drain(..));
        self.rx_queued_rnr = still;
    }

    fn drain_rx_ctrl_queue(&mut self) {
        let queued = std::mem::take(&mut self.rx_queued_ctrl);
        let mut still = Vec::new();
        for h in queued {
            let Some(entry) = self.rx_entries.get(h) else { continue };
            if entry.state != RxState::QueuedCtrl {
                continue;
            }
            let peer = entry.peer.unwrap_or(0);
            if self.is_backed_off(peer) {
                still.push(h);
                continue;
            }
            match entry.pending_ctrl {
                None => {
                    self.rx_entries.get_mut(h).unwrap().state = RxState::Receiving;
                }
                // grant_window and its siblings re-queue on failure
                Some(PendingCtrl::ClearToSend) => self.grant_window(h),
                Some(PendingCtrl::Ack { bytes }) => {
                    self.rx_entries.get_mut(h).unwrap().pending_ctrl = None;
                    self.rx_entries.get_mut(h).unwrap().state = RxState::Receiving;
                    self.send_ack(h, bytes);
                }
                Some(PendingCtrl::EndOfRead) => {
                    self.rx_entries.get_mut(h).unwrap().pending_ctrl = None;
                    self.rx_entries.get_mut(h).unwrap().state = RxState::Receiving;
                    self.post_end_of_read(h);
                }
            }
        }
        still.extend(self.rx_queued_ctrl.drain(..));
        self.rx_queued_ctrl = still;
    }

    fn drain_tx_rnr_queue(&mut self) {
        let queued = std::mem::take(&mut self.tx_queued_rnr);
        let mut still = Vec::new();
        for h in queued {
            let Some(entry) = self.tx_entries.get(h) else { continue };
            if self.is_backed_off(entry.peer) {
                still.push(h);
                continue;
            }
            let mut blocked = false;
            loop {
                let packet = match self.tx_entries.get(h).and_then(|e| e.queued_packets.front()) {
                    Some(&packet) => packet,
                    None => break,
                };
                match self.post_packet(packet, false) {
                    Ok(()) => {
                        self.tx_entries.get_mut(h).unwrap().queued_packets.pop_front();
                    }
                    Err(e) if e.is_transient() => {
                        blocked = true;
                        break;
                    }
                    Err(e) => {
                        self.finalize_tx(h, Some(e));
                        break;
                    }
                }
            }
            if blocked {
                still.push(h);
                continue;
            }
            if let Some(entry) = self.tx_entries.get_mut(h) {
                if entry.queued_packets.is_empty() && entry.state == TxState::QueuedRnr {
                    if entry.remote_rx_id.is_some() && entry.bytes_sent < entry.total_len {
                        entry.state = TxState::SendingData;
                        if !self.tx_pending.contains(&h) {
                            self.tx_pending.push(h);
                        }
                    } else {
                        entry.state = TxState::Request;
                    }
                }
            }
        }
        still.extend(self.tx_queued_rnr.drain(..));
        self.tx_queued_rnr = still;
    }

    /// Retries transfers whose initial request could not be posted.
    fn drain_tx_ctrl_queue(&mut self) {
        let queued = std::mem::take(&mut self.tx_queued_ctrl);
        let mut still = Vec::new();
        for h in queued {
            let Some(entry) = self.tx_entries.get(h) else { continue };
            if entry.state != TxState::QueuedCtrl {
                continue;
            }
            if self.is_backed_off(entry.peer) {
                still.push(h);
                continue;
            }
            match self.post_tx_request(h) {
                Ok(()) => {}
                Err(e) if e.is_transient() => still.push(h),
                Err(e) => self.finalize_tx(h, Some(e)),
            }
        }
        still.extend(self.tx_queued_ctrl.drain(..));
        self.tx_queued_ctrl = still;
    }

    fn drain_atomic_responses(&mut self) {
        let queued = std::mem::take(&mut self.queued_atomic_responses);
        let mut still = Vec::new();
        for (peer, frame) in queued {
            if self.is_backed_off(peer) {
                still.push((peer, frame));
                continue;
            }
            let sent = match &frame {
                Frame::AtomicResponse(_) => SentFrame::AtomicResponse,
                _ => SentFrame::Ack,
            };
            match self.post_frame(peer, &frame, None, sent, false) {
                Ok(()) => {}
                Err(e) if e.is_transient() => still.push((peer, frame)),
                Err(e) => self.push_event(Some(peer), e),
            }
        }
        still.extend(self.queued_atomic_responses.drain(..));
        self.queued_atomic_responses = still;
    }

    /// Streams data packets for granted transfers, keeping each transfer's
    /// unacknowledged bytes within its window.
    fn send_pending_data(&mut self) {
        let pending = std::mem::take(&mut self.tx_pending);
        let mut still = Vec::new();
        let mut queue_full = false;

        for h in pending {
            let Some(entry) = self.tx_entries.get(h) else { continue };
            if queue_full {
                still.push(h);
                continue;
            }
            if entry.state != TxState::SendingData {
                still.push(h);
                continue;
            }
            if self.is_backed_off(entry.peer) {
                still.push(h);
                continue;
            }

            loop {
                let Some(entry) = self.tx_entries.get(h) else { break };
                if entry.bytes_sent >= entry.total_len {
                    break;
                }
                let inflight = entry.bytes_sent - entry.bytes_acked;
                if inflight >= entry.window {
                    break;
                }
                let len = (self.config.max_payload_size as u64)
                    .min(entry.window - inflight)
                    .min(entry.total_len - entry.bytes_sent);
                let (peer, frame) = {
                    let mut payload = BytesMut::with_capacity(len as usize);
                    entry.copy_payload(entry.bytes_sent, len as usize, &mut payload);
                    let frame = Frame::Data(DataFrame {
                        rx_id: entry.remote_rx_id.unwrap(),
                        offset: entry.bytes_sent,
                        payload: payload.freeze(),
                    });
                    (entry.peer, frame)
                };
                match self.post_frame(peer, &frame, Some(PacketOwner::Tx(h)), SentFrame::Data { len }, true)
                {
                    Ok(()) => {
                        self.tx_entries.get_mut(h).unwrap().bytes_sent += len;
                    }
                    Err(e) if e.is_transient() => {
                        queue_full = true;
                        break;
                    }
                    Err(e) => {
                        self.finalize_tx(h, Some(e));
                        break;
                    }
                }
            }

            if let Some(entry) = self.tx_entries.get(h) {
                if entry.bytes_sent < entry.total_len {
                    still.push(h);
                }
            }
        }
        still.extend(self.tx_pending.drain(..));
        self.tx_pending = still;
    }

    /// Issues device reads for pending read fragments, each carrying a
    /// context packet from the send-descriptor pool (application reads) or
    /// the bounded read-copy pool (receiver-side pulls).
    fn submit_pending_reads(&mut self) {
        let pending = std::mem::take(&mut self.read_pending);
        let mut still = Vec::new();
        let mut stop = false;

        for h in pending {
            if stop {
                still.push(h);
                continue;
            }
            let Some(read) = self.read_entries.get(h) else { continue };
            let owner_alive = match read.owner {
                ReadOwner::Tx(t) => self.tx_entries.get(t).is_some(),
                ReadOwner::Rx(r) => self.rx_entries.get(r).is_some(),
            };
            if !owner_alive {
                self.read_entries.release(h);
                continue;
            }
            let is_local = self.peers.get(&read.peer).map(|p| p.is_local).unwrap_or(false);
            let outstanding = if is_local { self.loopback_outstanding } else { self.hw_outstanding };
            if outstanding >= self.config.tx_queue_size {
                stop = true;
                still.push(h);
                continue;
            }
            let pool = match read.owner {
                ReadOwner::Tx(_) => PoolId::SendDesc,
                ReadOwner::Rx(_) => PoolId::ReadCopy,
            };
            let ctx = match self.pools.acquire(pool, self.registrar.as_mut()) {
                Ok(ctx) => ctx,
                Err(_) => {
                    stop = true;
                    still.push(h);
                    continue;
                }
            };
            let (peer, key, remote_offset, len) = {
                let read = self.read_entries.get(h).unwrap();
                (read.peer, read.key, read.remote_offset, read.len)
            };
            {
                let packet = self.pools.get_mut(ctx).unwrap();
                packet.peer = Some(peer);
                packet.owner = Some(PacketOwner::Read(h));
                packet.sent_frame = Some(SentFrame::ReadContext { len });
            }
            let device = if is_local {
                self.loopback.as_deref_mut().unwrap()
            } else {
                self.hw.as_mut()
            };
            match device.post_read(peer, key, remote_offset, len, ctx) {
                Ok(()) => {
                    self.read_entries.get_mut(h).unwrap().state = ReadState::Submitted;
                    if is_local {
                        self.loopback_outstanding += 1;
                    } else {
                        self.hw_outstanding += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    self.pools.release(ctx);
                    stop = true;
                    still.push(h);
                }
                Err(e) => {
                    self.pools.release(ctx);
                    let owner = self.read_entries.release(h).unwrap().owner;
                    match owner {
                        ReadOwner::Tx(t) => self.finalize_tx(t, Some(e)),
                        ReadOwner::Rx(r) => self.finalize_rx(r, Some(e)),
                    }
                }
            }
        }
        still.extend(self.read_pending.drain(..));
        self.read_pending = still;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::clock::ManualClock;
    use crate::endpoint::Endpoint;
    use crate::test_util::small_config;
    use crate::transport::{
        MockAddressResolver, MockDatagramDevice, MockMemoryRegistrar, MrHandle,
    };

    /// The first tick stocks the device with the whole receive ring in one
    /// batch, hinting `more` on every post but the last; later ticks post
    /// nothing while the ring is full.
    #[test]
    fn test_first_tick_posts_receive_ring_batched() {
        let posts: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

        let mut hw = MockDatagramDevice::new();
        hw.expect_supports_read().return_const(false);
        hw.expect_poll().returning(|_, _| {});
        hw.expect_flush().returning(|| Ok(()));
        let recorded = posts.clone();
        hw.expect_post_recv().times(4).returning(move |_, _, more| {
            recorded.lock().unwrap().push(more);
            Ok(())
        });

        let mut registrar = MockMemoryRegistrar::new();
        registrar.expect_register().returning(|_, _| Ok(MrHandle(1)));

        let mut config = small_config();
        config.rx_queue_size = 4;
        let endpoint = Endpoint::new(
            config,
            Box::new(hw),
            None,
            Box::new(registrar),
            Box::new(MockAddressResolver::new()),
            Box::new(ManualClock::new(1)),
        )
        .unwrap();

        endpoint.progress();
        endpoint.progress();
        assert_eq!(*posts.lock().unwrap(), vec![true, true, true, false]);
    }
}
