//! Packet staging pools. Every datagram the endpoint touches lives in a
//! pool-owned buffer, identified by a generational handle that also names
//! the pool it came from. Pools grow in registered chunks so the device can
//! DMA straight out of them; staging pools that never reach the device skip
//! registration.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pools::entry_pool::Handle;
use crate::pools::fixed_buffer::FixedBuf;
use crate::read_entry::ReadEntry;
use crate::rx_entry::RxEntry;
use crate::transport::{MemoryAccess, MemoryRegistrar, MrHandle, PeerAddr};
use crate::tx_entry::TxEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolId {
    HwTx,
    HwRx,
    LoopbackTx,
    LoopbackRx,
    Unexpected,
    OutOfOrder,
    ReadCopy,
    CtrlResponse,
    SendDesc,
}

impl PoolId {
    pub const ALL: [PoolId; 9] = [
        PoolId::HwTx,
        PoolId::HwRx,
        PoolId::LoopbackTx,
        PoolId::LoopbackRx,
        PoolId::Unexpected,
        PoolId::OutOfOrder,
        PoolId::ReadCopy,
        PoolId::CtrlResponse,
        PoolId::SendDesc,
    ];

    fn as_index(self) -> usize {
        match self {
            PoolId::HwTx => 0,
            PoolId::HwRx => 1,
            PoolId::LoopbackTx => 2,
            PoolId::LoopbackRx => 3,
            PoolId::Unexpected => 4,
            PoolId::OutOfOrder => 5,
            PoolId::ReadCopy => 6,
            PoolId::CtrlResponse => 7,
            PoolId::SendDesc => 8,
        }
    }

    /// Pools the device sends from or receives into; their chunks carry
    /// memory registrations.
    fn is_device_visible(self) -> bool {
        matches!(
            self,
            PoolId::HwTx | PoolId::HwRx | PoolId::LoopbackTx | PoolId::LoopbackRx | PoolId::ReadCopy
        )
    }
}

/// Which operation entry a packet belongs to; drives completion routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOwner {
    Tx(Handle<TxEntry>),
    Rx(Handle<RxEntry>),
    Read(Handle<ReadEntry>),
}

/// What a posted packet carried, recorded at post time so its send
/// completion (or RNR error) can be dispatched without re-parsing the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentFrame {
    Handshake,
    Request { eager: bool },
    ClearToSend,
    Data { len: u64 },
    Ack,
    EndOfRead,
    AtomicRequest { expects_response: bool },
    AtomicResponse,
    /// Context for a device-level read; no bytes of its own on the wire.
    ReadContext { len: u64 },
}

pub struct PacketEntry {
    pub buf: FixedBuf,
    pub peer: Option<PeerAddr>,
    pub owner: Option<PacketOwner>,
    pub sent_frame: Option<SentFrame>,
}

impl PacketEntry {
    fn new(entry_size: usize) -> PacketEntry {
        PacketEntry {
            buf: FixedBuf::new(entry_size),
            peer: None,
            owner: None,
            sent_frame: None,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.peer = None;
        self.owner = None;
        self.sent_frame = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHandle {
    pool: PoolId,
    index: u32,
    generation: u32,
}

impl PacketHandle {
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

struct PacketSlot {
    generation: u32,
    entry: PacketEntry,
    in_use: bool,
}

pub struct PacketPool {
    id: PoolId,
    entry_size: usize,
    chunk_size: u32,
    max_chunks: Option<u32>,
    slots: Vec<PacketSlot>,
    free: Vec<u32>,
    chunk_mrs: Vec<MrHandle>,
}

impl PacketPool {
    fn new(id: PoolId, entry_size: usize, chunk_size: u32, max_chunks: Option<u32>) -> PacketPool {
        PacketPool {
            id,
            entry_size,
            chunk_size,
            max_chunks,
            slots: Vec::new(),
            free: Vec::new(),
            chunk_mrs: Vec::new(),
        }
    }

    fn chunks(&self) -> u32 {
        (self.slots.len() as u32) / self.chunk_size.max(1)
    }

    fn can_grow(&self) -> bool {
        if self.chunk_size == 0 {
            return false;
        }
        match self.max_chunks {
            Some(max) => self.chunks() < max,
            None => true,
        }
    }

    /// Adds one chunk of buffers, registering it when the device needs to
    /// reach them.
    pub fn grow(&mut self, registrar: &mut dyn MemoryRegistrar) -> Result<()> {
        if !self.can_grow() {
            return Err(Error::Exhausted);
        }
        if self.id.is_device_visible() {
            let access = match self.id {
                PoolId::HwRx | PoolId::LoopbackRx => MemoryAccess::Receive,
                PoolId::ReadCopy => MemoryAccess::ReadTarget,
                _ => MemoryAccess::Send,
            };
            let mr = registrar.register(self.chunk_size as usize * self.entry_size, access)?;
            self.chunk_mrs.push(mr);
        }
        let base = self.slots.len() as u32;
        for offset in 0..self.chunk_size {
            self.slots.push(PacketSlot {
                generation: 0,
                entry: PacketEntry::new(self.entry_size),
                in_use: false,
            });
            self.free.push(base + offset);
        }
        debug!(pool = ?self.id, total = self.slots.len(), "grew packet pool by one chunk");
        Ok(())
    }

    pub fn acquire(&mut self, registrar: &mut dyn MemoryRegistrar) -> Result<PacketHandle> {
        if self.free.is_empty() {
            self.grow(registrar)?;
        }
        let index = self.free.pop().ok_or(Error::Exhausted)?;
        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        trace!(pool = ?self.id, index, "acquired packet");
        Ok(PacketHandle { pool: self.id, index, generation: slot.generation })
    }

    pub fn get(&self, handle: PacketHandle) -> Option<&PacketEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if !slot.in_use || slot.generation != handle.generation {
            return None;
        }
        Some(&slot.entry)
    }

    pub fn get_mut(&mut self, handle: PacketHandle) -> Option<&mut PacketEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if !slot.in_use || slot.generation != handle.generation {
            return None;
        }
        Some(&mut slot.entry)
    }

    pub fn release(&mut self, handle: PacketHandle) {
        let slot = self.slots.get_mut(handle.index as usize)
            .unwrap_or_else(|| panic!("packet handle {:?} out of range", handle));
        assert!(
            slot.in_use && slot.generation == handle.generation,
            "double release of packet {:?}", handle
        );
        slot.entry.reset();
        slot.generation = slot.generation.wrapping_add(1);
        slot.in_use = false;
        self.free.push(handle.index);
        trace!(pool = ?self.id, index = handle.index, "released packet");
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Sizing knobs for the nine pools, derived from the endpoint config.
pub struct PoolSizes {
    pub entry_size: usize,
    pub hw_tx_chunk: u32,
    pub hw_rx_chunk: u32,
    pub loopback_tx_chunk: u32,
    pub loopback_rx_chunk: u32,
    pub unexpected_chunk: u32,
    pub out_of_order_chunk: u32,
    pub read_copy_size: u32,
    pub ctrl_response_chunk: u32,
    pub send_desc_chunk: u32,
}

pub struct PacketPools {
    pools: [PacketPool; 9],
}

impl PacketPools {
    pub fn new(sizes: &PoolSizes) -> PacketPools {
        let pool = |id: PoolId, chunk: u32, max_chunks: Option<u32>| {
            PacketPool::new(id, sizes.entry_size, chunk, max_chunks)
        };
        PacketPools {
            pools: [
                pool(PoolId::HwTx, sizes.hw_tx_chunk, None),
                pool(PoolId::HwRx, sizes.hw_rx_chunk, None),
                pool(PoolId::LoopbackTx, sizes.loopback_tx_chunk, None),
                pool(PoolId::LoopbackRx, sizes.loopback_rx_chunk, None),
                pool(PoolId::Unexpected, sizes.unexpected_chunk, None),
                pool(PoolId::OutOfOrder, sizes.out_of_order_chunk, None),
                // bounce buffers are capped: they only bridge misaligned
                // read targets and must not grow without bound
                pool(PoolId::ReadCopy, sizes.read_copy_size, Some(1)),
                pool(PoolId::CtrlResponse, sizes.ctrl_response_chunk, None),
                pool(PoolId::SendDesc, sizes.send_desc_chunk, None),
            ],
        }
    }

    pub fn pool(&self, id: PoolId) -> &PacketPool {
        &self.pools[id.as_index()]
    }

    pub fn pool_mut(&mut self, id: PoolId) -> &mut PacketPool {
        &mut self.pools[id.as_index()]
    }

    pub fn acquire(&mut self, id: PoolId, registrar: &mut dyn MemoryRegistrar) -> Result<PacketHandle> {
        self.pools[id.as_index()].acquire(registrar)
    }

    pub fn get(&self, handle: PacketHandle) -> Option<&PacketEntry> {
        self.pools[handle.pool.as_index()].get(handle)
    }

    pub fn get_mut(&mut self, handle: PacketHandle) -> Option<&mut PacketEntry> {
        self.pools[handle.pool.as_index()].get_mut(handle)
    }

    pub fn release(&mut self, handle: PacketHandle) {
        self.pools[handle.pool.as_index()].release(handle)
    }

    /// Hands back every chunk registration, e.g. on endpoint close.
    pub fn deregister_all(&mut self, registrar: &mut dyn MemoryRegistrar) -> Result<()> {
        for pool in &mut self.pools {
            for mr in pool.chunk_mrs.drain(..) {
                registrar.deregister(mr)?;
            }
        }
        Ok(())
    }
}
