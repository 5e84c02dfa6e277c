//! Abstractions over the datagram hardware, introduced to keep the protocol
//! engine device-independent and to facilitate mocking the I/O part away for
//! testing. A real provider implements these over its NIC verbs; the
//! integration tests implement them over an in-memory fabric.

#[cfg(test)] use mockall::automock;
use bytes::Bytes;

use crate::error::Result;
use crate::pools::packet_pool::PacketHandle;

/// Opaque, resolver-scoped address of a peer endpoint.
pub type PeerAddr = u64;

/// Registered-memory handle; its raw value doubles as the remote key
/// carried in request frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    /// The device sends from this memory.
    Send,
    /// The device receives into this memory.
    Receive,
    /// Remote peers may read this memory through device reads.
    ReadTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    /// The remote side had no receive buffer posted. Transient; the packet
    /// is re-queued and the peer backed off.
    ReceiverNotReady,
    /// Any other device-level error, with the device's error code.
    Error(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionKind {
    Send,
    Recv { src: Option<PeerAddr>, payload: Bytes },
    Read { payload: Bytes },
    /// Native atomic result; only the loopback device produces these.
    Atomic { value: u64 },
}

/// One entry drained from a device completion queue. `ctx` is the packet
/// handle passed at post time.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub ctx: PacketHandle,
    pub status: CompletionStatus,
    pub kind: CompletionKind,
}

/// An unreliable, unordered datagram device: sends may complete with RNR,
/// arrive out of order or carry device errors, but delivered payloads are
/// intact. The hardware NIC and the intra-host loopback both come in
/// through this seam.
#[cfg_attr(test, automock)]
pub trait DatagramDevice {
    fn max_payload_size(&self) -> usize;

    /// Whether `post_read` is available; gates the read offload path.
    fn supports_read(&self) -> bool;

    /// Queue a datagram. `more` hints that further posts follow immediately,
    ///  allowing the device to batch doorbells; a post with `more == false`
    ///  or an explicit `flush` submits the batch.
    fn post_send(&mut self, to: PeerAddr, packet: &[u8], ctx: PacketHandle, more: bool) -> Result<()>;

    /// Hand the device a receive slot of `capacity` bytes, identified by `ctx`.
    fn post_recv(&mut self, capacity: usize, ctx: PacketHandle, more: bool) -> Result<()>;

    /// Start a device-level read of `[offset, offset+len)` from the remote
    ///  region `key` at `from`.
    fn post_read(&mut self, from: PeerAddr, key: u64, offset: u64, len: u64, ctx: PacketHandle) -> Result<()>;

    /// Submit any batched posts to the hardware.
    fn flush(&mut self) -> Result<()>;

    /// Drain up to `max` completions.
    fn poll(&mut self, max: usize, out: &mut Vec<Completion>);
}

/// Registration of memory the device may touch. Pool chunks are registered
/// by length; application segments offered for remote reads are exposed
/// with their contents.
#[cfg_attr(test, automock)]
pub trait MemoryRegistrar {
    fn register(&mut self, len: usize, access: MemoryAccess) -> Result<MrHandle>;

    fn expose(&mut self, data: Bytes, access: MemoryAccess) -> Result<MrHandle>;

    fn deregister(&mut self, mr: MrHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Same-host peers are reached through the loopback device.
    pub is_local: bool,
}

/// Maps opaque peer addresses to routing descriptors.
#[cfg_attr(test, automock)]
pub trait AddressResolver {
    fn resolve(&self, addr: PeerAddr) -> Option<PeerDescriptor>;
}

#[cfg(test)]
pub mod tests {
    use rustc_hash::FxHashSet;
    use super::*;

    /// Registrar double that tracks registrations without backing memory.
    pub struct RecordingRegistrar {
        next_key: u64,
        active: FxHashSet<u64>,
        total: usize,
    }

    impl RecordingRegistrar {
        pub fn new() -> RecordingRegistrar {
            RecordingRegistrar { next_key: 1, active: FxHashSet::default(), total: 0 }
        }

        pub fn registered(&self) -> usize {
            self.total
        }

        pub fn active(&self) -> usize {
            self.active.len()
        }
    }

    impl MemoryRegistrar for RecordingRegistrar {
        fn register(&mut self, _len: usize, _access: MemoryAccess) -> Result<MrHandle> {
            let key = self.next_key;
            self.next_key += 1;
            self.active.insert(key);
            self.total += 1;
            Ok(MrHandle(key))
        }

        fn expose(&mut self, _data: Bytes, access: MemoryAccess) -> Result<MrHandle> {
            self.register(0, access)
        }

        fn deregister(&mut self, mr: MrHandle) -> Result<()> {
            assert!(self.active.remove(&mr.0), "deregistering unknown mr {:?}", mr);
            Ok(())
        }
    }
}
