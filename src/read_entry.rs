//! Device-read fragments. A read entry describes one bounded device-level
//! read; large reads become several entries that complete independently and
//! roll up into their owning operation.

use crate::pools::entry_pool::Handle;
use crate::rx_entry::RxEntry;
use crate::transport::PeerAddr;
use crate::tx_entry::TxEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// On the read-pending list, not yet posted to the device.
    Pending,
    Submitted,
}

/// Who gets the fragment's bytes and its completion: an application read
/// (tx entry) or the read-offload path of an inbound transfer (rx entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOwner {
    Tx(Handle<TxEntry>),
    Rx(Handle<RxEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEntry {
    pub peer: PeerAddr,
    pub key: u64,
    pub remote_offset: u64,
    /// Where the fragment lands in the owner's buffer.
    pub local_offset: u64,
    pub len: u64,
    pub state: ReadState,
    pub owner: ReadOwner,
}
