//! A reliable, ordered, flow-controlled message transport on top of an
//!  unreliable datagram device (typically a kernel-bypass NIC) plus an
//!  intra-host loopback device.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length,
//!   optionally tagged chunks of data), not byte streams
//!   * two-sided sends match against posted receives by sender and tag;
//!     unmatched messages are staged until a receive shows up
//!   * one-sided writes, reads and atomics operate on regions the target
//!     explicitly exposed
//! * The device delivers datagrams intact but gives no ordering and may
//!   bounce packets when the receiver has no buffer posted (RNR); this
//!   layer adds per-peer message ordering and exponential peer backoff
//! * Flow control is receiver-driven:
//!   * a sender asks for a share of its per-peer credit budget, scaled by
//!     how many of its transfers are already in flight
//!   * the receiver converts granted credits into a byte window backed by
//!     real receive buffers; acknowledgements refill the window, so one
//!     grant carries a transfer of any size
//! * Small messages travel inside the request itself (eager); large ones
//!   stream as sender-paced data packets, or are pulled by the receiver
//!   with device-level reads when both sides support it
//! * All packet memory comes from fixed-size pools registered with the
//!   device up front; packets and operations are addressed through
//!   generational handles, so stale wire references are detected instead
//!   of corrupting reused entries
//! * Progress is explicit: a single-threaded tick polls completion queues,
//!   replenishes receive buffers, retries queued work and paces data out.
//!   Nothing blocks, and there are no background threads
//!
//! ## Non-goals
//!
//! * congestion control across peers (credits are per-peer)
//! * retransmission - the device is assumed reliable, only unordered
//! * wire-level security; deployments run on closed fabrics

pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod flow_control;
mod peer;
pub mod pools;
mod progress;
pub mod read_entry;
pub mod rx_entry;
pub mod test_util;
pub mod transport;
pub mod tx_entry;
pub mod wire;

pub use endpoint::{Endpoint, EndpointEvent, EndpointOption, OpCompletion, OpHandle, RecvRequest};
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
