use std::time::Duration;
use anyhow::bail;

/// Endpoint configuration. `default_hw()` gives values sized for a typical
/// datagram NIC; tests shrink the pools to force the exhaustion paths.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Payload bytes carried by one datagram after the largest wire header.
    ///  The device's own MTU bounds this; the endpoint never asks the device
    ///  to send more than `max_payload_size` plus header in one post.
    pub max_payload_size: usize,

    /// Upper bound for in-flight send work items on the hardware device,
    ///  across all peers. The device's send ring must be able to hold this
    ///  many posts; the data-send step of the progress engine stops when the
    ///  bound is reached.
    pub tx_queue_size: u32,

    /// Receive buffers posted to the hardware device (and chunk size for the
    ///  hardware rx packet pool).
    pub rx_queue_size: u32,

    /// Chunk size for the hardware tx packet pool.
    pub tx_pool_chunk_size: u32,

    /// Chunk sizes for the loopback pools. Zero disables the loopback path.
    pub loopback_tx_pool_chunk_size: u32,
    pub loopback_rx_pool_chunk_size: u32,

    /// Staging pools that grow lazily on the first progress call:
    ///  unexpected-message staging, out-of-order staging and (optionally)
    ///  read-copy bounce buffers.
    pub unexpected_pool_chunk_size: u32,
    pub out_of_order_pool_chunk_size: u32,
    pub read_copy_pool_size: u32,

    /// Control-response staging (atomic fetch results) and send-descriptor
    ///  staging pools.
    pub ctrl_response_pool_chunk_size: u32,
    pub send_desc_pool_chunk_size: u32,

    /// Capacities of the operation-entry pools.
    pub tx_entry_count: u32,
    pub rx_entry_count: u32,
    pub read_entry_count: u32,

    /// Credits granted to each new peer. One credit covers one in-flight
    ///  data packet towards that peer.
    pub peer_credits: u32,

    /// Lower bound applied to the per-transfer credit request so that small
    ///  transfers are not starved behind large ones.
    pub min_credits: u32,

    /// First RNR backoff wait; doubles on every further RNR from the same
    ///  peer up to `rnr_backoff_cap`.
    pub rnr_backoff_initial: Duration,
    pub rnr_backoff_cap: Duration,

    /// Completions drained from the device queues per progress call. Keeps a
    ///  single call bounded even under a flood of arrivals.
    pub cq_poll_batch: usize,
    pub loopback_cq_poll_batch: usize,

    /// Transfers at least this large are fetched with device-level reads
    ///  instead of sender-paced data packets, when the device supports them.
    pub read_offload_threshold: Option<u64>,

    /// Largest single device read; larger reads are split into fragments.
    pub read_fragment_size: u64,

    /// Send segments at least this large are registered with the device and
    ///  exposed for remote reads rather than copied through packet buffers.
    pub memory_registration_threshold: usize,

    /// In zero-copy receive mode the endpoint keeps at most one internal
    ///  receive buffer posted and relies on application-provided buffers.
    pub zero_copy_receive: bool,

    /// Deliver messages from each peer in submission order, staging early
    ///  arrivals in the out-of-order pool.
    pub ordered_delivery: bool,

    /// A multi-recv buffer is retired once its remaining space drops below
    ///  this. Adjustable at runtime through `set_option`.
    pub min_multi_recv_size: usize,

    /// If the receive-side data buffer budget sits at zero for this long,
    ///  it is reset to the configured maximum. Grants can leak their budget
    ///  when a sender dies mid-transfer; this recovers instead of wedging.
    pub data_buffer_stall_timeout: Duration,
}

impl EndpointConfig {
    pub fn default_hw() -> EndpointConfig {
        EndpointConfig {
            max_payload_size: 8 * 1024,
            tx_queue_size: 256,
            rx_queue_size: 256,
            tx_pool_chunk_size: 256,
            loopback_tx_pool_chunk_size: 128,
            loopback_rx_pool_chunk_size: 128,
            unexpected_pool_chunk_size: 64,
            out_of_order_pool_chunk_size: 64,
            read_copy_pool_size: 0,
            ctrl_response_pool_chunk_size: 8,
            send_desc_pool_chunk_size: 64,
            tx_entry_count: 512,
            rx_entry_count: 512,
            read_entry_count: 256,
            peer_credits: 32,
            min_credits: 4,
            rnr_backoff_initial: Duration::from_micros(100),
            rnr_backoff_cap: Duration::from_millis(100),
            cq_poll_batch: 64,
            loopback_cq_poll_batch: 64,
            read_offload_threshold: None,
            read_fragment_size: 1024 * 1024,
            memory_registration_threshold: 64 * 1024,
            zero_copy_receive: false,
            ordered_delivery: true,
            min_multi_recv_size: 64,
            data_buffer_stall_timeout: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if self.tx_queue_size == 0 || self.rx_queue_size == 0 {
            bail!("device queue sizes must be positive");
        }
        if self.peer_credits == 0 {
            bail!("peers need at least one credit");
        }
        if self.min_credits == 0 || self.min_credits > self.peer_credits {
            bail!("min credits must be in 1..=peer_credits");
        }
        if self.rnr_backoff_initial.is_zero() || self.rnr_backoff_cap < self.rnr_backoff_initial {
            bail!("RNR backoff cap must be at least the initial wait");
        }
        if self.cq_poll_batch == 0 {
            bail!("completion poll batch must be positive");
        }
        if self.read_fragment_size == 0 {
            bail!("read fragment size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invalid(tweak: impl FnOnce(&mut EndpointConfig)) {
        let mut config = EndpointConfig::default_hw();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(EndpointConfig::default_hw().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        assert_invalid(|c| c.max_payload_size = 0);
        assert_invalid(|c| c.tx_queue_size = 0);
        assert_invalid(|c| c.rx_queue_size = 0);
        assert_invalid(|c| c.peer_credits = 0);
        assert_invalid(|c| c.min_credits = 0);
        assert_invalid(|c| { c.peer_credits = 4; c.min_credits = 5; });
        assert_invalid(|c| c.rnr_backoff_initial = Duration::ZERO);
        assert_invalid(|c| {
            c.rnr_backoff_initial = Duration::from_millis(10);
            c.rnr_backoff_cap = Duration::from_millis(1);
        });
        assert_invalid(|c| c.cq_poll_batch = 0);
        assert_invalid(|c| c.read_fragment_size = 0);
    }
}
