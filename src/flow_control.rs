//! Credit admission and receiver-not-ready backoff.
//!
//! Credits are the per-peer unit of flow control: one credit covers one
//! in-flight data packet towards that peer. A transfer asks for a share of
//! the peer's remaining credits at submission time; the receiver echoes the
//! grant back as a byte window in its CTS.

use std::cmp::{max, min};
use std::time::Duration;

/// Fair share of `peer_credits` for a new transfer when `outstanding_ops`
/// transfers to the same peer are already in flight.
///
/// The divisor is biased by one: the new transfer counts itself, so a busy
/// peer hands out progressively smaller slices instead of letting the
/// newest transfer grab everything that is left. The request is capped by
/// what the transfer can actually use and raised to `min_credits` so small
/// transfers are not starved behind large ones.
pub fn compute_credit_request(
    peer_credits: u32,
    outstanding_ops: u32,
    total_len: u64,
    max_payload_size: usize,
    min_credits: u32,
) -> u32 {
    let fair_share = peer_credits.div_ceil(outstanding_ops + 1);
    let usable = total_len
        .div_ceil(max_payload_size as u64)
        .min(u32::MAX as u64) as u32;
    max(min(fair_share, usable), min_credits)
}

/// Exponential backoff for peers that answered a send with RNR.
///
/// While active, every drain step of the progress engine skips the peer.
/// Expiry only deactivates the backoff; the wait is kept so that the next
/// RNR from the same peer doubles it, up to the cap. A successful exchange
/// resets the wait to zero.
#[derive(Debug)]
pub struct RnrBackoff {
    initial_micros: u64,
    cap_micros: u64,
    wait_micros: u64,
    until_micros: u64,
    active: bool,
}

impl RnrBackoff {
    pub fn new(initial: Duration, cap: Duration) -> RnrBackoff {
        RnrBackoff {
            initial_micros: initial.as_micros() as u64,
            cap_micros: cap.as_micros() as u64,
            wait_micros: 0,
            until_micros: 0,
            active: false,
        }
    }

    pub fn on_receiver_not_ready(&mut self, now_micros: u64) {
        self.wait_micros = if self.wait_micros == 0 {
            self.initial_micros
        } else {
            min(self.wait_micros.saturating_mul(2), self.cap_micros)
        };
        self.until_micros = now_micros + self.wait_micros;
        self.active = true;
    }

    pub fn is_backed_off(&self) -> bool {
        self.active
    }

    pub fn has_expired(&self, now_micros: u64) -> bool {
        self.active && now_micros >= self.until_micros
    }

    /// Deactivates an expired backoff. Returns whether the peer became
    /// sendable again.
    pub fn clear_if_expired(&mut self, now_micros: u64) -> bool {
        if self.has_expired(now_micros) {
            self.active = false;
            true
        } else {
            false
        }
    }

    pub fn on_success(&mut self) {
        self.wait_micros = 0;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    // fair share of 32 credits, nothing else in flight, large transfer
    #[case::idle_peer(32, 0, 1 << 20, 8192, 4, 32)]
    // one transfer in flight: ceil(32 / 2) = 16
    #[case::one_outstanding(32, 1, 1 << 20, 8192, 4, 16)]
    // three in flight: ceil(32 / 4) = 8
    #[case::three_outstanding(32, 3, 1 << 20, 8192, 4, 8)]
    // seven in flight: ceil(32 / 8) = 4
    #[case::seven_outstanding(32, 7, 1 << 20, 8192, 4, 4)]
    // capped by what the transfer can use: 3 packets
    #[case::small_transfer(32, 0, 3 * 8192, 8192, 1, 3)]
    #[case::partial_tail(32, 0, 2 * 8192 + 1, 8192, 1, 3)]
    // floor applies when both fair share and need are tiny
    #[case::min_credits_floor(32, 31, 100, 8192, 4, 4)]
    #[case::single_byte(32, 0, 1, 8192, 4, 4)]
    // a broke peer still computes the floor; admission fails separately
    #[case::no_credits_left(0, 0, 1 << 20, 8192, 4, 4)]
    #[case::empty_message(32, 0, 0, 8192, 4, 4)]
    fn test_compute_credit_request(
        #[case] peer_credits: u32,
        #[case] outstanding_ops: u32,
        #[case] total_len: u64,
        #[case] max_payload_size: usize,
        #[case] min_credits: u32,
        #[case] expected: u32,
    ) {
        let actual = compute_credit_request(
            peer_credits, outstanding_ops, total_len, max_payload_size, min_credits);
        assert_eq!(actual, expected);
    }

    fn backoff() -> RnrBackoff {
        RnrBackoff::new(Duration::from_micros(100), Duration::from_micros(600))
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut b = backoff();
        assert!(!b.is_backed_off());

        b.on_receiver_not_ready(0);
        assert!(b.is_backed_off());
        assert_eq!(b.until_micros, 100);

        b.on_receiver_not_ready(100);
        assert_eq!(b.until_micros, 300);

        b.on_receiver_not_ready(300);
        assert_eq!(b.until_micros, 700);

        // capped
        b.on_receiver_not_ready(700);
        assert_eq!(b.until_micros, 1300);
    }

    #[test]
    fn test_expiry_keeps_escalation() {
        let mut b = backoff();
        b.on_receiver_not_ready(0);

        assert!(!b.clear_if_expired(99));
        assert!(b.is_backed_off());
        assert!(b.clear_if_expired(100));
        assert!(!b.is_backed_off());

        // next RNR doubles even though the previous backoff expired
        b.on_receiver_not_ready(100);
        assert_eq!(b.until_micros, 300);
    }

    #[test]
    fn test_success_resets_wait() {
        let mut b = backoff();
        b.on_receiver_not_ready(0);
        b.on_receiver_not_ready(10);
        b.on_success();
        assert!(!b.is_backed_off());

        b.on_receiver_not_ready(1000);
        assert_eq!(b.until_micros, 1100, "wait restarts at the initial value");
    }
}
