//! End-to-end transfer scenarios over the in-memory fabric, exercising the
//! endpoint through its public API only.

use bytes::Bytes;

use rdgram::config::EndpointConfig;
use rdgram::test_util::TestPair;
use rdgram::{OpCompletion, RecvRequest};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn recv(buffer_len: usize, context: u64) -> RecvRequest {
    RecvRequest { from: None, tag: None, buffer: vec![0; buffer_len], multi_recv: false, context }
}

/// A 1 MiB message over 8 KiB datagrams with a 4 credit budget: the window
/// never exceeds 4 packets, acknowledgements keep refilling it, and the
/// message crosses the fabric in exactly ceil(1 MiB / 8 KiB) data packets.
#[test]
fn test_mebibyte_transfer_fragments_under_credit_window() {
    let mut config = EndpointConfig::default_hw();
    config.peer_credits = 4;
    config.min_credits = 1;
    let max_payload = config.max_payload_size;
    let pair = TestPair::new(config);
    pair.tick(1);

    let total = 1024 * 1024;
    let data = pattern(total, 11);
    pair.b.submit_recv(recv(total, 500)).unwrap();
    pair.a
        .submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 9)
        .unwrap();
    pair.tick(300);

    assert_eq!(
        pair.a.poll_completions(16),
        vec![OpCompletion::Send { context: 9, error: None }]
    );
    let completions = pair.b.poll_completions(16);
    match &completions[..] {
        [OpCompletion::Receive { context: 500, buffer, len, error: None }] => {
            assert_eq!(*len, total as u64);
            assert_eq!(buffer[..], data[..]);
        }
        other => panic!("unexpected completions: {:?}", other),
    }

    // every payload-bearing datagram carries a full max_payload slice
    let data_packets = pair
        .fabric
        .delivered_sizes(pair.addr_b)
        .iter()
        .filter(|&&size| size >= max_payload)
        .count();
    assert_eq!(data_packets, total / max_payload);
}

/// With the fabric parked mid-transfer no acknowledgements come back, so
/// the sender saturates its granted window and stops: exactly four data
/// packets in flight, no matter how many ticks pass.
#[test]
fn test_window_caps_unacknowledged_data_in_flight() {
    let mut config = EndpointConfig::default_hw();
    config.peer_credits = 4;
    config.min_credits = 1;
    let max_payload = config.max_payload_size;
    let pair = TestPair::new(config);
    pair.tick(1);

    let total = 1024 * 1024;
    let data = pattern(total, 13);
    pair.b.submit_recv(recv(total, 500)).unwrap();
    pair.a
        .submit_send(pair.addr_b, vec![Bytes::from(data.clone())], None, 9)
        .unwrap();
    pair.tick(2); // request matched, window granted

    pair.fabric.hold(pair.addr_b);
    pair.tick(50);
    let parked = pair
        .fabric
        .held_sizes(pair.addr_b)
        .into_iter()
        .filter(|&size| size >= max_payload)
        .count();
    assert_eq!(parked, 4, "unacknowledged data bounded by the 4 packet window");

    pair.fabric.release(pair.addr_b);
    pair.tick(400);
    assert_eq!(
        pair.a.poll_completions(16),
        vec![OpCompletion::Send { context: 9, error: None }]
    );
    let completions = pair.b.poll_completions(16);
    match &completions[..] {
        [OpCompletion::Receive { context: 500, buffer, len, error: None }] => {
            assert_eq!(*len, total as u64);
            assert_eq!(buffer[..], data[..]);
        }
        other => panic!("unexpected completions: {:?}", other),
    }
}

/// Several transfers towards the same peer split the credit budget instead
/// of the first one starving the rest.
#[test]
fn test_concurrent_transfers_share_credits() {
    let mut config = EndpointConfig::default_hw();
    config.peer_credits = 8;
    config.min_credits = 1;
    let pair = TestPair::new(config);
    pair.tick(1);

    let len = 16 * 1024;
    let messages: Vec<Vec<u8>> = (0..3).map(|seed| pattern(len, seed as u8)).collect();
    for context in 0..3u64 {
        pair.b.submit_recv(recv(len, 100 + context)).unwrap();
    }
    for (context, message) in messages.iter().enumerate() {
        pair.a
            .submit_send(pair.addr_b, vec![Bytes::from(message.clone())], None, context as u64)
            .unwrap();
    }
    pair.tick(60);

    let mut sent: Vec<u64> = pair
        .a
        .poll_completions(16)
        .into_iter()
        .map(|c| match c {
            OpCompletion::Send { context, error: None } => context,
            other => panic!("unexpected completion: {:?}", other),
        })
        .collect();
    sent.sort_unstable();
    assert_eq!(sent, vec![0, 1, 2]);

    // ordered delivery: receives complete in submission order
    let completions = pair.b.poll_completions(16);
    assert_eq!(completions.len(), 3);
    for (i, completion) in completions.iter().enumerate() {
        match completion {
            OpCompletion::Receive { context, buffer, len: n, error: None } => {
                assert_eq!(*context, 100 + i as u64);
                assert_eq!(*n, len as u64);
                assert_eq!(buffer[..], messages[i][..]);
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }
}
