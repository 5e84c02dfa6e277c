//! Wire format for the control and data frames exchanged between endpoints.
//!
//! Every datagram starts with a one-byte frame kind. Entry ids on the wire
//! are the 64-bit encoding of the owning entry's pool handle (slot index plus
//! generation), so a stale or replayed frame can never be routed to a slot
//! that has since been reused.
//!
//! ```ascii
//! REQUEST:   kind(u8) flags(u8) op(u8) tx_id(u64 BE) msg_id(u64 varint)
//!            total_len(u64 varint) credit_request(u32 varint)
//!            [tag(u64 BE) if TAGGED]
//!            [remote_key(u64 BE) remote_offset(u64 BE) if op=Write]
//!            [region count(varint) + (key,len)* if READ_OFFLOAD]
//!            [payload if EAGER]
//! CTS:       kind(u8) tx_id(u64 BE) rx_id(u64 BE) window_bytes(u64 varint)
//! DATA:      kind(u8) rx_id(u64 BE) offset(u64 varint) payload
//! ACK:       kind(u8) tx_id(u64 BE) bytes(u64 varint)
//! EOR:       kind(u8) tx_id(u64 BE)
//! HANDSHAKE: kind(u8) features(u32 varint)
//! ATOMIC_*:  see struct docs
//! ```

use bytes::{Buf, BufMut, Bytes};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::{Error, Result};

const KIND_HANDSHAKE: u8 = 1;
const KIND_REQUEST: u8 = 2;
const KIND_CTS: u8 = 3;
const KIND_DATA: u8 = 4;
const KIND_ACK: u8 = 5;
const KIND_EOR: u8 = 6;
const KIND_ATOMIC_REQUEST: u8 = 7;
const KIND_ATOMIC_RESPONSE: u8 = 8;

/// Peer feature bits advertised in HANDSHAKE frames.
pub const FEATURE_DEVICE_READ: u32 = 1;

pub const FLAG_EAGER: u8 = 1;
pub const FLAG_TAGGED: u8 = 2;
pub const FLAG_READ_OFFLOAD: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOp {
    Send,
    Write,
}

impl WireOp {
    fn to_raw(self) -> u8 {
        match self {
            WireOp::Send => 0,
            WireOp::Write => 1,
        }
    }

    fn from_raw(raw: u8) -> Result<WireOp> {
        match raw {
            0 => Ok(WireOp::Send),
            1 => Ok(WireOp::Write),
            _ => Err(Error::MalformedPacket("unknown request op")),
        }
    }
}

/// Atomic operations applied at the target. Compare carries the expected
/// value in `compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Swap,
    CompareSwap,
}

impl AtomicOp {
    fn to_raw(self) -> u8 {
        match self {
            AtomicOp::Add => 0,
            AtomicOp::Swap => 1,
            AtomicOp::CompareSwap => 2,
        }
    }

    fn from_raw(raw: u8) -> Result<AtomicOp> {
        match raw {
            0 => Ok(AtomicOp::Add),
            1 => Ok(AtomicOp::Swap),
            2 => Ok(AtomicOp::CompareSwap),
            _ => Err(Error::MalformedPacket("unknown atomic op")),
        }
    }
}

/// A sender-side registered memory region a receiver may read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRegion {
    pub key: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub tx_id: u64,
    pub op: WireOp,
    pub msg_id: u64,
    pub total_len: u64,
    pub credit_request: u32,
    pub tag: Option<u64>,
    /// Target region for `WireOp::Write`.
    pub write_target: Option<(u64, u64)>,
    /// Present when the sender offers its payload for device reads.
    pub read_regions: Vec<ReadRegion>,
    /// Present when the whole message fits into the request datagram.
    pub eager_payload: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsFrame {
    pub tx_id: u64,
    pub rx_id: u64,
    pub window_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub rx_id: u64,
    pub offset: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub tx_id: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicRequestFrame {
    pub tx_id: u64,
    pub op: AtomicOp,
    pub key: u64,
    pub operand: u64,
    pub compare: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicResponseFrame {
    pub tx_id: u64,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake { features: u32 },
    Request(RequestFrame),
    ClearToSend(CtsFrame),
    Data(DataFrame),
    Ack(AckFrame),
    EndOfRead { tx_id: u64 },
    AtomicRequest(AtomicRequestFrame),
    AtomicResponse(AtomicResponseFrame),
}

impl Frame {
    /// Header bytes of the largest frame, used to size packet buffers so a
    /// full `max_payload_size` always fits behind any header.
    pub const MAX_HEADER_LEN: usize = 64;

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Frame::Handshake { features } => {
                buf.put_u8(KIND_HANDSHAKE);
                buf.put_u32_varint(*features);
            }
            Frame::Request(req) => {
                buf.put_u8(KIND_REQUEST);
                let mut flags = 0u8;
                if req.eager_payload.is_some() { flags |= FLAG_EAGER; }
                if req.tag.is_some() { flags |= FLAG_TAGGED; }
                if !req.read_regions.is_empty() { flags |= FLAG_READ_OFFLOAD; }
                buf.put_u8(flags);
                buf.put_u8(req.op.to_raw());
                buf.put_u64(req.tx_id);
                buf.put_u64_varint(req.msg_id);
                buf.put_u64_varint(req.total_len);
                buf.put_u32_varint(req.credit_request);
                if let Some(tag) = req.tag {
                    buf.put_u64(tag);
                }
                if let Some((key, offset)) = req.write_target {
                    buf.put_u64(key);
                    buf.put_u64(offset);
                }
                if !req.read_regions.is_empty() {
                    buf.put_usize_varint(req.read_regions.len());
                    for region in &req.read_regions {
                        buf.put_u64(region.key);
                        buf.put_u64_varint(region.len);
                    }
                }
                if let Some(payload) = &req.eager_payload {
                    buf.put_slice(payload);
                }
            }
            Frame::ClearToSend(cts) => {
                buf.put_u8(KIND_CTS);
                buf.put_u64(cts.tx_id);
                buf.put_u64(cts.rx_id);
                buf.put_u64_varint(cts.window_bytes);
            }
            Frame::Data(data) => {
                buf.put_u8(KIND_DATA);
                buf.put_u64(data.rx_id);
                buf.put_u64_varint(data.offset);
                buf.put_slice(&data.payload);
            }
            Frame::Ack(ack) => {
                buf.put_u8(KIND_ACK);
                buf.put_u64(ack.tx_id);
                buf.put_u64_varint(ack.bytes);
            }
            Frame::EndOfRead { tx_id } => {
                buf.put_u8(KIND_EOR);
                buf.put_u64(*tx_id);
            }
            Frame::AtomicRequest(req) => {
                buf.put_u8(KIND_ATOMIC_REQUEST);
                buf.put_u8(req.op.to_raw());
                buf.put_u64(req.tx_id);
                buf.put_u64(req.key);
                buf.put_u64(req.operand);
                if req.op == AtomicOp::CompareSwap {
                    buf.put_u64(req.compare);
                }
            }
            Frame::AtomicResponse(resp) => {
                buf.put_u8(KIND_ATOMIC_RESPONSE);
                buf.put_u64(resp.tx_id);
                buf.put_u64(resp.value);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Frame> {
        let kind = buf.try_get_u8().map_err(|_| Error::MalformedPacket("empty packet"))?;
        match kind {
            KIND_HANDSHAKE => {
                let features = buf.try_get_u32_varint()
                    .map_err(|_| Error::MalformedPacket("short handshake"))?;
                Ok(Frame::Handshake { features })
            }
            KIND_REQUEST => Ok(Frame::Request(Self::deser_request(buf)?)),
            KIND_CTS => {
                let tx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short cts"))?;
                let rx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short cts"))?;
                let window_bytes = buf.try_get_u64_varint()
                    .map_err(|_| Error::MalformedPacket("short cts"))?;
                Ok(Frame::ClearToSend(CtsFrame { tx_id, rx_id, window_bytes }))
            }
            KIND_DATA => {
                let rx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short data"))?;
                let offset = buf.try_get_u64_varint()
                    .map_err(|_| Error::MalformedPacket("short data"))?;
                let payload = buf.copy_to_bytes(buf.remaining());
                Ok(Frame::Data(DataFrame { rx_id, offset, payload }))
            }
            KIND_ACK => {
                let tx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short ack"))?;
                let bytes = buf.try_get_u64_varint()
                    .map_err(|_| Error::MalformedPacket("short ack"))?;
                Ok(Frame::Ack(AckFrame { tx_id, bytes }))
            }
            KIND_EOR => {
                let tx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short eor"))?;
                Ok(Frame::EndOfRead { tx_id })
            }
            KIND_ATOMIC_REQUEST => {
                let op = AtomicOp::from_raw(buf.try_get_u8()
                    .map_err(|_| Error::MalformedPacket("short atomic request"))?)?;
                let tx_id = buf.try_get_u64()
                    .map_err(|_| Error::MalformedPacket("short atomic request"))?;
                let key = buf.try_get_u64()
                    .map_err(|_| Error::MalformedPacket("short atomic request"))?;
                let operand = buf.try_get_u64()
                    .map_err(|_| Error::MalformedPacket("short atomic request"))?;
                let compare = if op == AtomicOp::CompareSwap {
                    buf.try_get_u64().map_err(|_| Error::MalformedPacket("short atomic request"))?
                } else {
                    0
                };
                Ok(Frame::AtomicRequest(AtomicRequestFrame { tx_id, op, key, operand, compare }))
            }
            KIND_ATOMIC_RESPONSE => {
                let tx_id = buf.try_get_u64()
                    .map_err(|_| Error::MalformedPacket("short atomic response"))?;
                let value = buf.try_get_u64()
                    .map_err(|_| Error::MalformedPacket("short atomic response"))?;
                Ok(Frame::AtomicResponse(AtomicResponseFrame { tx_id, value }))
            }
            _ => Err(Error::MalformedPacket("unknown frame kind")),
        }
    }

    fn deser_request(buf: &mut impl Buf) -> Result<RequestFrame> {
        let flags = buf.try_get_u8().map_err(|_| Error::MalformedPacket("short request"))?;
        let op = WireOp::from_raw(buf.try_get_u8()
            .map_err(|_| Error::MalformedPacket("short request"))?)?;
        let tx_id = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short request"))?;
        let msg_id = buf.try_get_u64_varint()
            .map_err(|_| Error::MalformedPacket("short request"))?;
        let total_len = buf.try_get_u64_varint()
            .map_err(|_| Error::MalformedPacket("short request"))?;
        let credit_request = buf.try_get_u32_varint()
            .map_err(|_| Error::MalformedPacket("short request"))?;

        let tag = if flags & FLAG_TAGGED != 0 {
            Some(buf.try_get_u64().map_err(|_| Error::MalformedPacket("short request"))?)
        } else {
            None
        };
        let write_target = if op == WireOp::Write {
            let key = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short request"))?;
            let offset = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short request"))?;
            Some((key, offset))
        } else {
            None
        };
        let read_regions = if flags & FLAG_READ_OFFLOAD != 0 {
            let count = buf.try_get_usize_varint()
                .map_err(|_| Error::MalformedPacket("short request"))?;
            let mut regions = Vec::with_capacity(count);
            for _ in 0..count {
                let key = buf.try_get_u64().map_err(|_| Error::MalformedPacket("short request"))?;
                let len = buf.try_get_u64_varint()
                    .map_err(|_| Error::MalformedPacket("short request"))?;
                regions.push(ReadRegion { key, len });
            }
            regions
        } else {
            Vec::new()
        };
        let eager_payload = if flags & FLAG_EAGER != 0 {
            Some(buf.copy_to_bytes(buf.remaining()))
        } else {
            None
        };

        Ok(RequestFrame {
            tx_id,
            op,
            msg_id,
            total_len,
            credit_request,
            tag,
            write_target,
            read_regions,
            eager_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        Frame::deser(&mut buf.freeze()).unwrap()
    }

    #[rstest]
    #[case::handshake(Frame::Handshake { features: FEATURE_DEVICE_READ })]
    #[case::cts(Frame::ClearToSend(CtsFrame { tx_id: 77, rx_id: 3, window_bytes: 64 * 1024 }))]
    #[case::ack(Frame::Ack(AckFrame { tx_id: 12, bytes: 8192 }))]
    #[case::eor(Frame::EndOfRead { tx_id: 5 })]
    #[case::data(Frame::Data(DataFrame { rx_id: 9, offset: 16384, payload: Bytes::from_static(b"chunk") }))]
    #[case::atomic_add(Frame::AtomicRequest(AtomicRequestFrame { tx_id: 1, op: AtomicOp::Add, key: 42, operand: 7, compare: 0 }))]
    #[case::atomic_cas(Frame::AtomicRequest(AtomicRequestFrame { tx_id: 2, op: AtomicOp::CompareSwap, key: 42, operand: 9, compare: 7 }))]
    #[case::atomic_response(Frame::AtomicResponse(AtomicResponseFrame { tx_id: 2, value: 7 }))]
    fn test_frame_roundtrip(#[case] frame: Frame) {
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[rstest]
    #[case::plain(None, None, vec![], None)]
    #[case::tagged(Some(0xfeed), None, vec![], None)]
    #[case::eager(None, None, vec![], Some(Bytes::from_static(b"tiny message")))]
    #[case::write(None, Some((0xabc, 4096)), vec![], None)]
    #[case::read_offload(None, None, vec![ReadRegion { key: 1, len: 1 << 20 }, ReadRegion { key: 2, len: 512 }], None)]
    fn test_request_roundtrip(
        #[case] tag: Option<u64>,
        #[case] write_target: Option<(u64, u64)>,
        #[case] read_regions: Vec<ReadRegion>,
        #[case] eager_payload: Option<Bytes>,
    ) {
        let op = if write_target.is_some() { WireOp::Write } else { WireOp::Send };
        let frame = Frame::Request(RequestFrame {
            tx_id: 4711,
            op,
            msg_id: 12,
            total_len: 1 << 20,
            credit_request: 8,
            tag,
            write_target,
            read_regions,
            eager_payload,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::unknown_kind(&[99][..])]
    #[case::short_cts(&[KIND_CTS, 1, 2][..])]
    #[case::short_ack(&[KIND_ACK][..])]
    #[case::short_request(&[KIND_REQUEST, 0][..])]
    fn test_deser_rejects_malformed(#[case] raw: &[u8]) {
        let mut buf = raw;
        assert!(matches!(Frame::deser(&mut buf), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn test_header_fits_budget() {
        let frame = Frame::Request(RequestFrame {
            tx_id: u64::MAX,
            op: WireOp::Write,
            msg_id: u64::MAX,
            total_len: u64::MAX,
            credit_request: u32::MAX,
            tag: Some(u64::MAX),
            write_target: Some((u64::MAX, u64::MAX)),
            read_regions: vec![],
            eager_payload: None,
        });
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert!(buf.len() <= Frame::MAX_HEADER_LEN);
    }
}
