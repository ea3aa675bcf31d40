//! Wire message layouts (spec §6). All fields little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BmiError, Result};

/// `u32 type; u32 credit_return` — shared by every message on the wire.
pub const COMMON_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    EagerSend = 0,
    EagerSendUnexpected = 1,
    Rts = 2,
    Cts = 3,
    RtsDone = 4,
    Bye = 5,
    Credit = 6,
}

impl MessageType {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => MessageType::EagerSend,
            1 => MessageType::EagerSendUnexpected,
            2 => MessageType::Rts,
            3 => MessageType::Cts,
            4 => MessageType::RtsDone,
            5 => MessageType::Bye,
            6 => MessageType::Credit,
            other => {
                return Err(BmiError::Protocol(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub msg_type: MessageType,
    /// Credits the sender is returning, piggybacked on this message.
    pub credit_return: u32,
}

impl CommonHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.msg_type as u32);
        buf.put_u32_le(self.credit_return);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < COMMON_HEADER_SIZE {
            return Err(BmiError::Protocol("truncated common header".into()));
        }
        let msg_type = MessageType::from_u32(buf.get_u32_le())?;
        let credit_return = buf.get_u32_le();
        Ok(CommonHeader {
            msg_type,
            credit_return,
        })
    }
}

/// `common; u32 bmi_tag; u8 payload[...]` — carries either
/// `EAGER_SEND` or `EAGER_SEND_UNEXPECTED`.
#[derive(Debug, Clone)]
pub struct EagerSend {
    pub common: CommonHeader,
    pub bmi_tag: u32,
    pub payload: Bytes,
}

impl EagerSend {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.common.encode(buf);
        buf.put_u32_le(self.bmi_tag);
        buf.put_slice(&self.payload);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let common = CommonHeader::decode(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(BmiError::Protocol("truncated eager header".into()));
        }
        let bmi_tag = buf.get_u32_le();
        Ok(EagerSend {
            common,
            bmi_tag,
            payload: buf,
        })
    }
}

/// `common; u32 bmi_tag; u64 mop_id; u64 total_len`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rts {
    pub common: CommonHeader,
    pub bmi_tag: u32,
    pub mop_id: u64,
    pub total_len: u64,
}

impl Rts {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.common.encode(buf);
        buf.put_u32_le(self.bmi_tag);
        buf.put_u64_le(self.mop_id);
        buf.put_u64_le(self.total_len);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let common = CommonHeader::decode(&mut buf)?;
        if buf.remaining() < 20 {
            return Err(BmiError::Protocol("truncated RTS".into()));
        }
        let bmi_tag = buf.get_u32_le();
        let mop_id = buf.get_u64_le();
        let total_len = buf.get_u64_le();
        Ok(Rts {
            common,
            bmi_tag,
            mop_id,
            total_len,
        })
    }
}

/// One `{ u64 addr; u32 len; u32 rkey }` entry of a CTS segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsSegment {
    pub addr: u64,
    pub len: u32,
    pub rkey: u32,
}

/// `common; u64 rts_mop_id; u64 total_len; u32 num_segs; segs[num_segs]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cts {
    pub common: CommonHeader,
    pub rts_mop_id: u64,
    pub total_len: u64,
    pub segments: Vec<CtsSegment>,
}

impl Cts {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.common.encode(buf);
        buf.put_u64_le(self.rts_mop_id);
        buf.put_u64_le(self.total_len);
        buf.put_u32_le(self.segments.len() as u32);
        for s in &self.segments {
            buf.put_u64_le(s.addr);
            buf.put_u32_le(s.len);
            buf.put_u32_le(s.rkey);
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let common = CommonHeader::decode(&mut buf)?;
        if buf.remaining() < 20 {
            return Err(BmiError::Protocol("truncated CTS".into()));
        }
        let rts_mop_id = buf.get_u64_le();
        let total_len = buf.get_u64_le();
        let num_segs = buf.get_u32_le() as usize;
        if buf.remaining() < num_segs * 16 {
            return Err(BmiError::Protocol("truncated CTS segment table".into()));
        }
        let mut segments = Vec::with_capacity(num_segs);
        for _ in 0..num_segs {
            let addr = buf.get_u64_le();
            let len = buf.get_u32_le();
            let rkey = buf.get_u32_le();
            segments.push(CtsSegment { addr, len, rkey });
        }
        Ok(Cts {
            common,
            rts_mop_id,
            total_len,
            segments,
        })
    }
}

/// `common; u64 mop_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsDone {
    pub common: CommonHeader,
    pub mop_id: u64,
}

impl RtsDone {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.common.encode(buf);
        buf.put_u64_le(self.mop_id);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let common = CommonHeader::decode(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(BmiError::Protocol("truncated RTS_DONE".into()));
        }
        let mop_id = buf.get_u64_le();
        Ok(RtsDone { common, mop_id })
    }
}

/// `common` alone — used for both `CREDIT` and `BYE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOnly {
    pub common: CommonHeader,
}

impl HeaderOnly {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.common.encode(buf);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let common = CommonHeader::decode(&mut buf)?;
        Ok(HeaderOnly { common })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_send_round_trips() {
        let msg = EagerSend {
            common: CommonHeader {
                msg_type: MessageType::EagerSend,
                credit_return: 3,
            },
            bmi_tag: 7,
            payload: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let decoded = EagerSend::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.common.credit_return, 3);
        assert_eq!(decoded.bmi_tag, 7);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn rts_round_trips() {
        let msg = Rts {
            common: CommonHeader {
                msg_type: MessageType::Rts,
                credit_return: 0,
            },
            bmi_tag: 9,
            mop_id: 42,
            total_len: 4_194_304,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(Rts::decode(buf.freeze()).unwrap(), msg);
    }

    #[test]
    fn cts_round_trips_with_multiple_segments() {
        let msg = Cts {
            common: CommonHeader {
                msg_type: MessageType::Cts,
                credit_return: 1,
            },
            rts_mop_id: 42,
            total_len: 4_194_304,
            segments: vec![
                CtsSegment {
                    addr: 0x1000,
                    len: 2_097_152,
                    rkey: 0xdead,
                },
                CtsSegment {
                    addr: 0x2000,
                    len: 2_097_152,
                    rkey: 0xbeef,
                },
            ],
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(Cts::decode(buf.freeze()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(99);
        buf.put_u32_le(0);
        assert!(CommonHeader::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn decode_rejects_truncated_rts() {
        let mut buf = BytesMut::new();
        CommonHeader {
            msg_type: MessageType::Rts,
            credit_return: 0,
        }
        .encode(&mut buf);
        assert!(Rts::decode(buf.freeze()).is_err());
    }
}
