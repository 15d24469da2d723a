//! On-disk encoding of records: every frame is the little-endian `u64` length of a prost encoded
//! [RecordProto] followed by the message bytes.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::error::Result;
use crate::record::{Record, RecordFlags, Watermark};

const LEN_PREFIX: usize = size_of::<u64>();

#[derive(Clone, PartialEq, Message)]
pub(crate) struct RecordProto {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    #[prost(uint64, tag = "3")]
    pub watermark: u64,
    #[prost(uint32, tag = "4")]
    pub flags: u32,
}

impl From<&Record> for RecordProto {
    fn from(record: &Record) -> Self {
        Self {
            key: record.key.clone(),
            payload: record.payload.clone(),
            watermark: record.watermark.value(),
            flags: record.flags.bits(),
        }
    }
}

impl From<RecordProto> for Record {
    fn from(proto: RecordProto) -> Self {
        Record {
            key: proto.key,
            payload: proto.payload,
            watermark: Watermark::from_value(proto.watermark),
            flags: RecordFlags::from_bits(proto.flags),
        }
    }
}

pub(crate) fn encode_frame(record: &Record) -> Result<Bytes> {
    let proto = RecordProto::from(record);
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + proto.encoded_len());
    buf.put_u64_le(proto.encoded_len() as u64);
    proto.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decodes every complete frame of `data`. Returns the records and the number of bytes they
/// span; a torn frame at the tail is left out of both.
pub(crate) fn decode_frames(data: &[u8]) -> Result<(Vec<Record>, usize)> {
    let mut records = Vec::new();
    let mut cursor = data;
    let mut consumed = 0;
    while let Some((prefix, rest)) = cursor.split_first_chunk::<LEN_PREFIX>() {
        let len = u64::from_le_bytes(*prefix) as usize;
        let Some((frame, tail)) = rest.split_at_checked(len) else {
            break;
        };
        records.push(RecordProto::decode(frame)?.into());
        cursor = tail;
        consumed += LEN_PREFIX + len;
    }
    Ok((records, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_concatenate() {
        let a = Record::new("k1", "v1").with_flags(RecordFlags::TRACE);
        let b = Record::of_key("k2").with_watermark(Watermark::of_timestamp(5, 1));
        let mut data = encode_frame(&a).unwrap().to_vec();
        data.extend_from_slice(&encode_frame(&b).unwrap());

        let (records, consumed) = decode_frames(&data).unwrap();
        assert_eq!(records, vec![a, b]);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let a = Record::new("k1", "v1");
        let frame = encode_frame(&a).unwrap();
        let mut data = frame.to_vec();
        data.extend_from_slice(&frame[..frame.len() - 3]);

        let (records, consumed) = decode_frames(&data).unwrap();
        assert_eq!(records, vec![a]);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn garbage_frame_is_an_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u64.to_le_bytes());
        data.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(decode_frames(&data).is_err());
    }
}
