//! [Record] is the unit of data flowing through streams.

use std::borrow::Cow;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use chrono::Utc;

/// Event-time marker packed into a `u64`.
///
/// ```text
///  63                              16 15            1    0
/// +----------------------------------+---------------+----+
/// |        timestamp (millis)        |   sequence    | c  |
/// +----------------------------------+---------------+----+
/// ```
/// `c` is the completed bit. Comparing the raw values orders watermarks by timestamp first, then
/// by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(u64);

impl Watermark {
    pub const LOW: Watermark = Watermark(0);

    const SEQUENCE_MASK: u64 = 0x7FFF;

    pub fn of_timestamp(timestamp_ms: u64, sequence: u16) -> Self {
        Watermark((timestamp_ms << 16) | ((sequence as u64 & Self::SEQUENCE_MASK) << 1))
    }

    pub fn of_now() -> Self {
        Self::of_timestamp(Utc::now().timestamp_millis().max(0) as u64, 0)
    }

    pub fn from_value(value: u64) -> Self {
        Watermark(value)
    }

    /// The same watermark with the completed bit set.
    pub fn completed(self) -> Self {
        Watermark(self.0 | 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn timestamp(&self) -> u64 {
        self.0 >> 16
    }

    pub fn sequence(&self) -> u16 {
        ((self.0 >> 1) & Self::SEQUENCE_MASK) as u16
    }

    pub fn is_completed(&self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{}",
            self.timestamp(),
            self.sequence(),
            if self.is_completed() { ":c" } else { "" }
        )
    }
}

/// Metadata bits carried by a [Record].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordFlags(u32);

impl RecordFlags {
    pub const DEFAULT: RecordFlags = RecordFlags(0);
    pub const COMMIT: RecordFlags = RecordFlags(1);
    /// Terminal marker, the partition reading it stops cleanly.
    pub const POISON_PILL: RecordFlags = RecordFlags(1 << 1);
    pub const EXTERNAL_VALUE: RecordFlags = RecordFlags(1 << 2);
    pub const TRACE: RecordFlags = RecordFlags(1 << 3);

    pub fn from_bits(bits: u32) -> Self {
        RecordFlags(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        RecordFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RecordFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Immutable unit of data. Records sharing a key keep their relative order only inside one
/// partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub payload: Bytes,
    pub watermark: Watermark,
    pub flags: RecordFlags,
}

const POISON_PILL_KEY: &str = "__poison_pill__";

impl Record {
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            watermark: Watermark::of_now(),
            flags: RecordFlags::DEFAULT,
        }
    }

    /// A record with an empty payload.
    pub fn of_key(key: impl Into<Bytes>) -> Self {
        Self::new(key, Bytes::new())
    }

    pub fn poison_pill() -> Self {
        Self::of_key(POISON_PILL_KEY).with_flags(RecordFlags::POISON_PILL)
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_flags(mut self, flags: RecordFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_poison_pill(&self) -> bool {
        self.flags.contains(RecordFlags::POISON_PILL)
    }

    /// Key rendered for logs.
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_packs_fields() {
        let wm = Watermark::of_timestamp(1_700_000_000_000, 42);
        assert_eq!(wm.timestamp(), 1_700_000_000_000);
        assert_eq!(wm.sequence(), 42);
        assert!(!wm.is_completed());

        let done = wm.completed();
        assert!(done.is_completed());
        assert_eq!(done.timestamp(), wm.timestamp());
        assert_eq!(done.sequence(), 42);
    }

    #[test]
    fn watermark_sequence_is_masked() {
        let wm = Watermark::of_timestamp(10, u16::MAX);
        assert_eq!(wm.sequence(), 0x7FFF);
        assert_eq!(wm.timestamp(), 10);
    }

    #[test]
    fn watermarks_order_by_time_then_sequence() {
        let a = Watermark::of_timestamp(100, 5);
        let b = Watermark::of_timestamp(100, 6);
        let c = Watermark::of_timestamp(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Watermark::LOW < a);
    }

    #[test]
    fn flags_combine() {
        let flags = RecordFlags::COMMIT | RecordFlags::TRACE;
        assert!(flags.contains(RecordFlags::COMMIT));
        assert!(flags.contains(RecordFlags::TRACE));
        assert!(!flags.contains(RecordFlags::POISON_PILL));
        assert_eq!(RecordFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn poison_pill_is_flagged() {
        assert!(Record::poison_pill().is_poison_pill());
        assert!(!Record::of_key("k1").is_poison_pill());
    }

    #[test]
    fn record_keeps_key_and_payload() {
        let record = Record::new("k1", "v1");
        assert_eq!(record.key_str(), "k1");
        assert_eq!(record.payload, Bytes::from("v1"));
        assert_eq!(record.flags, RecordFlags::DEFAULT);
    }
}
