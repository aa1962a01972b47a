/// Raw value marking a key as blocked rather than counted.
pub const BLOCK_SENTINEL: i64 = -1;

/// Counter record - the value held under one identity key.
///
/// A key holds either a window counter or a block marker, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// Requests seen in the current window.
    Counter(u64),
    /// The key is blocked until its expiry.
    Blocked,
}

impl Record {
    /// Decode a raw stored integer. Returns `None` for negative values other
    /// than [`BLOCK_SENTINEL`].
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            BLOCK_SENTINEL => Some(Record::Blocked),
            n if n >= 0 => Some(Record::Counter(n as u64)),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Record::Counter(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Record::Blocked => BLOCK_SENTINEL,
        }
    }
}
