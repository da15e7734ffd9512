use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bound alias for types usable as archive keys.
///
/// Keys must round-trip through the codec (they are stored inside the backing
/// file next to their payload), be totally ordered for the index map and the
/// cluster request registry, and be cheap enough to clone into the recency
/// list.
pub trait ArchiveKey: Serialize + DeserializeOwned + Ord + Clone {}

impl<T: Serialize + DeserializeOwned + Ord + Clone> ArchiveKey for T {}

/// Index record for one stored object.
#[derive(Debug)]
pub struct ObjectEntry {
    /// Byte position of the payload inside the backing file. `None` until the
    /// entry has been written back for the first time.
    pub offset: Option<u64>,
    /// Payload length in bytes; fixed for the lifetime of the entry.
    pub size: u64,
    /// The payload itself while the entry is resident in the buffer.
    pub data: Option<Vec<u8>>,
    /// True iff the resident bytes have not reached the file at `offset`.
    pub modified: bool,
}

impl ObjectEntry {
    pub fn resident(&self) -> bool {
        self.data.is_some()
    }
}

/// Parses a byte-count string like `"1.5G"` into a buffer budget.
///
/// The leading decimal number is scaled by the first `K`, `M` or `G` modifier
/// found (1e3, 1e6, 1e9); anything after that modifier is ignored. A string
/// without a modifier is taken as plain bytes, and a malformed number parses
/// as zero.
pub fn parse_buffer_size(text: &str) -> u64 {
    let trimmed = text.trim();
    let numeric: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '+' || *c == '-')
        .collect();
    let mut size: f64 = numeric.parse().unwrap_or(0.0);

    for c in trimmed.chars() {
        match c {
            'k' | 'K' => {
                size *= 1e3;
                break;
            }
            'm' | 'M' => {
                size *= 1e6;
                break;
            }
            'g' | 'G' => {
                size *= 1e9;
                break;
            }
            _ => {}
        }
    }

    if size <= 0.0 { 0 } else { size as u64 }
}
