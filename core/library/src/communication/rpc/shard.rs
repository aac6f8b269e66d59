use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use std::num::NonZeroUsize;

/// Number of bytes a hash key has to consist of
pub const HASH_KEY_LENGTH: usize = 16;

/// Maps correlation identifiers onto a fixed number of result queues
///
/// Uses the lower 31 bits of a keyed SipHash-2-4 so that implementations in languages
/// without unsigned 64-bit integers derive the same shard. As long as the number of shards
/// is a power of two, dropping the upper bits does not skew the distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSelector {
    key: [u8; HASH_KEY_LENGTH],
    count: NonZeroUsize,
}

impl ShardSelector {
    /// Creates a new instance from raw parts
    pub fn new(key: [u8; HASH_KEY_LENGTH], count: NonZeroUsize) -> Self {
        Self { key, count }
    }

    /// Number of shards identifiers are distributed over
    pub fn count(&self) -> usize {
        self.count.get()
    }

    /// Shard in `[0, count)` for the given identifier
    pub fn shard(&self, id: &str) -> usize {
        let hash = hash31(&self.key, id.as_bytes()) as usize;
        hash % self.count.get()
    }
}

/// Lower 32 bits of the keyed SipHash-2-4 of `data` with the sign bit cleared
fn hash31(key: &[u8; HASH_KEY_LENGTH], data: &[u8]) -> u32 {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(data);

    (hasher.finish() & 0x7FFF_FFFF) as u32
}
