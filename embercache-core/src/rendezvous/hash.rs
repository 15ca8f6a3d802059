use twox_hash::xxh3;

/// Hash arbitrary bytes with the unsalted default hasher. Node identities are
/// hashed this way so they stay stable across router salts.
pub fn unsalted_hash64(data: &[u8]) -> u64 {
    xxh3::hash64(data)
}

/// Seeded 64-bit xxh3 hasher. An optional salt is folded down to a seed, so
/// two routers built with different salts rank the same node set differently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3Hash64 {
    seed: u64,
}

impl Xxh3Hash64 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_salt(salt: &[u8]) -> Self {
        if salt.is_empty() {
            Self::default()
        } else {
            Self {
                seed: xxh3::hash64(salt),
            }
        }
    }

    pub fn hash64(&self, data: &[u8]) -> u64 {
        xxh3::hash64_with_seed(data, self.seed)
    }
}
