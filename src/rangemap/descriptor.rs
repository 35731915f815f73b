use crate::error::{Error, Result};
use crate::record::{Key, KeyPart};
use serde::{Deserialize, Serialize};

/// First key part of every row the range map owns.
pub const RESERVED_NAMESPACE: &str = "GEN";

/// Fixed-width decimal so generation order and lexicographic order agree.
fn generation_text(generation: u32) -> String {
    format!("{:010}", generation)
}

/// Root of the reserved namespace.
pub fn namespace_key() -> Key {
    Key::new(vec![KeyPart::Text(RESERVED_NAMESPACE.to_string())])
}

/// The generation-count metadata row: the namespace root itself.
pub fn metadata_key() -> Key {
    namespace_key()
}

/// Prefix under which every descriptor of one generation sorts.
pub fn generation_prefix(generation: u32) -> Key {
    namespace_key().child(KeyPart::Text(generation_text(generation)))
}

pub fn is_reserved(key: &Key) -> bool {
    namespace_key().is_prefix_of(key)
}

/// Where a flushed segment lives and how recently it was registered.
/// `ordinal` breaks ties inside a generation: higher means registered later,
/// which means newer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLocation {
    pub addr: u64,
    pub len: u64,
    pub ordinal: u64,
}

impl SegmentLocation {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::Corruption(format!("cannot encode segment location: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<SegmentLocation> {
        let location: SegmentLocation = bincode::deserialize(bytes)
            .map_err(|e| Error::Corruption(format!("cannot decode segment location: {}", e)))?;
        if location.addr == 0 {
            return Err(Error::Corruption(
                "segment location has address zero".into(),
            ));
        }
        Ok(location)
    }
}

/// Decoded view of a descriptor's storage key:
/// `GEN/<generation>/<lowKey>/<highKey>`.
///
/// A bound may itself be another descriptor's storage key (a range describing
/// a range); containment tests unwrap such bounds down to literal keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKey {
    generation: u32,
    low: Key,
    high: Key,
}

impl RangeKey {
    pub fn new(generation: u32, low: Key, high: Key) -> Result<RangeKey> {
        if low > high {
            return Err(Error::Corruption(format!(
                "descriptor range is inverted: {} > {}",
                low, high
            )));
        }
        Ok(RangeKey { generation, low, high })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn low(&self) -> &Key {
        &self.low
    }

    pub fn high(&self) -> &Key {
        &self.high
    }

    /// The key this descriptor is stored under.
    pub fn storage_key(&self) -> Key {
        Key::new(vec![
            KeyPart::Text(RESERVED_NAMESPACE.to_string()),
            KeyPart::Text(generation_text(self.generation)),
            KeyPart::RawBytes(self.low.encode()),
            KeyPart::RawBytes(self.high.encode()),
        ])
    }

    /// Inverse of [`storage_key`](Self::storage_key). The caller has already
    /// ruled out the metadata row; anything else malformed under the reserved
    /// namespace is corruption.
    pub fn parse(key: &Key) -> Result<RangeKey> {
        let malformed = || Error::Corruption(format!("malformed descriptor key {}", key));
        let parts = key.parts();
        if parts.len() != 4 {
            return Err(malformed());
        }
        match (&parts[0], &parts[1], &parts[2], &parts[3]) {
            (
                KeyPart::Text(ns),
                KeyPart::Text(gen),
                KeyPart::RawBytes(low),
                KeyPart::RawBytes(high),
            ) if ns == RESERVED_NAMESPACE => {
                let generation: u32 = gen.parse().map_err(|_| malformed())?;
                RangeKey::new(generation, Key::decode(low)?, Key::decode(high)?)
            }
            _ => Err(malformed()),
        }
    }

    /// Literal containment: `low <= k <= high` without unwrapping.
    pub fn directly_contains(&self, key: &Key) -> bool {
        self.low <= *key && *key <= self.high
    }

    /// Containment after unwrapping range-of-ranges indirection: a bound that
    /// is itself a descriptor key is replaced by that descriptor's own bound
    /// on the same side, repeatedly, until a literal key remains.
    pub fn eventually_contains(&self, key: &Key) -> bool {
        self.resolved_low() <= *key && *key <= self.resolved_high()
    }

    /// Lowest literal key transitively covered.
    pub fn resolved_low(&self) -> Key {
        let mut bound = self.low.clone();
        while let Ok(inner) = RangeKey::parse(&bound) {
            bound = inner.low;
        }
        bound
    }

    /// Highest literal key transitively covered.
    pub fn resolved_high(&self) -> Key {
        let mut bound = self.high.clone();
        while let Ok(inner) = RangeKey::parse(&bound) {
            bound = inner.high;
        }
        bound
    }
}

impl std::fmt::Display for RangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gen {} [{} .. {}]",
            self.generation, self.low, self.high
        )
    }
}
