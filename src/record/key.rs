use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Read;

// Variant tags, shared by the ordering and the on-disk encoding.
// Order matters: these determine cross-variant ordering.
const TAG_LONG: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TAG_NESTED: u8 = 0x03;
const TAG_RAW: u8 = 0x04;
const TAG_TIMESTAMP: u8 = 0x05;

/// One component of a composite key.
///
/// Two parts of different variants compare by tag alone, never by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Long(i64),
    Text(String),
    NestedKey(Key),
    RawBytes(Vec<u8>),
    Timestamp(i64),
}

impl KeyPart {
    fn tag(&self) -> u8 {
        match self {
            KeyPart::Long(_) => TAG_LONG,
            KeyPart::Text(_) => TAG_TEXT,
            KeyPart::NestedKey(_) => TAG_NESTED,
            KeyPart::RawBytes(_) => TAG_RAW,
            KeyPart::Timestamp(_) => TAG_TIMESTAMP,
        }
    }

    /// The minimal part strictly greater than this one, if any.
    ///
    /// Returns `None` when the part is saturated (integer maximum), in which
    /// case the caller carries into the preceding part.
    fn successor(&self) -> Option<KeyPart> {
        match self {
            KeyPart::Long(i) => i.checked_add(1).map(KeyPart::Long),
            KeyPart::Text(s) => {
                let mut next = s.clone();
                next.push('\0');
                Some(KeyPart::Text(next))
            }
            KeyPart::NestedKey(k) => {
                // The minimal key above k is k extended with the minimal part.
                Some(KeyPart::NestedKey(k.child(KeyPart::Long(i64::MIN))))
            }
            KeyPart::RawBytes(b) => {
                let mut next = b.clone();
                next.push(0x00);
                Some(KeyPart::RawBytes(next))
            }
            KeyPart::Timestamp(t) => t.checked_add(1).map(KeyPart::Timestamp),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        match self {
            KeyPart::Long(i) | KeyPart::Timestamp(i) => {
                // Sign bit flipped so negatives sort before positives.
                let unsigned = (*i as u64) ^ (1u64 << 63);
                buf.extend_from_slice(&unsigned.to_be_bytes());
            }
            KeyPart::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            KeyPart::NestedKey(k) => {
                let inner = k.encode();
                buf.extend_from_slice(&(inner.len() as u32).to_be_bytes());
                buf.extend_from_slice(&inner);
            }
            KeyPart::RawBytes(b) => {
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<KeyPart> {
        let tag = reader
            .read_u8()
            .map_err(|e| Error::Corruption(format!("truncated key part tag: {}", e)))?;
        match tag {
            TAG_LONG | TAG_TIMESTAMP => {
                let unsigned = reader
                    .read_u64::<BigEndian>()
                    .map_err(|e| Error::Corruption(format!("truncated integer part: {}", e)))?;
                let signed = (unsigned ^ (1u64 << 63)) as i64;
                Ok(if tag == TAG_LONG {
                    KeyPart::Long(signed)
                } else {
                    KeyPart::Timestamp(signed)
                })
            }
            TAG_TEXT => {
                let bytes = read_framed(reader, "text part")?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| Error::Corruption("text part is not valid UTF-8".into()))?;
                Ok(KeyPart::Text(s))
            }
            TAG_NESTED => {
                let inner = read_framed(reader, "nested key part")?;
                Ok(KeyPart::NestedKey(Key::decode(&inner)?))
            }
            TAG_RAW => Ok(KeyPart::RawBytes(read_framed(reader, "raw part")?)),
            other => Err(Error::Corruption(format!("unknown key part tag {:#04x}", other))),
        }
    }
}

fn read_framed<R: Read>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated {} length: {}", what, e)))?;
    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Corruption(format!("truncated {}: {}", what, e)))?;
    Ok(bytes)
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.tag().cmp(&other.tag()) {
            Ordering::Equal => match (self, other) {
                (KeyPart::Long(a), KeyPart::Long(b)) => a.cmp(b),
                (KeyPart::Text(a), KeyPart::Text(b)) => a.cmp(b),
                (KeyPart::NestedKey(a), KeyPart::NestedKey(b)) => a.cmp(b),
                (KeyPart::RawBytes(a), KeyPart::RawBytes(b)) => a.cmp(b),
                (KeyPart::Timestamp(a), KeyPart::Timestamp(b)) => a.cmp(b),
                // Equal tags imply equal variants.
                _ => Ordering::Equal,
            },
            ord => ord,
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Composite key: an immutable ordered sequence of parts.
///
/// Comparison is lexicographic over parts, so a key is always less than any
/// of its proper extensions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(Vec<KeyPart>);

impl Key {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Key(parts)
    }

    /// Single text-part key. Convenient for callers keyed by plain strings.
    pub fn text(s: &str) -> Self {
        Key(vec![KeyPart::Text(s.to_string())])
    }

    /// Single integer-part key.
    pub fn long(i: i64) -> Self {
        Key(vec![KeyPart::Long(i)])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// New key with one more part appended.
    pub fn child(&self, part: KeyPart) -> Key {
        let mut parts = self.0.clone();
        parts.push(part);
        Key(parts)
    }

    /// True when every part of `self` matches the leading parts of `other`.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// The minimal key strictly greater than every key sharing this prefix,
    /// used as an open upper scan bound. Saturated trailing parts carry into
    /// the preceding part; a fully saturated prefix has no finite successor
    /// and yields the unbounded-high sentinel.
    pub fn after_prefix(&self) -> ScanBound {
        let mut parts = self.0.clone();
        while let Some(last) = parts.pop() {
            if let Some(next) = last.successor() {
                parts.push(next);
                return ScanBound::Key(Key(parts));
            }
        }
        ScanBound::Max
    }

    /// Byte-exact encoding: concatenated tag-prefixed parts.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in &self.0 {
            part.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Key> {
        let mut reader = bytes;
        let mut parts = Vec::new();
        while !reader.is_empty() {
            parts.push(KeyPart::decode_from(&mut reader)?);
        }
        Ok(Key(parts))
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(parts: Vec<KeyPart>) -> Self {
        Key(parts)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match part {
                KeyPart::Long(v) => write!(f, "{}", v)?,
                KeyPart::Text(s) => write!(f, "{}", s)?,
                KeyPart::NestedKey(k) => write!(f, "({})", k)?,
                KeyPart::RawBytes(b) => write!(f, "0x{}", hex(b))?,
                KeyPart::Timestamp(t) => write!(f, "@{}", t)?,
            }
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One end of a scan range. `Min`/`Max` are the sentinel "always less/greater
/// than everything" markers, so unbounded scans are expressible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanBound {
    Min,
    Key(Key),
    Max,
}

impl ScanBound {
    /// Orders this bound relative to a concrete key.
    pub fn compare(&self, key: &Key) -> Ordering {
        match self {
            ScanBound::Min => Ordering::Less,
            ScanBound::Key(k) => k.cmp(key),
            ScanBound::Max => Ordering::Greater,
        }
    }
}

/// Inclusive scan range `[low, high]` over keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub low: ScanBound,
    pub high: ScanBound,
}

impl Range {
    pub fn all() -> Self {
        Range { low: ScanBound::Min, high: ScanBound::Max }
    }

    pub fn from_to(low: Key, high: Key) -> Self {
        Range { low: ScanBound::Key(low), high: ScanBound::Key(high) }
    }

    /// All keys sharing the given prefix.
    pub fn prefixed(prefix: &Key) -> Self {
        Range {
            low: ScanBound::Key(prefix.clone()),
            high: prefix.after_prefix(),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.low.compare(key) != Ordering::Greater && self.high.compare(key) != Ordering::Less
    }
}
