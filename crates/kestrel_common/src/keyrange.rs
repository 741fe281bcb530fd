//! Key ranges: the `[start, end)` byte-prefix intervals that name shards.
//!
//! Shard names are the hex form of their range: `-80`, `80-c0`, `c0-`.
//! An empty side means unbounded. The single-shard spellings `0`, `-`,
//! and `""` all denote the full range.

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Half-open key interval `[start, end)`. Empty `start` is minus infinity,
/// empty `end` is plus infinity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes")]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_hex(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        super::decode_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn decode_hex(s: &str) -> KestrelResult<Vec<u8>> {
    if !s.is_ascii() {
        return Err(KestrelError::InvalidArgument(format!(
            "malformed hex key {s:?}"
        )));
    }
    if s.len() % 2 != 0 {
        return Err(KestrelError::InvalidArgument(format!(
            "odd-length hex key {s:?}"
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| {
                KestrelError::InvalidArgument(format!("malformed hex key {s:?}"))
            })
        })
        .collect()
}

/// Compare a key against a range boundary where empty means plus infinity.
fn key_lt_end(key: &[u8], end: &[u8]) -> bool {
    end.is_empty() || key < end
}

impl KeyRange {
    /// The full range.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Parse a shard name into its range. `0`, `-`, and `""` are the full
    /// range; otherwise `start-end` with hex sides, either side optional.
    pub fn parse(shard: &str) -> KestrelResult<Self> {
        if shard.is_empty() || shard == "0" || shard == "-" {
            return Ok(Self::full());
        }
        let (start, end) = shard.split_once('-').ok_or_else(|| {
            KestrelError::InvalidArgument(format!("malformed shard range {shard:?}"))
        })?;
        let range = KeyRange {
            start: decode_hex(start)?,
            end: decode_hex(end)?,
        };
        if !range.end.is_empty() && !range.start.is_empty() && range.start >= range.end {
            return Err(KestrelError::InvalidArgument(format!(
                "shard range {shard:?} is empty or inverted"
            )));
        }
        Ok(range)
    }

    /// True when the two ranges share any key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        key_lt_end(&self.start, &other.end) && key_lt_end(&other.start, &self.end)
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains(&self, other: &KeyRange) -> bool {
        let start_ok =
            self.start.is_empty() || (!other.start.is_empty() && other.start >= self.start);
        let end_ok = self.end.is_empty() || (!other.end.is_empty() && other.end <= self.end);
        start_ok && end_ok
    }

    /// The shard-name spelling of this range.
    pub fn name(&self) -> String {
        if self.is_full() {
            return "0".to_string();
        }
        format!("{}-{}", encode_hex(&self.start), encode_hex(&self.end))
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// True when two shard sets cover byte-identical key ranges, compared as
/// sorted, concatenation-normalized interval lists. Used to elide
/// key-range filters when source and target shards line up exactly.
pub fn ranges_cover_equal(a: &[KeyRange], b: &[KeyRange]) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(ranges: &[KeyRange]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut v: Vec<(Vec<u8>, Vec<u8>)> = ranges
        .iter()
        .map(|r| (r.start.clone(), r.end.clone()))
        .collect();
    v.sort();
    // Merge adjacent intervals so [-80)+[80-) == full.
    let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(v.len());
    for (start, end) in v {
        match merged.last_mut() {
            Some((_, prev_end)) if *prev_end == start && !prev_end.is_empty() => {
                *prev_end = end;
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_range_spellings() {
        for s in ["", "0", "-"] {
            assert!(KeyRange::parse(s).unwrap().is_full(), "spelling {s:?}");
        }
    }

    #[test]
    fn test_parse_halves() {
        let low = KeyRange::parse("-80").unwrap();
        assert!(low.start.is_empty());
        assert_eq!(low.end, vec![0x80]);

        let high = KeyRange::parse("80-").unwrap();
        assert_eq!(high.start, vec![0x80]);
        assert!(high.end.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_ranges() {
        assert!(KeyRange::parse("80-40").is_err());
        assert!(KeyRange::parse("8").is_err());
        assert!(KeyRange::parse("zz-").is_err());
    }

    #[test]
    fn test_intersects() {
        let full = KeyRange::full();
        let low = KeyRange::parse("-80").unwrap();
        let high = KeyRange::parse("80-").unwrap();
        let mid = KeyRange::parse("40-c0").unwrap();

        assert!(full.intersects(&low));
        assert!(low.intersects(&full));
        assert!(!low.intersects(&high));
        assert!(mid.intersects(&low));
        assert!(mid.intersects(&high));
    }

    #[test]
    fn test_contains() {
        let full = KeyRange::full();
        let low = KeyRange::parse("-80").unwrap();
        let lowquarter = KeyRange::parse("-40").unwrap();
        assert!(full.contains(&low));
        assert!(low.contains(&lowquarter));
        assert!(!lowquarter.contains(&low));
        assert!(!low.contains(&full));
    }

    #[test]
    fn test_name_roundtrip() {
        for s in ["0", "-80", "80-", "40-c0"] {
            let r = KeyRange::parse(s).unwrap();
            assert_eq!(KeyRange::parse(&r.name()).unwrap(), r);
        }
    }

    #[test]
    fn test_ranges_cover_equal_split() {
        let whole = vec![KeyRange::full()];
        let halves = vec![KeyRange::parse("-80").unwrap(), KeyRange::parse("80-").unwrap()];
        let halves_rev = vec![KeyRange::parse("80-").unwrap(), KeyRange::parse("-80").unwrap()];
        assert!(ranges_cover_equal(&whole, &halves));
        assert!(ranges_cover_equal(&halves, &halves_rev));
        assert!(!ranges_cover_equal(&whole, &[KeyRange::parse("-80").unwrap()]));
    }

    #[test]
    fn test_serde_hex_form() {
        let r = KeyRange::parse("40-c0").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"40\""));
        assert!(json.contains("\"c0\""));
        let back: KeyRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
