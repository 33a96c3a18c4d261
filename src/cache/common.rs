use core::cmp::{Ordering, Reverse};
use std::sync::Arc;

use failure::Fail;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::cache::memory::MemoryCache;
use crate::cache::rocks::RocksDbCache;

/// The high bit of a packed grid. OR'd onto postings whose key langfield
/// intersects the query langfield, so that a descending sort puts
/// language-matched grids first.
pub const LANGUAGE_MATCH_BOOST: u64 = 1 << 63;

/// Sentinel langfield meaning "this key applies to every language".
/// Encoded on disk as a bare separator with no trailing bytes.
pub const ALL_LANGUAGES: u128 = !0;

pub const LANGFIELD_SEPARATOR: u8 = b'|';

/// Language ids above this don't fit the 128-bit langfield and are ignored.
pub const MAX_LANG: u32 = 127;

/// The max number of contexts to return from coalesce.
pub const MAX_CONTEXTS: usize = 40;

pub const MEMO_PREFIX_LENGTH_T1: usize = 3;
pub const MEMO_PREFIX_LENGTH_T2: usize = 6;

/// Prefix memos are truncated to this many grids at pack time, so prefix
/// scans are bounded no matter how popular the prefix is.
pub const PREFIX_MAX_GRID_LENGTH: usize = 500_000;

#[derive(Serialize, Deserialize, Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum PrefixMatch {
    Disabled,
    Enabled,
    WordBoundary,
}

/// Appends the langfield separator and the langfield itself to a key.
///
/// The langfield is written as the little-endian bytes of the u128, cut
/// after the highest non-zero byte. The all-languages sentinel is written
/// as the bare separator.
pub fn add_langfield(key: &mut Vec<u8>, langfield: u128) {
    key.push(LANGFIELD_SEPARATOR);
    if langfield != ALL_LANGUAGES {
        let bytes = langfield.to_le_bytes();
        let trimmed = 16 - bytes.iter().rev().take_while(|byte| **byte == 0).count();
        let length = std::cmp::max(trimmed, 1);
        key.extend_from_slice(&bytes[..length]);
    }
}

/// Inverse of `add_langfield`: pulls the langfield back off a stored key.
/// A key that ends right at the separator is the all-languages shorthand.
pub fn extract_langfield(key: &[u8]) -> u128 {
    let start = match key.iter().position(|byte| *byte == LANGFIELD_SEPARATOR) {
        Some(pos) => pos + 1,
        None => return ALL_LANGUAGES,
    };
    let partial = &key[start..];
    if partial.is_empty() {
        return ALL_LANGUAGES;
    }

    let mut full = [0u8; 16];
    let length = std::cmp::min(partial.len(), 16);
    full[..length].copy_from_slice(&partial[..length]);
    u128::from_le_bytes(full)
}

/// The phrase portion of a stored key (everything before the separator).
pub fn extract_phrase(key: &[u8]) -> &[u8] {
    match key.iter().position(|byte| *byte == LANGFIELD_SEPARATOR) {
        Some(pos) => &key[..pos],
        None => key,
    }
}

pub fn langarray_to_langfield(langs: &[u32]) -> u128 {
    let mut out: u128 = 0;
    for lang in langs {
        if *lang > MAX_LANG {
            continue;
        }
        out |= 1 << *lang;
    }
    out
}

pub fn langfield_to_langarray(langfield: u128) -> Vec<u32> {
    (0..=MAX_LANG).filter(|lang| langfield & (1 << lang) != 0).collect()
}

#[inline]
pub fn relev_float_to_int(relev: f64) -> u8 {
    if relev == 0.4 {
        0
    } else if relev == 0.6 {
        1
    } else if relev == 0.8 {
        2
    } else {
        3
    }
}

#[inline]
pub fn relev_int_to_float(relev: u8) -> f64 {
    match relev {
        0 => 0.4,
        1 => 0.6,
        2 => 0.8,
        _ => 1.,
    }
}

/// One decoded grid: the fields that were packed into the 64-bit posting.
#[derive(Serialize, Deserialize, Debug, PartialOrd, PartialEq, Clone)]
pub struct GridEntry {
    pub relev: f64,
    pub score: u16,
    pub x: u16,
    pub y: u16,
    // this is truncated to 20 bits
    pub id: u32,
}

/// A grid plus the language-match flag carried in bit 63.
#[derive(Serialize, Deserialize, Debug, PartialOrd, PartialEq, Clone)]
pub struct MatchEntry {
    pub grid_entry: GridEntry,
    pub matches_language: bool,
}

/// A grid bound to its subquery and scored against the request.
#[derive(Serialize, Deserialize, Debug, PartialOrd, PartialEq, Clone)]
pub struct CoalesceEntry {
    pub grid_entry: GridEntry,
    pub matches_language: bool,
    pub idx: u16,
    pub tmp_id: u32,
    pub mask: u32,
    pub distance: f64,
    pub scoredist: f64,
}

/// A candidate result: one primary cover plus any spatially stacked
/// ancestors from lower-zoom indexes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoalesceContext {
    pub mask: u32,
    pub relev: f64,
    pub entries: Vec<CoalesceEntry>,
}

impl CoalesceContext {
    #[inline(always)]
    fn sort_key(&self) -> (OrderedFloat<f64>, OrderedFloat<f64>, u16, u32, u16, u16) {
        (
            OrderedFloat(self.relev),
            OrderedFloat(self.entries[0].scoredist),
            self.entries[0].idx,
            self.entries[0].grid_entry.id,
            self.entries[0].grid_entry.x,
            self.entries[0].grid_entry.y,
        )
    }
}

impl Ord for CoalesceContext {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
impl PartialOrd for CoalesceContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for CoalesceContext {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for CoalesceContext {}

/// Sorts contexts best-first: relev, then head scoredist, idx, id, with
/// x/y as final tiebreakers so output order is deterministic.
pub fn sort_contexts(contexts: &mut Vec<CoalesceContext>) {
    contexts.sort_by_key(|context| Reverse(context.sort_key()));
}

/// Shared handle on a posting store. Coalesce jobs clone these into the
/// worker, which keeps the store alive until the completion callback has
/// returned.
#[derive(Debug, Clone)]
pub enum CacheRef {
    Memory(Arc<MemoryCache>),
    RocksDb(Arc<RocksDbCache>),
}

/// One phrase match contributed by the upstream tokenizer.
#[derive(Debug, Clone)]
pub struct PhrasematchSubquery {
    pub cache: CacheRef,
    pub weight: f64,
    pub phrase: String,
    pub prefix: PrefixMatch,
    pub idx: u16,
    pub zoom: u16,
    pub mask: u32,
    pub langfield: u128,
}

/// Request problems reported synchronously, before any worker runs.
#[derive(Debug, Fail)]
pub enum InputError {
    #[fail(display = "expected a nonempty stack of phrasematch subqueries")]
    EmptyStack,
    #[fail(display = "encountered invalid phrase")]
    EmptyPhrase,
    #[fail(display = "weight must be between 0 and 1, got {}", weight)]
    InvalidWeight { weight: f64 },
    #[fail(display = "radius must be a finite number that fits in uint32, got {}", radius)]
    InvalidRadius { radius: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceOpts {
    /// Proximity fall-off radius in miles.
    pub radius: f64,
    /// `[z, x, y]` of the tile containing the proximity point.
    pub centerzxy: Option<[u32; 3]>,
    /// `[z, minx, miny, maxx, maxy]` tile cover of the requested bbox.
    pub bboxzxy: Option<[u32; 5]>,
}

impl Default for CoalesceOpts {
    fn default() -> Self {
        CoalesceOpts { radius: 40., centerzxy: None, bboxzxy: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn langfield_key_roundtrip() {
        let mut key = b"main st".to_vec();
        add_langfield(&mut key, 1 << 10);
        assert_eq!(&key[..8], b"main st|");
        assert_eq!(extract_phrase(&key), b"main st");
        assert_eq!(extract_langfield(&key), 1 << 10);

        let mut key = b"main st".to_vec();
        add_langfield(&mut key, (1 << 100) | 1);
        assert_eq!(key.len(), "main st".len() + 1 + 13, "trimmed after highest non-zero byte");
        assert_eq!(extract_langfield(&key), (1 << 100) | 1);
    }

    #[test]
    fn langfield_all_languages_shorthand() {
        let mut key = b"abc".to_vec();
        add_langfield(&mut key, ALL_LANGUAGES);
        assert_eq!(key, b"abc|", "sentinel stores no trailing bytes");
        assert_eq!(extract_langfield(&key), ALL_LANGUAGES);
    }

    #[test]
    fn langfield_zero_is_not_all_languages() {
        let mut key = b"abc".to_vec();
        add_langfield(&mut key, 0);
        assert_eq!(key, b"abc|\0");
        assert_eq!(extract_langfield(&key), 0);
    }

    #[test]
    fn langarray_conversions() {
        assert_eq!(langarray_to_langfield(&[0, 2]), 0b101);
        assert_eq!(langarray_to_langfield(&[5, 500]), 1 << 5, "out-of-range ids are ignored");
        assert_eq!(langfield_to_langarray(0b101), vec![0, 2]);
        assert_eq!(langfield_to_langarray(ALL_LANGUAGES).len(), 128);
    }

    #[test]
    fn relev_bucket_roundtrip() {
        for bucket in 0..4 {
            assert_eq!(relev_float_to_int(relev_int_to_float(bucket)), bucket);
        }
    }
}
