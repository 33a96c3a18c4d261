use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use failure::{Error, Fail};
use rocksdb::{Direction, IteratorMode, Options, DB};

use crate::cache::codec::{
    decode_message, decode_message_boosted, decode_message_in_bbox, DeltaCursor,
};
use crate::cache::common::*;

#[derive(Debug, Fail)]
pub enum StoreError {
    #[fail(display = "rocksdb file is already loaded read-only; unload first")]
    PackIntoSelf,
}

/// Query-time posting store: a read-only rocksdb of delta-encoded grid
/// messages plus the prefix memos written at pack time.
#[derive(Debug)]
pub struct RocksDbCache {
    db: DB,
    path: PathBuf,
}

impl RocksDbCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let opts = Options::default();
        let db = DB::open_for_read_only(&opts, &path, false)?;
        Ok(RocksDbCache { db, path })
    }

    /// Grids for an exact phrase + langfield key, sorted descending.
    /// A missing key is an empty result, not an error.
    pub fn get(&self, phrase: &str, langfield: u128) -> Result<Vec<u64>, Error> {
        let mut key = phrase.as_bytes().to_vec();
        add_langfield(&mut key, langfield);

        let mut array: Vec<u64> = Vec::new();
        if let Some(message) = self.db.get(&key)? {
            decode_message(&message, &mut array, std::usize::MAX)?;
        }
        Ok(array)
    }

    /// Collects the value blobs for every key matching the phrase under
    /// the given prefix mode, tagged with whether that key's langfield
    /// intersects the query's.
    ///
    /// Autocomplete lookups with a short effective prefix are redirected
    /// to the `=1`/`=2` memo keys, turning a potentially huge range scan
    /// into a bounded one. Word-boundary lookups count one extra byte so
    /// a memo can never hide the boundary character they need to check.
    fn fetch_messages(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
    ) -> Vec<(Box<[u8]>, bool)> {
        let mut search = phrase.as_bytes().to_vec();
        if prefix == PrefixMatch::Disabled {
            search.push(LANGFIELD_SEPARATOR);
        } else {
            let mut effective = search.len();
            if prefix == PrefixMatch::WordBoundary {
                effective += 1;
            }
            if effective <= MEMO_PREFIX_LENGTH_T1 {
                let mut memo = b"=1".to_vec();
                memo.extend_from_slice(&search[..search.len().min(MEMO_PREFIX_LENGTH_T1)]);
                search = memo;
            } else if effective <= MEMO_PREFIX_LENGTH_T2 {
                let mut memo = b"=2".to_vec();
                memo.extend_from_slice(&search[..search.len().min(MEMO_PREFIX_LENGTH_T2)]);
                search = memo;
            }
        }

        let mut messages: Vec<(Box<[u8]>, bool)> = Vec::new();
        for (key, value) in self.db.iterator(IteratorMode::From(&search, Direction::Forward)) {
            if !key.starts_with(&search[..]) {
                break;
            }
            if prefix == PrefixMatch::WordBoundary {
                // safe to probe one byte past the prefix: stored keys
                // always carry at least the langfield separator
                match key.get(search.len()) {
                    Some(&next) if next == LANGFIELD_SEPARATOR || next == b' ' => {}
                    _ => continue,
                }
            }
            let matches_language = extract_langfield(&key) & langfield != 0;
            messages.push((value, matches_language));
        }
        messages
    }

    /// Up to `max_results` grids across all matching keys, sorted
    /// descending by the language-boosted value, exact duplicates
    /// suppressed.
    pub fn get_matching(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
    ) -> Result<Vec<u64>, Error> {
        let messages = self.fetch_messages(phrase, prefix, langfield);

        let mut array: Vec<u64> = Vec::new();

        // exact matches in translationless indexes usually hit exactly
        // one message; skip the queue for those
        if messages.len() == 1 {
            let (message, matches_language) = &messages[0];
            if *matches_language {
                decode_message_boosted(message, &mut array, max_results)?;
            } else {
                decode_message(message, &mut array, max_results)?;
            }
            return Ok(array);
        }

        let mut cursors: Vec<DeltaCursor> = Vec::with_capacity(messages.len());
        let mut heap: BinaryHeap<(u64, usize)> = BinaryHeap::with_capacity(messages.len());
        for (message, matches_language) in &messages {
            if let Some(cursor) = DeltaCursor::new(message, *matches_language)? {
                heap.push((cursor.sort_value(), cursors.len()));
                cursors.push(cursor);
            }
        }

        while array.len() < max_results {
            let (value, idx) = match heap.pop() {
                Some(top) => top,
                None => break,
            };
            if array.last() != Some(&value) {
                array.push(value);
            }
            if cursors[idx].advance()? {
                heap.push((cursors[idx].sort_value(), idx));
            }
        }

        Ok(array)
    }

    /// `get_matching`, but grids outside the bbox are dropped before the
    /// sort. Decodes every matching message eagerly; the address/number
    /// case that uses this prefers pruning the sort input over lazy
    /// decoding.
    pub fn get_matching_in_bbox(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
        bbox: [u16; 4],
    ) -> Result<Vec<u64>, Error> {
        let mut array: Vec<u64> = Vec::new();
        for (message, matches_language) in self.fetch_messages(phrase, prefix, langfield) {
            let boost = if matches_language { LANGUAGE_MATCH_BOOST } else { 0 };
            decode_message_in_bbox(&message, &mut array, boost, bbox)?;
        }
        array.sort_unstable_by(|a, b| b.cmp(a));
        array.dedup();
        array.truncate(max_results);
        Ok(array)
    }

    /// Every (phrase, langfield) pair in the store, memo keys excluded.
    pub fn list(&self) -> Vec<(String, u128)> {
        let mut out = Vec::new();
        for (key, _) in self.db.iterator(IteratorMode::Start) {
            if key.first() == Some(&b'=') {
                continue;
            }
            out.push((
                String::from_utf8_lossy(extract_phrase(&key)).into_owned(),
                extract_langfield(&key),
            ));
        }
        out
    }

    /// Copies this store into a fresh rocksdb at `path`. Packing a store
    /// into its own path is refused.
    pub fn pack<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        if path.as_ref() == self.path {
            return Err(StoreError::PackIntoSelf.into());
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let clone = DB::open(&opts, path.as_ref())?;
        for (key, value) in self.db.iterator(IteratorMode::Start) {
            clone.put(&key, &value)?;
        }
        Ok(())
    }
}
