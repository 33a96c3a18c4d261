use std::collections::BTreeMap;
use std::path::Path;

use failure::Error;
use log::debug;
use rocksdb::{DBCompressionType, Options, DB};

use crate::cache::codec::encode_message;
use crate::cache::common::*;

/// Build-time posting store. Keys are phrase bytes plus langfield; values
/// are raw 64-bit grids in insertion order. Reads do a full scan over the
/// key space, which is fine because this back-end only exists while an
/// index is being built; `pack` turns it into the on-disk form queries
/// actually use.
#[derive(Debug, Default)]
pub struct MemoryCache {
    cache: BTreeMap<Vec<u8>, Vec<u64>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache { cache: BTreeMap::new() }
    }

    /// Replaces (or with `append`, extends) the grids stored for a phrase.
    pub fn set(&mut self, phrase: &str, values: &[u64], langfield: u128, append: bool) {
        let mut key = phrase.as_bytes().to_vec();
        add_langfield(&mut key, langfield);

        let entry = self.cache.entry(key).or_insert_with(Vec::new);
        if !append {
            entry.clear();
        }
        entry.extend_from_slice(values);
    }

    /// Grids for an exact phrase + langfield key, sorted descending.
    pub fn get(&self, phrase: &str, langfield: u128) -> Vec<u64> {
        let mut key = phrase.as_bytes().to_vec();
        add_langfield(&mut key, langfield);

        let mut array = self.cache.get(&key).cloned().unwrap_or_default();
        array.sort_unstable_by(|a, b| b.cmp(a));
        array
    }

    /// Grids for every key whose phrase component matches, with the
    /// language boost applied per key, merged and sorted descending.
    pub fn get_matching(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
    ) -> Vec<u64> {
        let mut search = phrase.as_bytes().to_vec();
        if prefix == PrefixMatch::Disabled {
            search.push(LANGFIELD_SEPARATOR);
        }

        let mut array: Vec<u64> = Vec::new();
        for (key, values) in &self.cache {
            if !key.starts_with(&search[..]) {
                continue;
            }
            if prefix == PrefixMatch::WordBoundary {
                match key.get(search.len()) {
                    Some(&next) if next == LANGFIELD_SEPARATOR || next == b' ' => {}
                    _ => continue,
                }
            }

            if extract_langfield(key) & langfield != 0 {
                array.extend(values.iter().map(|grid| grid | LANGUAGE_MATCH_BOOST));
            } else {
                array.extend_from_slice(values);
            }
        }
        array.sort_unstable_by(|a, b| b.cmp(a));
        array.dedup();
        array.truncate(max_results);
        array
    }

    /// Every (phrase, langfield) pair in the store.
    pub fn list(&self) -> Vec<(String, u128)> {
        self.cache
            .keys()
            .map(|key| {
                (String::from_utf8_lossy(extract_phrase(key)).into_owned(), extract_langfield(key))
            })
            .collect()
    }

    /// Writes the store to disk in its query-time form: every entry
    /// delta-encoded, plus the T1/T2 prefix memos that let autocomplete
    /// scans run off a single bounded read.
    pub fn pack<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Lz4hc);
        opts.set_disable_auto_compactions(true);
        let db = DB::open(&opts, path.as_ref())?;

        let mut memoized_prefixes: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();

        for (key, values) in &self.cache {
            if values.is_empty() {
                continue;
            }
            let mut varr = values.clone();
            varr.sort_unstable_by(|a, b| b.cmp(a));
            db.put(key, &encode_message(&varr))?;

            let phrase_length = extract_phrase(key).len();
            if phrase_length < MEMO_PREFIX_LENGTH_T1 {
                // the whole key is shorter than the memo prefix; index it verbatim
                let mut prefix_t1 = b"=1".to_vec();
                prefix_t1.extend_from_slice(key);
                memoized_prefixes.entry(prefix_t1).or_insert_with(Vec::new).extend_from_slice(&varr);
            } else {
                let langfield = extract_langfield(key);

                let mut prefix_t1 = b"=1".to_vec();
                prefix_t1.extend_from_slice(&key[..MEMO_PREFIX_LENGTH_T1]);
                add_langfield(&mut prefix_t1, langfield);
                memoized_prefixes.entry(prefix_t1).or_insert_with(Vec::new).extend_from_slice(&varr);

                let mut prefix_t2 = b"=2".to_vec();
                if phrase_length < MEMO_PREFIX_LENGTH_T2 {
                    prefix_t2.extend_from_slice(key);
                } else {
                    prefix_t2.extend_from_slice(&key[..MEMO_PREFIX_LENGTH_T2]);
                    add_langfield(&mut prefix_t2, langfield);
                }
                memoized_prefixes.entry(prefix_t2).or_insert_with(Vec::new).extend_from_slice(&varr);
            }
        }

        debug!(
            "packing {} phrases and {} prefix memos to {:?}",
            self.cache.len(),
            memoized_prefixes.len(),
            path.as_ref()
        );

        for (key, mut values) in memoized_prefixes {
            values.sort_unstable_by(|a, b| b.cmp(a));
            // popular prefixes lose their tail; memo readers only ever
            // consume up to this many anyway
            values.truncate(PREFIX_MAX_GRID_LENGTH);
            db.put(&key, &encode_message(&values))?;
        }

        db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }
}
