use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use failure::Error;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

/// One-to-many map between positions in a lexicographically-sorted
/// vocabulary, capturing which terms normalize to which canonical forms
/// so grid data only has to be stored for the canonical ones.
///
/// Keys are stored big-endian so the engine's default byte order is
/// numeric order.
pub struct NormalizationCache {
    db: DB,
}

impl NormalizationCache {
    pub fn new<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = if read_only {
            DB::open_for_read_only(&opts, path.as_ref(), false)?
        } else {
            DB::open(&opts, path.as_ref())?
        };
        Ok(NormalizationCache { db })
    }

    fn key_bytes(id: u32) -> [u8; 4] {
        let mut key = [0u8; 4];
        BigEndian::write_u32(&mut key, id);
        key
    }

    fn decode_values(message: &[u8]) -> Vec<u32> {
        message.chunks_exact(4).map(LittleEndian::read_u32).collect()
    }

    /// Canonical ids for a term id, if any are recorded.
    pub fn get(&self, id: u32) -> Result<Option<Vec<u32>>, Error> {
        match self.db.get(&Self::key_bytes(id))? {
            Some(message) if message.len() >= 4 => Ok(Some(Self::decode_values(&message))),
            _ => Ok(None),
        }
    }

    /// Canonical ids recorded for terms in `[start_id, start_id + count)`
    /// whose canonical form falls outside that range. Scans at most
    /// `scan_max` entries. `return_max` bounds how many ids one entry may
    /// contribute; the scan itself keeps going, so later entries can
    /// still add to the result.
    pub fn get_prefix_range(
        &self,
        start_id: u32,
        count: u32,
        scan_max: u32,
        return_max: u32,
    ) -> Result<Vec<u32>, Error> {
        let ceiling = start_id.saturating_add(count);
        let seek = Self::key_bytes(start_id);

        let mut out: Vec<u32> = Vec::new();
        let mut scanned: u32 = 0;
        for (key, value) in self.db.iterator(IteratorMode::From(&seek, Direction::Forward)) {
            if key.len() < 4 {
                continue;
            }
            if BigEndian::read_u32(&key) >= ceiling {
                break;
            }
            for val in Self::decode_values(&value) {
                if val < start_id || val >= ceiling {
                    out.push(val);
                    if out.len() as u32 >= return_max {
                        break;
                    }
                }
            }
            scanned += 1;
            if scanned >= scan_max {
                break;
            }
        }
        Ok(out)
    }

    /// The entire mapping, in key order.
    pub fn get_all(&self) -> Result<Vec<(u32, Vec<u32>)>, Error> {
        let mut out = Vec::new();
        for (key, value) in self.db.iterator(IteratorMode::Start) {
            if key.len() < 4 {
                continue;
            }
            out.push((BigEndian::read_u32(&key), Self::decode_values(&value)));
        }
        Ok(out)
    }

    /// Atomically writes a set of `(term, canonical ids)` rows.
    pub fn write_batch(&self, items: &[(u32, Vec<u32>)]) -> Result<(), Error> {
        let mut batch = WriteBatch::default();
        for (id, values) in items {
            let mut message = Vec::with_capacity(values.len() * 4);
            for value in values {
                let mut encoded = [0u8; 4];
                LittleEndian::write_u32(&mut encoded, *value);
                message.extend_from_slice(&encoded);
            }
            batch.put(&Self::key_bytes(*id), &message)?;
        }
        self.db.write(batch)?;
        Ok(())
    }
}
