use failure::Fail;
use integer_encoding::VarInt;

use crate::cache::common::*;

/// Tag for the single message field: field number 1, length-delimited.
/// Stored values are wire-compatible with a protobuf message holding one
/// packed repeated uint64 field.
const GRID_FIELD_TAG: u8 = 0x0a;

#[derive(Debug, Fail)]
pub enum DecodeError {
    #[fail(display = "truncated grid message")]
    TruncatedMessage,
    #[fail(display = "non-monotone delta in grid message")]
    DeltaOverflow,
    #[fail(display = "unexpected field tag in grid message: {}", tag)]
    UnexpectedField { tag: u8 },
}

/// Packs a grid into its 64-bit form. Fields are masked down to their
/// allotted widths; everything else stays zero.
pub fn encode_grid(entry: &MatchEntry) -> u64 {
    let grid = &entry.grid_entry;
    let mut num = u64::from(grid.id) & ((1 << 20) - 1);
    num |= (u64::from(grid.x) & ((1 << 14) - 1)) << 20;
    num |= (u64::from(grid.y) & ((1 << 14) - 1)) << 34;
    num |= (u64::from(grid.score) & 7) << 48;
    num |= u64::from(relev_float_to_int(grid.relev)) << 51;
    if entry.matches_language {
        num |= LANGUAGE_MATCH_BOOST;
    }
    num
}

/// Unpacks a 64-bit grid. The subquery-derived fields (idx, mask, tmp_id,
/// distance, scoredist) don't live in the packed form and are bound later
/// by coalesce.
pub fn decode_grid(num: u64) -> MatchEntry {
    MatchEntry {
        grid_entry: GridEntry {
            relev: relev_int_to_float(((num >> 51) & 3) as u8),
            score: ((num >> 48) & 7) as u16,
            x: ((num >> 20) & 0x3fff) as u16,
            y: ((num >> 34) & 0x3fff) as u16,
            id: (num & 0xfffff) as u32,
        },
        matches_language: num & LANGUAGE_MATCH_BOOST != 0,
    }
}

/// Delta-encodes a descending-sorted run of grids into a message: the
/// first value is written raw, every later one as `previous - current`.
pub fn encode_message(values: &[u64]) -> Vec<u8> {
    let mut payload: Vec<u8> = Vec::with_capacity(values.len() * 2);
    let mut buf = [0u8; 10];
    let mut lastval: u64 = 0;
    let mut first = true;
    for value in values {
        let stored = if first {
            first = false;
            *value
        } else {
            debug_assert!(*value <= lastval, "input must be sorted descending");
            lastval - *value
        };
        lastval = *value;
        let used = stored.encode_var(&mut buf);
        payload.extend_from_slice(&buf[..used]);
    }

    let mut message = Vec::with_capacity(payload.len() + 6);
    message.push(GRID_FIELD_TAG);
    let used = (payload.len() as u64).encode_var(&mut buf);
    message.extend_from_slice(&buf[..used]);
    message.extend_from_slice(&payload);
    message
}

fn packed_payload(message: &[u8]) -> Result<&[u8], DecodeError> {
    let (tag, rest) = message.split_first().ok_or(DecodeError::TruncatedMessage)?;
    if *tag != GRID_FIELD_TAG {
        return Err(DecodeError::UnexpectedField { tag: *tag });
    }
    let (length, used) = u64::decode_var(rest).ok_or(DecodeError::TruncatedMessage)?;
    rest.get(used..used + length as usize).ok_or(DecodeError::TruncatedMessage)
}

fn decode_with_boost(
    message: &[u8],
    array: &mut Vec<u64>,
    boost: u64,
    max_results: usize,
) -> Result<(), DecodeError> {
    let payload = packed_payload(message)?;
    let mut pos = 0;
    let mut lastval: u64 = 0;
    let mut first = true;
    while pos < payload.len() && array.len() < max_results {
        let (delta, used) = u64::decode_var(&payload[pos..]).ok_or(DecodeError::TruncatedMessage)?;
        pos += used;
        lastval = if first {
            first = false;
            delta
        } else {
            lastval.checked_sub(delta).ok_or(DecodeError::DeltaOverflow)?
        };
        array.push(lastval | boost);
    }
    Ok(())
}

pub fn decode_message(
    message: &[u8],
    array: &mut Vec<u64>,
    max_results: usize,
) -> Result<(), DecodeError> {
    decode_with_boost(message, array, 0, max_results)
}

pub fn decode_message_boosted(
    message: &[u8],
    array: &mut Vec<u64>,
    max_results: usize,
) -> Result<(), DecodeError> {
    decode_with_boost(message, array, LANGUAGE_MATCH_BOOST, max_results)
}

/// Eagerly decodes a whole message, keeping only grids inside the bbox
/// (tile coordinates, inclusive). Trades decode work for a smaller sort
/// in the bbox-filtered matching path.
pub fn decode_message_in_bbox(
    message: &[u8],
    array: &mut Vec<u64>,
    boost: u64,
    bbox: [u16; 4],
) -> Result<(), DecodeError> {
    let payload = packed_payload(message)?;
    let mut pos = 0;
    let mut lastval: u64 = 0;
    let mut first = true;
    while pos < payload.len() {
        let (delta, used) = u64::decode_var(&payload[pos..]).ok_or(DecodeError::TruncatedMessage)?;
        pos += used;
        lastval = if first {
            first = false;
            delta
        } else {
            lastval.checked_sub(delta).ok_or(DecodeError::DeltaOverflow)?
        };
        let x = ((lastval >> 20) & 0x3fff) as u16;
        let y = ((lastval >> 34) & 0x3fff) as u16;
        if x >= bbox[0] && x <= bbox[2] && y >= bbox[1] && y <= bbox[3] {
            array.push(lastval | boost);
        }
    }
    Ok(())
}

/// A lazily-decoded message: steps through the delta stream one value at
/// a time so the k-way merge never materializes whole postings lists.
pub struct DeltaCursor<'a> {
    payload: &'a [u8],
    pos: usize,
    pub lastval: u64,
    pub matches_language: bool,
}

impl<'a> DeltaCursor<'a> {
    /// Opens a cursor positioned on the message's first (raw) value.
    /// Returns None for a message with no values.
    pub fn new(message: &'a [u8], matches_language: bool) -> Result<Option<Self>, DecodeError> {
        let payload = packed_payload(message)?;
        if payload.is_empty() {
            return Ok(None);
        }
        let (first, used) = u64::decode_var(payload).ok_or(DecodeError::TruncatedMessage)?;
        Ok(Some(DeltaCursor { payload, pos: used, lastval: first, matches_language }))
    }

    /// The merge key for the current value: raw value with the language
    /// boost OR'd in when the source message matched the query languages.
    #[inline]
    pub fn sort_value(&self) -> u64 {
        if self.matches_language {
            self.lastval | LANGUAGE_MATCH_BOOST
        } else {
            self.lastval
        }
    }

    /// Steps to the next value; false once the message is exhausted.
    pub fn advance(&mut self) -> Result<bool, DecodeError> {
        if self.pos >= self.payload.len() {
            return Ok(false);
        }
        let (delta, used) =
            u64::decode_var(&self.payload[self.pos..]).ok_or(DecodeError::TruncatedMessage)?;
        self.pos += used;
        self.lastval = self.lastval.checked_sub(delta).ok_or(DecodeError::DeltaOverflow)?;
        Ok(true)
    }
}
