//! Record Framing Codec
//!
//! Block-structured record stream in the leveldb log layout. The stream is
//! cut into 32 KiB blocks; each record is stored as one or more chunks that
//! never cross a block boundary.
//!
//! ## Chunk format
//!
//! ```text
//! +-----------+------------+------+-----------------+
//! | crc (4B)  | length (2B)| type | payload (length)|
//! +-----------+------------+------+-----------------+
//! ```
//!
//! - crc: masked CRC32 over the type byte and the payload, little-endian
//! - type: FULL, FIRST, MIDDLE, LAST; zero marks block padding
//!
//! A block tail shorter than a header is zero-filled. Padding a block lets
//! independently written appends line up so the concatenation still reads
//! back record by record.

/// Block size (32 KiB)
pub const BLOCK_SIZE: usize = 32 * 1024;
/// Chunk header: crc (4) + length (2) + type (1)
pub const HEADER_SIZE: usize = 7;

pub const RECORD_TYPE_NONE: u8 = 0;
pub const RECORD_TYPE_FULL: u8 = 1;
pub const RECORD_TYPE_FIRST: u8 = 2;
pub const RECORD_TYPE_MIDDLE: u8 = 3;
pub const RECORD_TYPE_LAST: u8 = 4;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Errors while decoding a record stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Checksum mismatch or broken chunk sequence
    Corruption(String),
    /// Stream ended inside a record
    Truncated(String),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Corruption(msg) => write!(f, "Record corruption: {}", msg),
            RecordError::Truncated(msg) => write!(f, "Record stream truncated: {}", msg),
        }
    }
}

impl std::error::Error for RecordError {}

fn mask_crc(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

fn chunk_crc(record_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(payload);
    mask_crc(hasher.finalize())
}

/// Stateful encoder. Tracks the position inside the current block so that
/// output produced across separate calls (and checkpoints) stays aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordsWriter {
    block_position: usize,
}

impl RecordsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore an encoder that stopped at `block_position` in its block
    pub fn with_position(block_position: usize) -> Self {
        debug_assert!(block_position < BLOCK_SIZE);
        RecordsWriter {
            block_position: block_position % BLOCK_SIZE,
        }
    }

    pub fn block_position(&self) -> usize {
        self.block_position
    }

    /// Append the chunks of one record to `out`
    pub fn encode(&mut self, record: &[u8], out: &mut Vec<u8>) {
        let mut remaining = record;
        let mut first = true;

        loop {
            let left = BLOCK_SIZE - self.block_position;
            if left < HEADER_SIZE {
                out.resize(out.len() + left, 0);
                self.block_position = 0;
                continue;
            }

            let available = left - HEADER_SIZE;
            let fragment_len = remaining.len().min(available);
            let last = fragment_len == remaining.len();
            let record_type = match (first, last) {
                (true, true) => RECORD_TYPE_FULL,
                (true, false) => RECORD_TYPE_FIRST,
                (false, true) => RECORD_TYPE_LAST,
                (false, false) => RECORD_TYPE_MIDDLE,
            };

            let (fragment, rest) = remaining.split_at(fragment_len);
            self.emit(record_type, fragment, out);
            remaining = rest;
            first = false;

            if last {
                break;
            }
        }
    }

    /// Zero-fill to the next block boundary; no-op when already aligned
    pub fn pad_block(&mut self, out: &mut Vec<u8>) {
        if self.block_position == 0 {
            return;
        }
        out.resize(out.len() + BLOCK_SIZE - self.block_position, 0);
        self.block_position = 0;
    }

    fn emit(&mut self, record_type: u8, fragment: &[u8], out: &mut Vec<u8>) {
        debug_assert!(fragment.len() <= u16::MAX as usize);
        debug_assert!(self.block_position + HEADER_SIZE + fragment.len() <= BLOCK_SIZE);

        out.extend_from_slice(&chunk_crc(record_type, fragment).to_le_bytes());
        out.extend_from_slice(&(fragment.len() as u16).to_le_bytes());
        out.push(record_type);
        out.extend_from_slice(fragment);

        self.block_position += HEADER_SIZE + fragment.len();
        if self.block_position == BLOCK_SIZE {
            self.block_position = 0;
        }
    }
}

/// Encode records into a fresh stream, padded to a block boundary
pub fn encode_all<'a, I>(records: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut writer = RecordsWriter::new();
    let mut out = Vec::new();
    for record in records {
        writer.encode(record, &mut out);
    }
    writer.pad_block(&mut out);
    out
}

/// Iterator over the records of an encoded stream. Stops after the first
/// error.
pub struct RecordsReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordsReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RecordsReader {
            data,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, err: RecordError) -> Option<Result<Vec<u8>, RecordError>> {
        self.failed = true;
        Some(Err(err))
    }

    fn next_record(&mut self) -> Option<Result<Vec<u8>, RecordError>> {
        let mut assembling: Option<Vec<u8>> = None;

        loop {
            if self.pos >= self.data.len() {
                return match assembling {
                    Some(_) => self.fail(RecordError::Truncated(format!(
                        "stream ended at {} inside a fragmented record",
                        self.pos
                    ))),
                    None => None,
                };
            }

            let block_left = BLOCK_SIZE - self.pos % BLOCK_SIZE;
            if block_left < HEADER_SIZE {
                self.pos = (self.pos + block_left).min(self.data.len());
                continue;
            }

            let stream_left = self.data.len() - self.pos;
            if stream_left < HEADER_SIZE {
                let tail = &self.data[self.pos..];
                if assembling.is_none() && tail.iter().all(|&b| b == 0) {
                    self.pos = self.data.len();
                    return None;
                }
                return self.fail(RecordError::Truncated(format!(
                    "partial chunk header at {}",
                    self.pos
                )));
            }

            let header = &self.data[self.pos..self.pos + HEADER_SIZE];
            let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type = header[6];

            if record_type == RECORD_TYPE_NONE {
                if crc == 0 && length == 0 {
                    self.pos = (self.pos + block_left).min(self.data.len());
                    continue;
                }
                return self.fail(RecordError::Corruption(format!(
                    "non-zero padding chunk at {}",
                    self.pos
                )));
            }

            if HEADER_SIZE + length > block_left {
                return self.fail(RecordError::Corruption(format!(
                    "chunk of {} bytes at {} crosses a block boundary",
                    length, self.pos
                )));
            }

            let start = self.pos + HEADER_SIZE;
            if start + length > self.data.len() {
                return self.fail(RecordError::Truncated(format!(
                    "chunk at {} needs {} bytes, {} left",
                    self.pos,
                    length,
                    self.data.len() - start
                )));
            }

            let payload = &self.data[start..start + length];
            if chunk_crc(record_type, payload) != crc {
                return self.fail(RecordError::Corruption(format!(
                    "checksum mismatch at {}",
                    self.pos
                )));
            }
            let chunk_pos = self.pos;
            self.pos = start + length;

            match (record_type, assembling.as_mut()) {
                (RECORD_TYPE_FULL, None) => return Some(Ok(payload.to_vec())),
                (RECORD_TYPE_FIRST, None) => assembling = Some(payload.to_vec()),
                (RECORD_TYPE_MIDDLE, Some(buf)) => buf.extend_from_slice(payload),
                (RECORD_TYPE_LAST, Some(buf)) => {
                    buf.extend_from_slice(payload);
                    return assembling.map(Ok);
                }
                (RECORD_TYPE_FULL | RECORD_TYPE_FIRST, Some(_)) => {
                    return self.fail(RecordError::Corruption(format!(
                        "record starts at {} before the previous one ended",
                        chunk_pos
                    )));
                }
                (RECORD_TYPE_MIDDLE | RECORD_TYPE_LAST, None) => {
                    return self.fail(RecordError::Corruption(format!(
                        "continuation chunk at {} without a first chunk",
                        chunk_pos
                    )));
                }
                (other, _) => {
                    return self.fail(RecordError::Corruption(format!(
                        "unknown chunk type {} at {}",
                        other, chunk_pos
                    )));
                }
            }
        }
    }
}

impl Iterator for RecordsReader<'_> {
    type Item = Result<Vec<u8>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.next_record()
    }
}

/// Decode every record of a stream
pub fn decode_all(data: &[u8]) -> Result<Vec<Vec<u8>>, RecordError> {
    RecordsReader::new(data).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(records: &[&[u8]]) -> Vec<u8> {
        let mut writer = RecordsWriter::new();
        let mut out = Vec::new();
        for r in records {
            writer.encode(r, &mut out);
        }
        out
    }

    #[test]
    fn test_small_records_round_trip() {
        let data = encode(&[b"alpha", b"beta", b"gamma"]);
        assert_eq!(data.len(), 3 * HEADER_SIZE + 14);
        assert_eq!(data[6], RECORD_TYPE_FULL);

        let records = decode_all(&data).unwrap();
        assert_eq!(records, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn test_empty_record_round_trips() {
        let data = encode(&[b"", b"x", b""]);
        let records = decode_all(&data).unwrap();
        assert_eq!(records, vec![Vec::new(), b"x".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_multi_block_record() {
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let data = encode(&[b"head", &big, b"tail"]);
        assert!(data.len() > 3 * BLOCK_SIZE);

        let records = decode_all(&data).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], big);
        assert_eq!(records[2], b"tail");
    }

    #[test]
    fn test_short_block_tail_is_zero_filled() {
        let mut writer = RecordsWriter::new();
        let mut out = Vec::new();
        // Leave exactly 3 bytes in the first block
        writer.encode(&vec![9u8; BLOCK_SIZE - HEADER_SIZE - 3], &mut out);
        assert_eq!(writer.block_position(), BLOCK_SIZE - 3);

        writer.encode(b"next", &mut out);
        assert_eq!(&out[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
        assert_eq!(writer.block_position(), HEADER_SIZE + 4);

        let records = decode_all(&out).unwrap();
        assert_eq!(records[1], b"next");
    }

    #[test]
    fn test_record_filling_block_exactly() {
        let mut writer = RecordsWriter::new();
        let mut out = Vec::new();
        writer.encode(&vec![1u8; BLOCK_SIZE - HEADER_SIZE], &mut out);
        assert_eq!(writer.block_position(), 0);
        assert_eq!(out.len(), BLOCK_SIZE);

        writer.pad_block(&mut out);
        assert_eq!(out.len(), BLOCK_SIZE);
        assert_eq!(decode_all(&out).unwrap().len(), 1);
    }

    #[test]
    fn test_pad_block_idempotent() {
        let mut writer = RecordsWriter::new();
        let mut out = Vec::new();
        writer.pad_block(&mut out);
        assert!(out.is_empty());

        writer.encode(b"record", &mut out);
        writer.pad_block(&mut out);
        assert_eq!(out.len(), BLOCK_SIZE);
        writer.pad_block(&mut out);
        assert_eq!(out.len(), BLOCK_SIZE);
    }

    #[test]
    fn test_padding_yields_no_spurious_records() {
        let data = encode_all([b"only".as_slice()]);
        assert_eq!(data.len(), BLOCK_SIZE);
        assert_eq!(decode_all(&data).unwrap(), vec![b"only".to_vec()]);
    }

    #[test]
    fn test_separately_padded_appends_concatenate() {
        let mut stream = encode_all([b"first".as_slice(), b"second".as_slice()]);
        stream.extend(encode_all([b"third".as_slice()]));

        let records = decode_all(&stream).unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_resumed_writer_continues_block() {
        let mut first = RecordsWriter::new();
        let mut stream = Vec::new();
        first.encode(b"one", &mut stream);

        let mut resumed = RecordsWriter::with_position(first.block_position());
        let mut tail = Vec::new();
        resumed.encode(b"two", &mut tail);
        stream.extend(tail);

        assert_eq!(decode_all(&stream).unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let mut data = encode(&[b"payload"]);
        data[HEADER_SIZE + 2] ^= 0xff;
        assert!(matches!(decode_all(&data), Err(RecordError::Corruption(_))));
    }

    #[test]
    fn test_truncated_fragmented_record() {
        let big = vec![5u8; BLOCK_SIZE * 2];
        let data = encode(&[&big]);
        let cut = &data[..BLOCK_SIZE + 100];
        assert!(matches!(decode_all(cut), Err(RecordError::Truncated(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let data = encode(&[b"abcdefgh"]);
        assert!(matches!(
            decode_all(&data[..data.len() - 2]),
            Err(RecordError::Truncated(_))
        ));
    }

    #[test]
    fn test_orphan_continuation_is_corruption() {
        let big = vec![3u8; BLOCK_SIZE + 10];
        let data = encode(&[&big]);
        // Second block starts with the LAST chunk
        assert!(matches!(
            decode_all(&data[BLOCK_SIZE..]),
            Err(RecordError::Corruption(_))
        ));
    }

    #[test]
    fn test_reader_stops_after_error() {
        let mut data = encode(&[b"a", b"b"]);
        data[HEADER_SIZE] ^= 0x01;
        let mut reader = RecordsReader::new(&data);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
