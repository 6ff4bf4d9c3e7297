//! State-machine snapshot stream codec.
//!
//! A snapshot is a header followed by the committed rows and the pending
//! staging of in-flight transactions, all little-endian and length-prefixed.
//! Applying a snapshot and then the log tail from the next index must yield
//! the same state as a replica that never restarted, so the format has no
//! freedom of representation: fields are written in a fixed order and rows
//! in ascending key order.

use thiserror::Error;

use crate::types::{Key, TxId, Value};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LSNP";
pub const SNAPSHOT_VERSION: u16 = 1;

/// Errors produced while decoding a snapshot stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot stream ends prematurely")]
    Truncated,
    #[error("snapshot magic bytes do not match")]
    Magic,
    #[error("unsupported snapshot version {0}")]
    Version(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub partition_id: u32,
    pub last_applied_index: u64,
}

/// Uncommitted writes staged by one transaction; `None` is a pending delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTxRecord {
    pub tx_id: TxId,
    pub entries: Vec<(Key, Option<Value>)>,
}

/// Full exportable state of a versioned row store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreContents {
    pub committed: Vec<(Key, Value)>,
    pub pending: Vec<PendingTxRecord>,
}

pub fn encode_snapshot(header: SnapshotHeader, contents: &StoreContents) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&header.partition_id.to_le_bytes());
    buf.extend_from_slice(&header.last_applied_index.to_le_bytes());

    buf.extend_from_slice(&(contents.committed.len() as u64).to_le_bytes());
    for (key, value) in &contents.committed {
        write_entry(&mut buf, key, Some(value));
    }

    buf.extend_from_slice(&(contents.pending.len() as u64).to_le_bytes());
    for record in &contents.pending {
        buf.extend_from_slice(&record.tx_id.ts.to_le_bytes());
        buf.extend_from_slice(&record.tx_id.node.to_le_bytes());
        buf.extend_from_slice(&(record.entries.len() as u64).to_le_bytes());
        for (key, value) in &record.entries {
            write_entry(&mut buf, key, value.as_ref());
        }
    }

    buf
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<(SnapshotHeader, StoreContents), SnapshotError> {
    let mut reader = Reader::new(bytes);

    if reader.take(4)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::Magic);
    }
    let version = reader.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(version));
    }
    let header = SnapshotHeader {
        partition_id: reader.read_u32()?,
        last_applied_index: reader.read_u64()?,
    };

    let committed_count = reader.read_u64()? as usize;
    let mut committed = Vec::with_capacity(committed_count);
    for _ in 0..committed_count {
        let (key, value) = read_entry(&mut reader)?;
        committed.push((key, value.ok_or(SnapshotError::Truncated)?));
    }

    let pending_count = reader.read_u64()? as usize;
    let mut pending = Vec::with_capacity(pending_count);
    for _ in 0..pending_count {
        let tx_id = TxId::new(reader.read_u64()?, reader.read_u64()?);
        let entry_count = reader.read_u64()? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(read_entry(&mut reader)?);
        }
        pending.push(PendingTxRecord { tx_id, entries });
    }

    Ok((header, StoreContents { committed, pending }))
}

fn write_entry(buf: &mut Vec<u8>, key: &Key, value: Option<&Value>) {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    match value {
        Some(value) => {
            buf.push(1);
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        None => buf.push(0),
    }
}

fn read_entry(reader: &mut Reader<'_>) -> Result<(Key, Option<Value>), SnapshotError> {
    let key_len = reader.read_u32()? as usize;
    let key = reader.take(key_len)?.to_vec();
    match reader.read_u8()? {
        0 => Ok((key, None)),
        _ => {
            let value_len = reader.read_u32()? as usize;
            Ok((key, Some(reader.take(value_len)?.to_vec())))
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(SnapshotError::Truncated)?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, SnapshotError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (SnapshotHeader, StoreContents) {
        let header = SnapshotHeader {
            partition_id: 3,
            last_applied_index: 42,
        };
        let contents = StoreContents {
            committed: vec![
                (b"alpha".to_vec(), b"1".to_vec()),
                (b"beta".to_vec(), Vec::new()),
            ],
            pending: vec![PendingTxRecord {
                tx_id: TxId::new(7, 1),
                entries: vec![
                    (b"alpha".to_vec(), Some(b"2".to_vec())),
                    (b"gamma".to_vec(), None),
                ],
            }],
        };
        (header, contents)
    }

    #[test]
    fn round_trip() {
        let (header, contents) = sample();
        let bytes = encode_snapshot(header, &contents);
        let (decoded_header, decoded_contents) = decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_contents, contents);
    }

    #[test]
    fn encoding_is_stable() {
        let (header, contents) = sample();
        assert_eq!(
            encode_snapshot(header, &contents),
            encode_snapshot(header, &contents)
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let (header, contents) = sample();
        let mut bytes = encode_snapshot(header, &contents);
        bytes[0] = b'X';
        assert_eq!(decode_snapshot(&bytes), Err(SnapshotError::Magic));
    }

    #[test]
    fn rejects_truncated_stream() {
        let (header, contents) = sample();
        let bytes = encode_snapshot(header, &contents);
        let cut = &bytes[..bytes.len() - 3];
        assert_eq!(decode_snapshot(cut), Err(SnapshotError::Truncated));
    }
}
