//! WAL record framing
//!
//! Every record carries a full `Operation` snapshot. The newest record
//! (highest LSN) for an operation ID is authoritative.
//!
//! Record format:
//! ```text
//! +--------+------+--------+-----------------------+--------+
//! | Magic  | LSN  | Length | bincode(Operation)    | CRC32C |
//! | 4B     | 8B   | 4B     | var                   | 4B     |
//! +--------+------+--------+-----------------------+--------+
//! ```

use stowage_common::{Error, Operation, Result};

/// WAL record magic number
pub const WAL_MAGIC: u32 = 0x5357_414C; // "SWAL"

/// Record header size (magic + lsn + length)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Trailer size (CRC32C)
pub const RECORD_TRAILER_SIZE: usize = 4;

/// A single decoded WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Log sequence number, global across partitions
    pub lsn: u64,
    pub op: Operation,
}

impl WalRecord {
    /// Serialize record to bytes
    pub fn encode(lsn: u64, op: &Operation) -> Result<Vec<u8>> {
        let data = bincode::serialize(op).map_err(|e| Error::Serialization(e.to_string()))?;
        let data_len = u32::try_from(data.len())
            .map_err(|_| Error::Serialization(format!("record too large: {} bytes", data.len())))?;

        let total_size = RECORD_HEADER_SIZE + data.len() + RECORD_TRAILER_SIZE;
        let mut buf = Vec::with_capacity(total_size);

        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&lsn.to_le_bytes());
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Parse one record from the front of `data`, returning it and the
    /// number of bytes consumed
    pub fn decode(data: &[u8]) -> std::result::Result<(Self, usize), FrameError> {
        if data.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
            return Err(FrameError::Truncated);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let lsn = u64::from_le_bytes(data[4..12].try_into().unwrap());
        let data_len = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;

        let total_size = RECORD_HEADER_SIZE + data_len + RECORD_TRAILER_SIZE;
        if data.len() < total_size {
            return Err(FrameError::Truncated);
        }

        let stored_crc = u32::from_le_bytes(
            data[RECORD_HEADER_SIZE + data_len..total_size]
                .try_into()
                .unwrap(),
        );
        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + data_len]);
        if computed_crc != stored_crc {
            return Err(FrameError::ChecksumMismatch { lsn });
        }

        let op = bincode::deserialize(&data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len])
            .map_err(|e| FrameError::Decode {
                lsn,
                reason: e.to_string(),
            })?;

        Ok((Self { lsn, op }, total_size))
    }
}

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("record truncated")]
    Truncated,
    #[error("invalid WAL magic {0:#010x}")]
    BadMagic(u32),
    #[error("CRC mismatch in record lsn={lsn}")]
    ChecksumMismatch { lsn: u64 },
    #[error("undecodable record lsn={lsn}: {reason}")]
    Decode { lsn: u64, reason: String },
}

/// All records of a partition image plus the length of its valid prefix
#[derive(Debug, Default)]
pub struct DecodedPartition {
    pub records: Vec<WalRecord>,
    /// Bytes covered by `records`
    pub valid_len: u64,
    /// First decode failure after the valid prefix, if any
    pub tail_error: Option<FrameError>,
}

/// Decode records until the end of the buffer or the first bad frame
pub fn decode_all(data: &[u8]) -> DecodedPartition {
    let mut decoded = DecodedPartition::default();
    let mut offset = 0usize;

    while offset < data.len() {
        match WalRecord::decode(&data[offset..]) {
            Ok((record, size)) => {
                decoded.records.push(record);
                offset += size;
            }
            Err(e) => {
                decoded.tail_error = Some(e);
                break;
            }
        }
    }

    decoded.valid_len = offset as u64;
    decoded
}
