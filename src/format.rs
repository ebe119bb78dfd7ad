use byteorder::{ByteOrder, LittleEndian};
use crc::Crc;

use crate::error::{Error, Result};

/// On-disk file name pieces: `litecask_<fileId>_<timestamp>.data`.
pub const FILE_PREFIX: &str = "litecask_";
pub const DATA_FILE_SUFFIX: &str = "data";
pub const HINT_FILE_SUFFIX: &str = "hint";
pub const TMP_FILE_SUFFIX: &str = "tmp";
pub const TO_REMOVE_FILE_SUFFIX: &str = "to_remove";
pub const LOCK_FILE_NAME: &str = "lockfile";

/// Key length bounds: 1..=65534 (65535 is reserved by the u16 field).
pub const MAX_KEY_SIZE: usize = 65534;
/// Value length bound; the top 16 values of the u32 range are reserved.
pub const MAX_VALUE_SIZE: usize = 0xFFFF_0000;
/// At most 64 key indexes per entry, covering the first 256 key bytes.
pub const MAX_KEY_INDEX_QTY: usize = 64;

/// Fixed header sizes, byte-exact on disk.
pub const DATA_HEADER_SIZE: usize = 16;
pub const HINT_HEADER_SIZE: usize = 16;
/// The hint header is followed by `{key_size: u16, index_count: u8, flags: u8}`.
pub const HINT_SUBHEADER_SIZE: usize = 4;

// The two headers are packed by hand; these asserts pin the byte-exact
// layout the encoders below must produce.
const _: () = assert!(DATA_HEADER_SIZE == 4 + 4 + 4 + 2 + 1 + 1);
const _: () = assert!(HINT_HEADER_SIZE == 4 + 4 + 4 + 4);

/// Record flag: the record is a tombstone; no value bytes follow.
pub const FLAG_TOMBSTONE: u8 = 0x1;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Defines the part of the key `[start_idx; start_idx + size[` used as a
/// searchable tag.
///
/// Example: for the key `"UJohn Doe/CUS/TTax document/0001"` with indexes
/// `[(0, 9), (10, 3), (14, 13)]`, any of the user `"UJohn Doe"`, the country
/// `"CUS"` or the type `"TTax document"` can be queried. The leading byte of
/// each tag ('U', 'C', 'T') keeps the columns apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyIndex {
    pub start_idx: u8,
    pub size: u8,
}

/// Header of an entry in a data file. 16 bytes on disk, followed by
/// `index_count` two-byte key indexes, the key, then the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataFileEntry {
    pub crc32: u32,
    pub ttl_deadline_sec: u32,
    pub value_size: u32,
    pub key_size: u16,
    pub index_count: u8,
    pub flags: u8,
}

impl DataFileEntry {
    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.crc32);
        LittleEndian::write_u32(&mut out[4..8], self.ttl_deadline_sec);
        LittleEndian::write_u32(&mut out[8..12], self.value_size);
        LittleEndian::write_u16(&mut out[12..14], self.key_size);
        out[14] = self.index_count;
        out[15] = self.flags;
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATA_HEADER_SIZE {
            return Err(Error::EntryCorrupted);
        }
        Ok(Self {
            crc32: LittleEndian::read_u32(&buf[0..4]),
            ttl_deadline_sec: LittleEndian::read_u32(&buf[4..8]),
            value_size: LittleEndian::read_u32(&buf[8..12]),
            key_size: LittleEndian::read_u16(&buf[12..14]),
            index_count: buf[14],
            flags: buf[15],
        })
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Full record length on disk, header included.
    pub fn record_len(&self) -> usize {
        let value = if self.is_tombstone() {
            0
        } else {
            self.value_size as usize
        };
        DATA_HEADER_SIZE + 2 * self.index_count as usize + self.key_size as usize + value
    }
}

/// Header of an entry in a hint file. The fixed part is 16 bytes, followed
/// by the 4-byte sub-header, the inline key indexes and the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HintFileEntry {
    pub key_hash: u32,
    pub ttl_deadline_sec: u32,
    pub offset: u32,
    pub value_size: u32,
    pub key_size: u16,
    pub index_count: u8,
    pub flags: u8,
}

impl HintFileEntry {
    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.key_hash);
        LittleEndian::write_u32(&mut out[4..8], self.ttl_deadline_sec);
        LittleEndian::write_u32(&mut out[8..12], self.offset);
        LittleEndian::write_u32(&mut out[12..16], self.value_size);
        LittleEndian::write_u16(&mut out[16..18], self.key_size);
        out[18] = self.index_count;
        out[19] = self.flags;
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HINT_HEADER_SIZE + HINT_SUBHEADER_SIZE {
            return Err(Error::EntryCorrupted);
        }
        Ok(Self {
            key_hash: LittleEndian::read_u32(&buf[0..4]),
            ttl_deadline_sec: LittleEndian::read_u32(&buf[4..8]),
            offset: LittleEndian::read_u32(&buf[8..12]),
            value_size: LittleEndian::read_u32(&buf[12..16]),
            key_size: LittleEndian::read_u16(&buf[16..18]),
            index_count: buf[18],
            flags: buf[19],
        })
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Full hint entry length on disk, headers included.
    pub fn entry_len(&self) -> usize {
        HINT_HEADER_SIZE
            + HINT_SUBHEADER_SIZE
            + 2 * self.index_count as usize
            + self.key_size as usize
    }
}

/// Length of a data record on disk.
pub fn data_record_len(key_size: usize, index_count: usize, value_size: usize) -> usize {
    DATA_HEADER_SIZE + 2 * index_count + key_size + value_size
}

pub fn encode_key_indexes(out: &mut [u8], indexes: &[KeyIndex]) {
    for (i, ki) in indexes.iter().enumerate() {
        out[2 * i] = ki.start_idx;
        out[2 * i + 1] = ki.size;
    }
}

pub fn decode_key_indexes(buf: &[u8]) -> Vec<KeyIndex> {
    buf.chunks_exact(2)
        .map(|c| KeyIndex {
            start_idx: c[0],
            size: c[1],
        })
        .collect()
}

/// Encodes a full data record (header, indexes, key, value) into `out`,
/// which must be exactly the record length. `value = None` encodes a
/// tombstone: the deleted flag is set and neither indexes nor value bytes
/// are written.
///
/// The CRC-32 covers everything from `ttl_deadline_sec` to the end of the
/// value, and is patched into the first four bytes last.
pub fn encode_data_record(
    out: &mut [u8],
    ttl_deadline_sec: u32,
    key: &[u8],
    indexes: &[KeyIndex],
    value: Option<&[u8]>,
) {
    let (value_size, index_count, flags) = match value {
        Some(v) => (v.len() as u32, indexes.len() as u8, 0),
        None => (0, 0, FLAG_TOMBSTONE),
    };
    let header = DataFileEntry {
        crc32: 0,
        ttl_deadline_sec,
        value_size,
        key_size: key.len() as u16,
        index_count,
        flags,
    };
    debug_assert_eq!(out.len(), header.record_len());
    header.encode(out);

    let mut pos = DATA_HEADER_SIZE;
    if value.is_some() {
        encode_key_indexes(&mut out[pos..pos + 2 * indexes.len()], indexes);
        pos += 2 * indexes.len();
    }
    out[pos..pos + key.len()].copy_from_slice(key);
    pos += key.len();
    if let Some(v) = value {
        out[pos..pos + v.len()].copy_from_slice(v);
    }

    let crc = CRC32.checksum(&out[4..]);
    LittleEndian::write_u32(&mut out[0..4], crc);
}

/// Verifies the checksum of a complete record (header included).
pub fn verify_record_crc(record: &[u8]) -> bool {
    if record.len() < DATA_HEADER_SIZE {
        return false;
    }
    LittleEndian::read_u32(&record[0..4]) == CRC32.checksum(&record[4..])
}

/// Builds a data file name: `litecask_<fileId>_<timestamp>.data`.
pub fn data_file_name(file_id: u16, timestamp: u64) -> String {
    format!(
        "{}{:05}_{}.{}",
        FILE_PREFIX, file_id, timestamp, DATA_FILE_SUFFIX
    )
}

pub fn hint_file_name(file_id: u16, timestamp: u64) -> String {
    format!(
        "{}{:05}_{}.{}",
        FILE_PREFIX, file_id, timestamp, HINT_FILE_SUFFIX
    )
}

/// Parses `litecask_<fileId>_<timestamp>` from a data or hint file stem.
pub fn parse_file_stem(stem: &str) -> Option<(u16, u64)> {
    let rest = stem.strip_prefix(FILE_PREFIX)?;
    let (id_str, ts_str) = rest.split_once('_')?;
    let id = id_str.parse::<u16>().ok()?;
    let ts = ts_str.parse::<u64>().ok()?;
    Some((id, ts))
}
