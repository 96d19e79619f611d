use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::buffer::MapGuard;
use crate::errcorrupt;
use crate::error::Result;

/// Offset of the map version in the metadata region.
pub const META_VERSION_AT: u64 = 0;
/// Offset of the root node offset in the metadata region.
pub const META_ROOT_AT: u64 = 8;
/// Offset of the end-of-data offset in the metadata region.
pub const META_END_AT: u64 = 16;
/// Total size of the metadata region.
pub const META_SIZE: u64 = 24;
/// Where the version-0 root node is serialized on initialization.
pub const INIT_ROOT_OFFSET: u64 = 24;

/// The metadata triple at the head of the file.
///
/// The three fields are each read and written with single 64-bit atomic
/// loads and stores addressed into the mapped bytes; the struct form is
/// only materialized for initialization, validation, and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Version of the most recent published mutation.
    pub version: u64,
    /// Offset of the published root node.
    pub root_offset: u64,
    /// First free byte after the most recent append (exclusive).
    pub end_offset: u64,
}

impl Meta {
    /// Serialize into the fixed 24-byte little-endian layout.
    pub fn encode(&self) -> [u8; META_SIZE as usize] {
        let mut buf = [0u8; META_SIZE as usize];
        (&mut buf[0..8]).write_u64::<LittleEndian>(self.version).unwrap();
        (&mut buf[8..16]).write_u64::<LittleEndian>(self.root_offset).unwrap();
        (&mut buf[16..24]).write_u64::<LittleEndian>(self.end_offset).unwrap();
        buf
    }

    /// Deserialize from the 24-byte metadata region.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != META_SIZE as usize {
            return errcorrupt!("metadata region has {} bytes, expected {}", buf.len(), META_SIZE);
        }

        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u64::<LittleEndian>()?;
        let root_offset = cursor.read_u64::<LittleEndian>()?;
        let end_offset = cursor.read_u64::<LittleEndian>()?;

        Ok(Self { version, root_offset, end_offset })
    }

    /// Enforce the structural invariant readers rely on:
    /// `root_offset < end_offset <= mapped_len`, with the node stream
    /// starting past the metadata region.
    pub fn validate(&self, mapped_len: u64) -> Result<()> {
        if self.root_offset < META_SIZE {
            return errcorrupt!("root offset {} overlaps metadata region", self.root_offset);
        }
        if self.root_offset >= self.end_offset {
            return errcorrupt!(
                "root offset {} is not below end offset {}",
                self.root_offset,
                self.end_offset
            );
        }
        if self.end_offset > mapped_len {
            return errcorrupt!(
                "end offset {} exceeds mapped length {}",
                self.end_offset,
                mapped_len
            );
        }
        Ok(())
    }

    /// Snapshot the metadata fields with ordered atomic loads.
    pub fn snapshot(map: &MapGuard) -> Self {
        use std::sync::atomic::Ordering;

        Self {
            version: map.atomic_u64(META_VERSION_AT).load(Ordering::Acquire),
            root_offset: map.atomic_u64(META_ROOT_AT).load(Ordering::Acquire),
            end_offset: map.atomic_u64(META_END_AT).load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let meta = Meta { version: 7, root_offset: 88, end_offset: 1024 };
        let decoded = Meta::decode(&meta.encode()).expect("Failed to decode metadata");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(Meta::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let meta = Meta { version: 0, root_offset: 24, end_offset: 88 };
        meta.validate(1024).expect("Valid metadata rejected");

        // Root below the metadata region.
        let meta = Meta { version: 0, root_offset: 8, end_offset: 88 };
        assert!(meta.validate(1024).is_err());

        // Root at or past end.
        let meta = Meta { version: 0, root_offset: 88, end_offset: 88 };
        assert!(meta.validate(1024).is_err());

        // End past the mapping.
        let meta = Meta { version: 0, root_offset: 24, end_offset: 2048 };
        assert!(meta.validate(1024).is_err());
    }
}
