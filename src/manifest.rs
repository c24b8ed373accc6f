//! Directory footer / manifest (spec.md §3 "Manifest", §6 "Manifest
//! encoding").
//!
//! The manifest itself is variable-length (its size depends on
//! `epochs * 2^lg_parts`), so it cannot be found by seeking to a fixed
//! offset the way a table footer can. Instead the index log ends in the
//! manifest followed by a small fixed-size [`ManifestTrailer`] pointing
//! back at it — the same "variable record, fixed pointer" split the table
//! footer and its blocks use, one level up.

use bytes::{Buf, BufMut};

use crate::checksum;
use crate::error::{Error, Result};
use crate::options::DirMode;
use crate::table::BlockHandle;
use crate::varint;

pub const MANIFEST_MAGIC: u64 = 0x65706f_6368_5f6d_6e66; // distinct from TABLE_MAGIC
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 4 + 1 + 4; // magic, format_version, lg_parts, epochs, mode, flags

fn encode_mode(mode: DirMode) -> u8 {
    match mode {
        DirMode::MultiMap => 0,
        DirMode::UniqueOverride => 1,
        DirMode::UniqueDrop => 2,
        DirMode::Unique => 3,
    }
}

fn decode_mode(byte: u8) -> Result<DirMode> {
    match byte {
        0 => Ok(DirMode::MultiMap),
        1 => Ok(DirMode::UniqueOverride),
        2 => Ok(DirMode::UniqueDrop),
        3 => Ok(DirMode::Unique),
        other => Err(Error::Corruption {
            reason: format!("unknown DirMode tag {other} in manifest"),
        }),
    }
}

/// The directory-level footer: identifies every (epoch, partition)
/// table's footer location in the index log, plus the options needed to
/// interpret them at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub lg_parts: u32,
    pub epochs: u32,
    pub mode: DirMode,
    /// `tables[epoch][partition]`; `None` for a partition that rotated an
    /// empty memtable at that epoch boundary and so has no table.
    pub tables: Vec<Vec<Option<BlockHandle>>>,
}

impl Manifest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.tables.len() * 16);
        buf.put_u64_le(MANIFEST_MAGIC);
        buf.put_u32_le(MANIFEST_FORMAT_VERSION);
        buf.put_u32_le(self.lg_parts);
        buf.put_u32_le(self.epochs);
        buf.put_u8(encode_mode(self.mode));
        buf.put_u32_le(0); // flags, reserved

        for epoch_tables in &self.tables {
            for handle in epoch_tables {
                let handle = handle.unwrap_or(BlockHandle::NONE);
                varint::put_varint64(&mut buf, handle.offset);
                varint::put_varint64(&mut buf, handle.size);
            }
        }

        let crc = checksum::mask(checksum::crc32c(&buf));
        buf.put_u32_le(crc);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + 4 {
            return Err(Error::Corruption {
                reason: "manifest shorter than header".into(),
            });
        }
        let crc_offset = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[crc_offset..].try_into().unwrap());
        let computed_crc = checksum::mask(checksum::crc32c(&buf[..crc_offset]));
        if stored_crc != computed_crc {
            return Err(Error::Corruption {
                reason: "manifest CRC mismatch".into(),
            });
        }

        let mut header = &buf[..HEADER_LEN];
        let magic = header.get_u64_le();
        if magic != MANIFEST_MAGIC {
            return Err(Error::Corruption {
                reason: "manifest magic mismatch".into(),
            });
        }
        let format_version = header.get_u32_le();
        if format_version != MANIFEST_FORMAT_VERSION {
            return Err(Error::NotSupported {
                reason: format!("unsupported manifest format version {format_version}"),
            });
        }
        let lg_parts = header.get_u32_le();
        let epochs = header.get_u32_le();
        let mode = decode_mode(header.get_u8())?;
        let _flags = header.get_u32_le();

        let num_partitions = 1usize << lg_parts;
        let mut rest = &buf[HEADER_LEN..crc_offset];
        let mut tables = Vec::with_capacity(epochs as usize);
        for _ in 0..epochs {
            let mut epoch_tables = Vec::with_capacity(num_partitions);
            for _ in 0..num_partitions {
                let (offset, after_offset) =
                    varint::get_varint64(rest).map_err(|_| Error::Corruption {
                        reason: "truncated manifest table offset".into(),
                    })?;
                let (size, after_size) =
                    varint::get_varint64(after_offset).map_err(|_| Error::Corruption {
                        reason: "truncated manifest table size".into(),
                    })?;
                rest = after_size;
                let handle = BlockHandle { offset, size };
                epoch_tables.push(if handle.is_none() { None } else { Some(handle) });
            }
            tables.push(epoch_tables);
        }

        Ok(Manifest {
            lg_parts,
            epochs,
            mode,
            tables,
        })
    }
}

pub const TRAILER_LEN: usize = 8 + 8 + 8; // magic, manifest_offset, manifest_size

/// Fixed-size pointer, at the very end of the index log, to the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestTrailer {
    pub manifest_handle: BlockHandle,
}

impl ManifestTrailer {
    pub fn encode(&self) -> [u8; TRAILER_LEN] {
        let mut buf = [0u8; TRAILER_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_u64_le(MANIFEST_MAGIC);
        cursor.put_u64_le(self.manifest_handle.offset);
        cursor.put_u64_le(self.manifest_handle.size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != TRAILER_LEN {
            return Err(Error::Corruption {
                reason: "manifest trailer has the wrong length".into(),
            });
        }
        let mut buf = buf;
        let magic = buf.get_u64_le();
        if magic != MANIFEST_MAGIC {
            return Err(Error::Corruption {
                reason: "manifest trailer magic mismatch".into(),
            });
        }
        let offset = buf.get_u64_le();
        let size = buf.get_u64_le();
        Ok(ManifestTrailer {
            manifest_handle: BlockHandle { offset, size },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_manifest() {
        let manifest = Manifest {
            lg_parts: 1,
            epochs: 2,
            mode: DirMode::MultiMap,
            tables: vec![
                vec![Some(BlockHandle { offset: 1, size: 2 }), None],
                vec![
                    Some(BlockHandle { offset: 3, size: 4 }),
                    Some(BlockHandle { offset: 5, size: 6 }),
                ],
            ],
        };
        let encoded = manifest.encode();
        let decoded = Manifest::decode(&encoded).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn rejects_corrupted_manifest() {
        let manifest = Manifest {
            lg_parts: 0,
            epochs: 1,
            mode: DirMode::Unique,
            tables: vec![vec![Some(BlockHandle { offset: 7, size: 9 })]],
        };
        let mut encoded = manifest.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Manifest::decode(&encoded).unwrap_err().is_corruption());
    }

    #[test]
    fn trailer_round_trips() {
        let trailer = ManifestTrailer {
            manifest_handle: BlockHandle {
                offset: 1234,
                size: 567,
            },
        };
        let encoded = trailer.encode();
        let decoded = ManifestTrailer::decode(&encoded).unwrap();
        assert_eq!(decoded, trailer);
    }
}
