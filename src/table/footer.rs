//! Table footer (spec.md §4.1, §4.2).
//!
//! Fixed-size so a reader can always find it by seeking to a known offset
//! within the index log: magic, format version, a flags word (currently
//! just "has filter"), and the two `(offset, size)` pointers into the
//! index log for the index block and the filter block.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Identifies a well-formed footer; chosen arbitrarily but distinctively.
pub const TABLE_MAGIC: u64 = 0x65706f_6368_6c6f_67; // "epochlog" truncated to 8 bytes, see test.

pub const FORMAT_VERSION: u32 = 1;

const FLAG_HAS_FILTER: u32 = 1 << 0;

pub const FOOTER_LEN: usize = 8 + 4 + 4 + 8 + 8 + 8 + 8;

/// Pointer to a byte range within a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const NONE: BlockHandle = BlockHandle { offset: 0, size: 0 };

    pub fn is_none(&self) -> bool {
        self.size == 0
    }
}

/// The footer persisted at the end of every table (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_handle: BlockHandle,
    pub filter_handle: BlockHandle,
    pub has_filter: bool,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        buf.put_u64_le(TABLE_MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        let flags = if self.has_filter { FLAG_HAS_FILTER } else { 0 };
        buf.put_u32_le(flags);
        buf.put_u64_le(self.index_handle.offset);
        buf.put_u64_le(self.index_handle.size);
        buf.put_u64_le(self.filter_handle.offset);
        buf.put_u64_le(self.filter_handle.size);
        debug_assert_eq!(buf.len(), FOOTER_LEN);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_LEN {
            return Err(Error::Corruption {
                reason: "table footer truncated".into(),
            });
        }
        let magic = buf.get_u64_le();
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption {
                reason: "table footer magic mismatch".into(),
            });
        }
        let format_version = buf.get_u32_le();
        if format_version != FORMAT_VERSION {
            return Err(Error::NotSupported {
                reason: format!("unsupported table format version {format_version}"),
            });
        }
        let flags = buf.get_u32_le();
        let index_handle = BlockHandle {
            offset: buf.get_u64_le(),
            size: buf.get_u64_le(),
        };
        let filter_handle = BlockHandle {
            offset: buf.get_u64_le(),
            size: buf.get_u64_le(),
        };
        Ok(Footer {
            index_handle,
            filter_handle,
            has_filter: flags & FLAG_HAS_FILTER != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let footer = Footer {
            index_handle: BlockHandle {
                offset: 100,
                size: 50,
            },
            filter_handle: BlockHandle {
                offset: 150,
                size: 20,
            },
            has_filter: true,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_LEN);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = Footer {
            index_handle: BlockHandle::NONE,
            filter_handle: BlockHandle::NONE,
            has_filter: false,
        }
        .encode();
        encoded[0] ^= 0xff;
        assert!(Footer::decode(&encoded).unwrap_err().is_corruption());
    }

    #[test]
    fn rejects_truncated_footer() {
        let err = Footer::decode(&[0u8; 4]).unwrap_err();
        assert!(err.is_corruption());
    }
}
