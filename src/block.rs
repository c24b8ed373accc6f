//! Block codec (spec.md §4.1).
//!
//! A block is a sequence of `[key_len varint | key | value_len varint |
//! value]` entries, sorted ascending by key, followed by a trailing `u32`
//! entry count. Index blocks reuse the same entry framing with the varint
//! encoding of an `(offset, size)` pair as their "value". Persisted framing
//! (compression tag + CRC32C trailer) is grounded on the block trailer in
//! `other_examples/.../anchored-sstable/src/table/build.rs`: tag byte, then
//! the CRC32C of `payload ++ tag`, stored little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::checksum;
use crate::options::CompressionType;
use crate::varint;

/// Trailer length: 1 compression-tag byte + 4 CRC32C bytes.
pub const TRAILER_LEN: usize = 5;

/// Accumulates sorted `(key, value)` entries into one block's raw contents.
///
/// `value` is opaque to the builder: data blocks pass the record value
/// directly, index blocks pass a varint-encoded `(offset, size)` pair.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: BytesMut,
    count: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry. Callers are responsible for ensuring keys arrive
    /// in sorted order; this builder does not itself enforce it (the
    /// memtable layer owns order-checking under `paranoid_checks`).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        varint::put_varint64(&mut self.buf, key.len() as u64);
        self.buf.put_slice(key);
        varint::put_varint64(&mut self.buf, value.len() as u64);
        self.buf.put_slice(value);
        self.count += 1;
    }

    /// Estimated serialized size of the block so far, including the
    /// trailing count but excluding compression/CRC framing. Used to decide
    /// when a block has reached `block_util * block_size` (spec.md §4.1).
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + std::mem::size_of::<u32>()
    }

    pub fn num_entries(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finalizes the block's raw (pre-framing) contents, resetting the
    /// builder for reuse.
    pub fn finish(&mut self) -> BytesMut {
        self.buf.put_u32_le(self.count);
        let out = std::mem::take(&mut self.buf);
        self.count = 0;
        out
    }
}

/// Frames `contents` for persistence: optionally compresses it, then
/// appends the compression tag and CRC32C trailer.
///
/// Compression is attempted whenever `compression != None`; the compressed
/// form is kept only if `force_compression` or it is strictly smaller than
/// the uncompressed form (spec.md §4.1).
pub fn seal_block(
    contents: &[u8],
    compression: CompressionType,
    force_compression: bool,
    block_padding: bool,
    block_size: usize,
) -> BytesMut {
    let (payload, tag): (Vec<u8>, u8) = match compression {
        CompressionType::None => (contents.to_vec(), 0),
        CompressionType::Zlib => {
            let compressed = compress_zlib(contents);
            if force_compression || compressed.len() < contents.len() {
                (compressed, 1)
            } else {
                (contents.to_vec(), 0)
            }
        }
    };

    let mut out = BytesMut::with_capacity(payload.len() + TRAILER_LEN);
    out.put_slice(&payload);
    out.put_u8(tag);

    let crc = checksum::mask(checksum::crc32c(&out));
    out.put_u32_le(crc);

    if block_padding {
        let target = block_size.max(out.len());
        out.resize(target, 0);
    }

    out
}

/// Unframes a block previously produced by [`seal_block`] (ignoring any
/// padding past the CRC trailer is the caller's responsibility via the
/// index's recorded size), returning the raw entry contents.
pub fn open_block(framed: &[u8], verify_checksums: bool) -> crate::error::Result<BytesMut> {
    if framed.len() < TRAILER_LEN {
        return Err(crate::error::Error::Corruption {
            reason: "block shorter than trailer".into(),
        });
    }
    let crc_offset = framed.len() - 4;
    let stored_crc = u32::from_le_bytes(framed[crc_offset..].try_into().unwrap());
    let tag = framed[crc_offset - 1];
    let payload = &framed[..crc_offset - 1];

    if verify_checksums {
        let computed = checksum::mask(checksum::crc32c(&framed[..crc_offset]));
        if computed != stored_crc {
            warn!(stored_crc, computed, "block checksum mismatch");
            return Err(crate::error::Error::Corruption {
                reason: "block CRC mismatch".into(),
            });
        }
    }

    match tag {
        0 => Ok(BytesMut::from(payload)),
        1 => Ok(BytesMut::from(&decompress_zlib(payload)?[..])),
        other => Err(crate::error::Error::Corruption {
            reason: format!("unknown block compression tag {other}"),
        }),
    }
}

fn compress_zlib(data: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("writing to an in-memory encoder cannot fail");
    encoder.finish().expect("finishing an in-memory encoder cannot fail")
}

fn decompress_zlib(data: &[u8]) -> crate::error::Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| crate::error::Error::Corruption {
            reason: format!("zlib decompression failed: {e}"),
        })?;
    Ok(out)
}

/// An entry read back out of a block's raw contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Iterates the entries of a block's raw (unframed) contents, in storage
/// order.
pub struct BlockIter<'a> {
    buf: &'a [u8],
    remaining: u32,
}

impl<'a> BlockIter<'a> {
    pub fn new(contents: &'a [u8]) -> crate::error::Result<Self> {
        if contents.len() < 4 {
            return Err(crate::error::Error::Corruption {
                reason: "block missing entry count".into(),
            });
        }
        let count_offset = contents.len() - 4;
        let count = (&contents[count_offset..]).get_u32_le();
        Ok(Self {
            buf: &contents[..count_offset],
            remaining: count,
        })
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = crate::error::Result<BlockEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let result = (|| {
            let (key_len, rest) = varint::get_varint64(self.buf)
                .map_err(|_| crate::error::Error::Corruption {
                    reason: "truncated key length".into(),
                })?;
            let key_len = key_len as usize;
            if rest.len() < key_len {
                return Err(crate::error::Error::Corruption {
                    reason: "truncated key".into(),
                });
            }
            let (key, rest) = rest.split_at(key_len);

            let (value_len, rest) = varint::get_varint64(rest)
                .map_err(|_| crate::error::Error::Corruption {
                    reason: "truncated value length".into(),
                })?;
            let value_len = value_len as usize;
            if rest.len() < value_len {
                return Err(crate::error::Error::Corruption {
                    reason: "truncated value".into(),
                });
            }
            let (value, rest) = rest.split_at(value_len);

            self.buf = rest;
            Ok(BlockEntry {
                key: key.to_vec(),
                value: value.to_vec(),
            })
        })();

        self.remaining -= 1;
        Some(result)
    }
}
