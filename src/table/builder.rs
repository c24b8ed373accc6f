//! Table builder (spec.md §4.2).
//!
//! Accepts sorted `(key, value)` pairs, packs them into data blocks, and
//! emits index entries keyed by each data block's largest key. On
//! `finish`, writes the filter block and index block to the index log,
//! then the footer, returning the footer's handle so the caller can record
//! it in the manifest.

use bytes::BytesMut;

use crate::block::{self, BlockBuilder};
use crate::error::Result;
use crate::filter::FilterBuilder;
use crate::log::LogSink;
use crate::options::DirOptions;
use crate::stats::IoStats;
use crate::table::footer::{BlockHandle, Footer};
use crate::varint;

pub struct TableBuilder<'a> {
    opts: &'a DirOptions,
    data_sink: LogSink,
    index_sink: LogSink,
    stats: Option<&'a IoStats>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter: FilterBuilder,

    last_key: Vec<u8>,
    num_entries: u64,
}

impl<'a> TableBuilder<'a> {
    pub fn new(
        opts: &'a DirOptions,
        data_sink: LogSink,
        index_sink: LogSink,
        stats: Option<&'a IoStats>,
    ) -> Self {
        Self {
            opts,
            data_sink,
            index_sink,
            stats,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            filter: FilterBuilder::new(opts.bf_bits_per_key),
            last_key: Vec::new(),
            num_entries: 0,
        }
    }

    /// Adds one entry. The caller is responsible for supplying entries in
    /// sorted key order (the memtable/compaction pipeline owns that).
    pub async fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data_block.add(key, value);
        self.filter.add(key);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        let threshold = (self.opts.block_util * self.opts.block_size as f64) as usize;
        if self.data_block.size_estimate() >= threshold {
            self.flush_data_block().await?;
        }
        Ok(())
    }

    async fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = self.data_block.finish();
        let framed = block::seal_block(
            &contents,
            crate::options::CompressionType::None,
            false,
            self.opts.block_padding,
            self.opts.block_size,
        );
        let offset = self.data_sink.write(&framed, self.stats).await?;

        let mut index_value = BytesMut::new();
        varint::put_varint64(&mut index_value, offset);
        varint::put_varint64(&mut index_value, framed.len() as u64);
        self.index_block.add(&self.last_key, &index_value);

        Ok(())
    }

    /// Flushes any pending data block, writes the filter and index blocks,
    /// then the footer, all to the index log. Returns the footer's handle.
    pub async fn finish(mut self) -> Result<BlockHandle> {
        self.flush_data_block().await?;

        let filter_handle = if self.filter.is_enabled() {
            let filter_bytes = self.filter.finish();
            if filter_bytes.is_empty() {
                BlockHandle::NONE
            } else {
                let framed = block::seal_block(
                    &filter_bytes,
                    self.opts.compression,
                    self.opts.force_compression,
                    false,
                    0,
                );
                let offset = self.index_sink.write(&framed, self.stats).await?;
                BlockHandle {
                    offset,
                    size: framed.len() as u64,
                }
            }
        } else {
            BlockHandle::NONE
        };

        let index_contents = self.index_block.finish();
        let index_framed = block::seal_block(
            &index_contents,
            self.opts.compression,
            self.opts.force_compression,
            false,
            0,
        );
        let index_offset = self.index_sink.write(&index_framed, self.stats).await?;
        let index_handle = BlockHandle {
            offset: index_offset,
            size: index_framed.len() as u64,
        };

        let footer = Footer {
            index_handle,
            filter_handle,
            has_filter: !filter_handle.is_none(),
        };
        let encoded = footer.encode();
        let footer_offset = self.index_sink.write(&encoded, self.stats).await?;

        Ok(BlockHandle {
            offset: footer_offset,
            size: encoded.len() as u64,
        })
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }
}
