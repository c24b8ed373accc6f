//! Table reader (spec.md §4.2).
//!
//! Loads a table's index and filter blocks with one combined read spanning
//! both (the "earliest referenced byte" rule in spec.md §4.2), then serves
//! point lookups: filter probe, binary search over the index, linear scan
//! of the candidate data block.

use crate::block::{self, BlockIter};
use crate::error::{Error, Result};
use crate::filter;
use crate::log::LogSource;
use crate::options::DirOptions;
use crate::stats::IoStats;
use crate::table::footer::{BlockHandle, Footer};
use crate::varint;

struct IndexEntry {
    key: Vec<u8>,
    handle: BlockHandle,
}

pub struct TableReader {
    index: Vec<IndexEntry>,
    filter: Option<Vec<u8>>,
    data_source: LogSource,
    verify_checksums: bool,
    ignore_filters: bool,
}

impl TableReader {
    /// Opens a table given its footer's location in the index log.
    pub async fn open(
        index_source: &LogSource,
        data_source: &LogSource,
        footer_handle: BlockHandle,
        opts: &DirOptions,
        stats: Option<&IoStats>,
    ) -> Result<Self> {
        let footer_bytes = index_source
            .read(footer_handle.offset, footer_handle.size as usize, stats)
            .await?;
        let footer = Footer::decode(&footer_bytes)?;

        let mut handles = Vec::new();
        if !footer.index_handle.is_none() {
            handles.push(footer.index_handle);
        }
        if !footer.filter_handle.is_none() {
            handles.push(footer.filter_handle);
        }
        if handles.is_empty() {
            return Ok(Self {
                index: Vec::new(),
                filter: None,
                data_source: data_source.clone(),
                verify_checksums: opts.verify_checksums && !opts.skip_checksums,
                ignore_filters: opts.ignore_filters,
            });
        }

        let start = handles.iter().map(|h| h.offset).min().unwrap();
        let end = handles.iter().map(|h| h.offset + h.size).max().unwrap();
        let combined = index_source
            .read(start, (end - start) as usize, stats)
            .await?;

        let verify_checksums = opts.verify_checksums && !opts.skip_checksums;

        let index = if !footer.index_handle.is_none() {
            let slice = slice_of(&combined, start, footer.index_handle);
            let raw = block::open_block(slice, verify_checksums)?;
            parse_index(&raw)?
        } else {
            Vec::new()
        };

        let filter = if !footer.filter_handle.is_none() {
            let slice = slice_of(&combined, start, footer.filter_handle);
            Some(block::open_block(slice, verify_checksums)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            index,
            filter,
            data_source: data_source.clone(),
            verify_checksums,
            ignore_filters: opts.ignore_filters,
        })
    }

    /// Looks up all values stored for `key` in this table, in the order
    /// the builder received them (spec.md §4.2 tie-break rule).
    ///
    /// Increments `table_seeks` always, and `seeks` once for the data block
    /// read performed, mirroring the out-parameters `DirReader::ReadAll`
    /// accumulates (spec.md §4.6).
    pub async fn lookup(
        &self,
        key: &[u8],
        stats: Option<&IoStats>,
        seeks: &mut u64,
    ) -> Result<Vec<Vec<u8>>> {
        if let Some(filter) = &self.filter {
            if !self.ignore_filters && !filter::may_contain(filter, key) {
                return Ok(Vec::new());
            }
        }

        let idx = self.index.partition_point(|e| e.key.as_slice() < key);
        let Some(entry) = self.index.get(idx) else {
            return Ok(Vec::new());
        };

        let framed = self
            .data_source
            .read(entry.handle.offset, entry.handle.size as usize, stats)
            .await?;
        *seeks += 1;
        let raw = block::open_block(&framed, self.verify_checksums)?;

        let mut out = Vec::new();
        for item in BlockIter::new(&raw)? {
            let item = item?;
            if item.key == key {
                out.push(item.value);
            }
        }
        Ok(out)
    }

    pub fn num_data_blocks(&self) -> usize {
        self.index.len()
    }
}

fn slice_of<'a>(combined: &'a [u8], base: u64, handle: BlockHandle) -> &'a [u8] {
    let start = (handle.offset - base) as usize;
    let end = start + handle.size as usize;
    &combined[start..end]
}

fn parse_index(raw: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut out = Vec::new();
    for item in BlockIter::new(raw)? {
        let item = item?;
        let (offset, rest) = varint::get_varint64(&item.value).map_err(|_| Error::Corruption {
            reason: "truncated index offset".into(),
        })?;
        let (size, _) = varint::get_varint64(rest).map_err(|_| Error::Corruption {
            reason: "truncated index size".into(),
        })?;
        out.push(IndexEntry {
            key: item.key,
            handle: BlockHandle { offset, size },
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::WritableFile;
    use crate::log::{DATA_LOG, INDEX_LOG};
    use crate::log::LogSink;
    use crate::table::builder::TableBuilder;

    #[derive(Debug, Default)]
    struct MemFile {
        data: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
    }

    impl tokio::io::AsyncWrite for MemFile {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.data.lock().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait::async_trait]
    impl WritableFile for MemFile {
        async fn flush_file(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        async fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct MemRandomAccess {
        data: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl crate::env::RandomAccessFile for MemRandomAccess {
        async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            let data = self.data.lock();
            let offset = offset as usize;
            Ok(data[offset..offset + len].to_vec())
        }
        fn size(&self) -> u64 {
            self.data.lock().len() as u64
        }
    }

    #[tokio::test]
    async fn builds_and_reads_back_entries() {
        let opts = DirOptions::default();

        let data_backing = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let index_backing = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let data_sink = LogSink::new(
            Box::new(MemFile {
                data: data_backing.clone(),
            }),
            1 << 20,
            0,
            false,
            DATA_LOG,
        );
        let index_sink = LogSink::new(
            Box::new(MemFile {
                data: index_backing.clone(),
            }),
            1 << 20,
            0,
            false,
            INDEX_LOG,
        );

        let mut builder = TableBuilder::new(&opts, data_sink.clone(), index_sink.clone(), None);
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            builder.add(k.as_bytes(), v.as_bytes()).await.unwrap();
        }
        let footer_handle = builder.finish().await.unwrap();
        data_sink.close(None).await.unwrap();
        index_sink.close(None).await.unwrap();

        let data_source = LogSource::new(
            std::sync::Arc::new(MemRandomAccess {
                data: data_backing,
            }),
            DATA_LOG,
        );
        let index_source = LogSource::new(
            std::sync::Arc::new(MemRandomAccess {
                data: index_backing,
            }),
            INDEX_LOG,
        );

        let reader = TableReader::open(&index_source, &data_source, footer_handle, &opts, None)
            .await
            .unwrap();

        let mut seeks = 0;
        let got = reader.lookup(b"b", None, &mut seeks).await.unwrap();
        assert_eq!(got, vec![b"2".to_vec()]);
        assert_eq!(seeks, 1);

        let missing = reader.lookup(b"z", None, &mut seeks).await.unwrap();
        assert!(missing.is_empty());
    }
}
