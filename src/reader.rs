//! `DirReader` orchestration (spec.md §4.6).
//!
//! Opens the manifest written by a finished [`crate::writer::DirWriter`],
//! builds one [`TableReader`] per `(epoch, partition)` pair that has a
//! table, and serves `ReadAll`: walk a key's partition's tables in epoch
//! order, concatenating every value found (spec.md §4.6 "epoch order,
//! builder order within a table").

use std::path::Path;
use std::sync::Arc;

use crate::checksum;
use crate::error::{Error, Result};
use crate::events::NullEventListener;
use crate::log::{LogSource, DATA_LOG, INDEX_LOG};
use crate::manifest::{Manifest, ManifestTrailer, TRAILER_LEN};
use crate::options::DirOptions;
use crate::stats::IoStats;
use crate::table::TableReader;

/// The read-side handle for one directory.
pub struct DirReader {
    opts: DirOptions,
    manifest: Manifest,
    /// `tables[epoch][partition]`, `None` where that partition had no table
    /// at that epoch boundary. Each table holds its own handle to the data
    /// log, so no separate log handles need to be kept here.
    tables: Vec<Vec<Option<TableReader>>>,
    stats: Arc<IoStats>,
}

impl DirReader {
    /// Opens `dirname`'s `DATA-<rank>`/`INDEX-<rank>` logs, reads the
    /// manifest trailer at the end of the index log, decodes the manifest,
    /// and opens every referenced table.
    #[instrument(skip(opts), level = "trace", fields(rank = opts.rank))]
    pub async fn open(dirname: &Path, opts: DirOptions) -> Result<Self> {
        opts.validate().map_err(|e| Error::NotSupported {
            reason: e.to_string(),
        })?;

        let env = opts.env_or_default();
        let data_path = dirname.join(format!("DATA-{}", opts.rank));
        let index_path = dirname.join(format!("INDEX-{}", opts.rank));
        let data_file = env.open_random_access(&data_path).await?;
        let index_file = env.open_random_access(&index_path).await?;

        let listener = opts
            .listener
            .clone()
            .unwrap_or_else(|| Arc::new(NullEventListener));
        let data_source = LogSource::with_listener(data_file, DATA_LOG, listener.clone());
        let index_source = LogSource::with_listener(index_file, INDEX_LOG, listener.clone());
        let stats = Arc::new(IoStats::new());
        let read_stats = crate::stats::gate(opts.measure_reads, &stats);

        let index_len = index_source.size();
        if index_len < TRAILER_LEN as u64 {
            return Err(Error::Corruption {
                reason: "index log shorter than a manifest trailer".into(),
            });
        }
        let trailer_offset = index_len - TRAILER_LEN as u64;
        let trailer_bytes = index_source
            .read(trailer_offset, TRAILER_LEN, read_stats)
            .await?;
        let trailer = ManifestTrailer::decode(&trailer_bytes)?;

        let manifest_bytes = index_source
            .read(
                trailer.manifest_handle.offset,
                trailer.manifest_handle.size as usize,
                read_stats,
            )
            .await?;
        let manifest = Manifest::decode(&manifest_bytes)?;
        debug!(epochs = manifest.epochs, lg_parts = manifest.lg_parts, "loaded manifest");

        let num_partitions = 1usize << manifest.lg_parts;
        let mut tables = Vec::with_capacity(manifest.epochs as usize);
        for epoch_tables in &manifest.tables {
            let mut row = Vec::with_capacity(num_partitions);
            for handle in epoch_tables {
                let reader = match handle {
                    Some(handle) => Some(
                        TableReader::open(&index_source, &data_source, *handle, &opts, read_stats)
                            .await?,
                    ),
                    None => None,
                };
                row.push(reader);
            }
            tables.push(row);
        }

        Ok(Self {
            opts,
            manifest,
            tables,
            stats,
        })
    }

    fn partition_of(&self, key: &[u8]) -> usize {
        let num_partitions = 1usize << self.manifest.lg_parts;
        if num_partitions <= 1 {
            0
        } else {
            checksum::crc32c(key) as usize % num_partitions
        }
    }

    /// Reads every value ever written for `key`, across all epochs, in
    /// epoch order (and builder order within an epoch's table). Returns
    /// the values plus the number of tables probed and data blocks read,
    /// mirroring spec.md §4.6's `table_seeks`/`seeks` out-parameters.
    ///
    /// When `parallel_reads` and `reader_pool` are both set (spec.md §4.6),
    /// each epoch's table is probed concurrently and the per-epoch results
    /// are merged back into epoch order afterward; `reader_pool` itself is a
    /// CPU-bound [`crate::threadpool::ThreadPool`] and isn't a fit for this
    /// I/O-bound fan-out, so it is only consulted as the gate, not as the
    /// executor — the fan-out runs as concurrently polled futures on the
    /// calling task instead.
    #[instrument(skip(self, key), level = "trace")]
    pub async fn read_all(&self, key: &[u8]) -> Result<ReadAllResult> {
        let partition = self.partition_of(key);

        let result = if self.opts.parallel_reads && self.opts.reader_pool.is_some() {
            self.read_all_parallel(key, partition).await?
        } else {
            let read_stats = crate::stats::gate(self.opts.measure_reads, &self.stats);
            let mut values = Vec::new();
            let mut table_seeks = 0u64;
            let mut seeks = 0u64;

            for epoch_tables in &self.tables {
                let Some(reader) = epoch_tables.get(partition).and_then(Option::as_ref) else {
                    continue;
                };
                table_seeks += 1;
                let found = reader.lookup(key, read_stats, &mut seeks).await?;
                values.extend(found);
            }

            ReadAllResult {
                values,
                table_seeks,
                seeks,
            }
        };

        if result.values.is_empty() {
            return Err(Error::NotFound {
                what: format!("key absent from every epoch in partition {partition}"),
            });
        }

        Ok(result)
    }

    async fn read_all_parallel(&self, key: &[u8], partition: usize) -> Result<ReadAllResult> {
        let read_stats = crate::stats::gate(self.opts.measure_reads, &self.stats);
        let probes = self.tables.iter().map(|epoch_tables| async move {
            match epoch_tables.get(partition).and_then(Option::as_ref) {
                Some(reader) => {
                    let mut seeks = 0u64;
                    let found = reader.lookup(key, read_stats, &mut seeks).await?;
                    Ok::<_, Error>(Some((found, seeks)))
                }
                None => Ok(None),
            }
        });

        let mut values = Vec::new();
        let mut table_seeks = 0u64;
        let mut seeks = 0u64;
        for result in futures::future::join_all(probes).await {
            if let Some((found, probe_seeks)) = result? {
                table_seeks += 1;
                seeks += probe_seeks;
                values.extend(found);
            }
        }

        Ok(ReadAllResult {
            values,
            table_seeks,
            seeks,
        })
    }

    pub fn num_epochs(&self) -> u32 {
        self.manifest.epochs
    }

    pub fn num_partitions(&self) -> usize {
        1usize << self.manifest.lg_parts
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.stats
    }

    pub fn options(&self) -> &DirOptions {
        &self.opts
    }
}

/// Result of [`DirReader::read_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadAllResult {
    pub values: Vec<Vec<u8>>,
    /// Number of `(epoch, partition)` tables actually probed.
    pub table_seeks: u64,
    /// Number of data-block reads performed across those tables.
    pub seeks: u64,
}
