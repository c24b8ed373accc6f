//! `DirOptions`: the full set of recognized options from spec.md §6, plus
//! the semicolon-separated configuration string parser.
//!
//! A plain data struct with documented defaults, `Clone + Debug`, and
//! `serde`-(de)serializable for the scalar fields so a directory's options
//! can round-trip through a config file.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::env::{Env, LocalEnv};
use crate::events::EventListener;
use crate::threadpool::ThreadPool;

/// Per-epoch duplicate-key collision policy (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirMode {
    /// Retain all insertions; the reader concatenates all values for a key
    /// within an epoch, in insertion order.
    MultiMap,
    /// Retain only the last insertion for a duplicated key within an epoch.
    UniqueOverride,
    /// Retain only the first insertion; later ones are silently dropped.
    UniqueDrop,
    /// The writer asserts uniqueness. Under `paranoid_checks` a duplicate is
    /// a fatal corruption; otherwise this behaves like `UniqueDrop`.
    Unique,
}

impl Default for DirMode {
    fn default() -> Self {
        DirMode::Unique
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for DirMode {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        *g.choose(&[
            DirMode::MultiMap,
            DirMode::UniqueOverride,
            DirMode::UniqueDrop,
            DirMode::Unique,
        ])
        .unwrap()
    }
}

/// Compression applied to index and filter blocks. Data blocks are never
/// compressed (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None,
    Zlib,
}

impl Default for CompressionType {
    fn default() -> Self {
        CompressionType::None
    }
}

/// The full set of options governing a directory's write and read paths.
#[derive(Clone, Serialize, Deserialize)]
pub struct DirOptions {
    pub total_memtable_budget: usize,
    pub memtable_util: f64,
    pub skip_sort: bool,
    pub key_size: usize,
    pub value_size: usize,
    pub bf_bits_per_key: usize,
    pub block_size: usize,
    pub block_util: f64,
    pub block_padding: bool,
    pub block_batch_size: usize,
    pub data_buffer: usize,
    pub index_buffer: usize,
    pub min_data_buffer: usize,
    pub min_index_buffer: usize,
    pub tail_padding: bool,
    #[serde(skip, default)]
    pub compaction_pool: Option<Arc<dyn ThreadPool>>,
    #[serde(skip, default)]
    pub reader_pool: Option<Arc<dyn ThreadPool>>,
    pub read_size: usize,
    pub parallel_reads: bool,
    pub non_blocking: bool,
    pub slowdown_micros: u64,
    pub paranoid_checks: bool,
    pub ignore_filters: bool,
    pub compression: CompressionType,
    pub force_compression: bool,
    pub verify_checksums: bool,
    pub skip_checksums: bool,
    pub measure_reads: bool,
    pub measure_writes: bool,
    pub lg_parts: u32,
    #[serde(skip, default)]
    pub listener: Option<Arc<dyn EventListener>>,
    pub mode: DirMode,
    #[serde(skip, default)]
    pub env: Option<Arc<dyn Env>>,
    pub allow_env_threads: bool,
    pub is_env_pfs: bool,
    pub rank: u32,
}

impl fmt::Debug for DirOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirOptions")
            .field("total_memtable_budget", &self.total_memtable_budget)
            .field("memtable_util", &self.memtable_util)
            .field("skip_sort", &self.skip_sort)
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("bf_bits_per_key", &self.bf_bits_per_key)
            .field("block_size", &self.block_size)
            .field("block_util", &self.block_util)
            .field("block_padding", &self.block_padding)
            .field("block_batch_size", &self.block_batch_size)
            .field("data_buffer", &self.data_buffer)
            .field("index_buffer", &self.index_buffer)
            .field("min_data_buffer", &self.min_data_buffer)
            .field("min_index_buffer", &self.min_index_buffer)
            .field("tail_padding", &self.tail_padding)
            .field("compaction_pool", &self.compaction_pool.is_some())
            .field("reader_pool", &self.reader_pool.is_some())
            .field("read_size", &self.read_size)
            .field("parallel_reads", &self.parallel_reads)
            .field("non_blocking", &self.non_blocking)
            .field("slowdown_micros", &self.slowdown_micros)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("ignore_filters", &self.ignore_filters)
            .field("compression", &self.compression)
            .field("force_compression", &self.force_compression)
            .field("verify_checksums", &self.verify_checksums)
            .field("skip_checksums", &self.skip_checksums)
            .field("measure_reads", &self.measure_reads)
            .field("measure_writes", &self.measure_writes)
            .field("lg_parts", &self.lg_parts)
            .field("listener", &self.listener.is_some())
            .field("mode", &self.mode)
            .field("env", &self.env.is_some())
            .field("allow_env_threads", &self.allow_env_threads)
            .field("is_env_pfs", &self.is_env_pfs)
            .field("rank", &self.rank)
            .finish()
    }
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            total_memtable_budget: 4 << 20,
            memtable_util: 1.0,
            skip_sort: false,
            key_size: 8,
            value_size: 32,
            bf_bits_per_key: 8,
            block_size: 32 << 10,
            block_util: 0.996,
            block_padding: true,
            block_batch_size: 2 << 20,
            data_buffer: 4 << 20,
            index_buffer: 4 << 20,
            min_data_buffer: 4 << 20,
            min_index_buffer: 4 << 20,
            tail_padding: false,
            compaction_pool: None,
            reader_pool: None,
            read_size: 8 << 20,
            parallel_reads: false,
            non_blocking: false,
            slowdown_micros: 0,
            paranoid_checks: false,
            ignore_filters: false,
            compression: CompressionType::None,
            force_compression: false,
            verify_checksums: false,
            skip_checksums: false,
            measure_reads: true,
            measure_writes: true,
            lg_parts: 0,
            listener: None,
            mode: DirMode::Unique,
            env: None,
            allow_env_threads: false,
            is_env_pfs: true,
            rank: 0,
        }
    }
}

impl DirOptions {
    /// Number of partitions implied by `lg_parts`.
    pub fn num_partitions(&self) -> usize {
        1usize << self.lg_parts
    }

    /// The per-partition memtable budget (spec.md §4.3).
    pub fn per_partition_memtable_budget(&self) -> usize {
        self.total_memtable_budget / self.num_partitions().max(1)
    }

    /// The `Env` in effect: the configured one, or [`LocalEnv`] by default.
    pub fn env_or_default(&self) -> Arc<dyn Env> {
        self.env
            .clone()
            .unwrap_or_else(|| Arc::new(LocalEnv) as Arc<dyn Env>)
    }

    /// Validates option combinations that are structurally required, per
    /// spec.md §3 ("0 ≤ lg_parts ≤ 8").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lg_parts > 8 {
            return Err(ConfigError::OutOfRange {
                key: "lg_parts".into(),
                value: self.lg_parts.to_string(),
            });
        }
        Ok(())
    }
}

/// Error produced while parsing a configuration string (spec.md §6).
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ConfigError {
    #[snafu(display("unknown option key: {}", key))]
    UnknownKey { key: String },
    #[snafu(display("malformed entry (expected key=value): {}", entry))]
    MalformedEntry { entry: String },
    #[snafu(display("duplicate option key: {}", key))]
    DuplicateKey { key: String },
    #[snafu(display("invalid value for `{}`: {}", key, value))]
    InvalidValue { key: String, value: String },
    #[snafu(display("value out of range for `{}`: {}", key, value))]
    OutOfRange { key: String, value: String },
}

/// Parses a semicolon-separated list of `key=value` pairs into a
/// [`DirOptions`], applying defaults for any key not mentioned.
///
/// Only the scalar options in spec.md §6 can be set this way; `env`,
/// `listener`, `compaction_pool`, and `reader_pool` are runtime objects and
/// must be set programmatically after parsing.
pub fn parse_dir_options(conf: &str) -> Result<DirOptions, ConfigError> {
    let mut opts = DirOptions::default();
    let mut seen: HashMap<&str, ()> = HashMap::new();

    for entry in conf.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedEntry {
                entry: entry.to_string(),
            })?;
        let key = key.trim();
        let value = value.trim();
        if seen.insert(key, ()).is_some() {
            return Err(ConfigError::DuplicateKey {
                key: key.to_string(),
            });
        }

        apply_one(&mut opts, key, value)?;
    }

    opts.validate()?;
    Ok(opts)
}

fn apply_one(opts: &mut DirOptions, key: &str, value: &str) -> Result<(), ConfigError> {
    macro_rules! parse {
        ($value:expr, $key:expr) => {
            $value.parse().map_err(|_| ConfigError::InvalidValue {
                key: $key.to_string(),
                value: $value.to_string(),
            })?
        };
    }

    match key {
        "total_memtable_budget" => opts.total_memtable_budget = parse!(value, key),
        "memtable_util" => opts.memtable_util = parse!(value, key),
        "skip_sort" => opts.skip_sort = parse!(value, key),
        "key_size" => opts.key_size = parse!(value, key),
        "value_size" => opts.value_size = parse!(value, key),
        "bf_bits_per_key" => opts.bf_bits_per_key = parse!(value, key),
        "block_size" => opts.block_size = parse!(value, key),
        "block_util" => opts.block_util = parse!(value, key),
        "block_padding" => opts.block_padding = parse!(value, key),
        "block_batch_size" => opts.block_batch_size = parse!(value, key),
        "data_buffer" => opts.data_buffer = parse!(value, key),
        "index_buffer" => opts.index_buffer = parse!(value, key),
        "min_data_buffer" => opts.min_data_buffer = parse!(value, key),
        "min_index_buffer" => opts.min_index_buffer = parse!(value, key),
        "tail_padding" => opts.tail_padding = parse!(value, key),
        "read_size" => opts.read_size = parse!(value, key),
        "parallel_reads" => opts.parallel_reads = parse!(value, key),
        "non_blocking" => opts.non_blocking = parse!(value, key),
        "slowdown_micros" => opts.slowdown_micros = parse!(value, key),
        "paranoid_checks" => opts.paranoid_checks = parse!(value, key),
        "ignore_filters" => opts.ignore_filters = parse!(value, key),
        "force_compression" => opts.force_compression = parse!(value, key),
        "verify_checksums" => opts.verify_checksums = parse!(value, key),
        "skip_checksums" => opts.skip_checksums = parse!(value, key),
        "measure_reads" => opts.measure_reads = parse!(value, key),
        "measure_writes" => opts.measure_writes = parse!(value, key),
        "allow_env_threads" => opts.allow_env_threads = parse!(value, key),
        "is_env_pfs" => opts.is_env_pfs = parse!(value, key),
        "rank" => opts.rank = parse!(value, key),
        "lg_parts" => {
            let v: u32 = parse!(value, key);
            if v > 8 {
                return Err(ConfigError::OutOfRange {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            opts.lg_parts = v;
        }
        "compression" => {
            opts.compression = match value {
                "none" => CompressionType::None,
                "zlib" => CompressionType::Zlib,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: other.to_string(),
                    })
                }
            };
        }
        "mode" => {
            opts.mode = match value {
                "multimap" => DirMode::MultiMap,
                "unique_override" => DirMode::UniqueOverride,
                "unique_drop" => DirMode::UniqueDrop,
                "unique" => DirMode::Unique,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: other.to_string(),
                    })
                }
            };
        }
        other => {
            return Err(ConfigError::UnknownKey {
                key: other.to_string(),
            })
        }
    }

    Ok(())
}
