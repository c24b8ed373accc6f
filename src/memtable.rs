//! Per-partition memtable (spec.md §4.3).
//!
//! An in-memory ordered multiset of `(key, value)`, stable-sorted by
//! insertion order for equal keys. The *DirMode* collision policy is
//! applied once, at flush time, not on every insert.

use crate::error::{Error, Result};
use crate::options::DirMode;

/// A single partition's currently-open-epoch buffer.
#[derive(Debug, Default)]
pub struct MemTable {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    approx_bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.approx_bytes += key.len() + value.len();
        self.entries.push((key.to_vec(), value.to_vec()));
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Consumes the memtable, producing the sequence a table builder
    /// should receive: sorted (unless `skip_sort`) and reduced per `mode`.
    ///
    /// `paranoid_checks` dominates `skip_sort` per the REDESIGN FLAGS: even
    /// when the caller warrants pre-sorted input, order is verified and a
    /// violation is reported as corruption rather than silently trusted.
    pub fn into_sorted_reduced(
        mut self,
        mode: DirMode,
        skip_sort: bool,
        paranoid_checks: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if skip_sort {
            if paranoid_checks {
                verify_ascending(&self.entries)?;
            }
        } else {
            self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        }
        apply_dir_mode(self.entries, mode, paranoid_checks)
    }
}

fn verify_ascending(entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    for pair in entries.windows(2) {
        if pair[0].0 > pair[1].0 {
            return Err(Error::Corruption {
                reason: "memtable entries out of order under skip_sort".into(),
            });
        }
    }
    Ok(())
}

fn apply_dir_mode(
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    mode: DirMode,
    paranoid_checks: bool,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    match mode {
        DirMode::MultiMap => Ok(entries),
        DirMode::UniqueOverride => Ok(reduce_groups(entries, Keep::Last)),
        DirMode::UniqueDrop => Ok(reduce_groups(entries, Keep::First)),
        DirMode::Unique => {
            if paranoid_checks {
                assert_no_duplicates(&entries)?;
                Ok(entries)
            } else {
                Ok(reduce_groups(entries, Keep::First))
            }
        }
    }
}

enum Keep {
    First,
    Last,
}

/// Reduces consecutive runs of equal keys (the input must already be
/// sorted) to a single entry each.
fn reduce_groups(entries: Vec<(Vec<u8>, Vec<u8>)>, keep: Keep) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match out.last_mut() {
            Some(last) if last.0 == key => match keep {
                Keep::First => {}
                Keep::Last => last.1 = value,
            },
            _ => out.push((key, value)),
        }
    }
    out
}

fn assert_no_duplicates(entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    for pair in entries.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(Error::AssertionFailed {
                reason: format!(
                    "duplicate key under DirMode::Unique with paranoid_checks: {:?}",
                    pair[0].0
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memtable_of(pairs: &[(&str, &str)]) -> MemTable {
        let mut mt = MemTable::new();
        for (k, v) in pairs {
            mt.add(k.as_bytes(), v.as_bytes());
        }
        mt
    }

    fn strs(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<(String, String)> {
        entries
            .into_iter()
            .map(|(k, v)| (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()))
            .collect()
    }

    #[test]
    fn multimap_retains_all_in_insertion_order() {
        let mt = memtable_of(&[("a", "1"), ("a", "2"), ("a", "3")]);
        let out = mt
            .into_sorted_reduced(DirMode::MultiMap, false, false)
            .unwrap();
        assert_eq!(
            strs(out),
            vec![
                ("a".into(), "1".into()),
                ("a".into(), "2".into()),
                ("a".into(), "3".into())
            ]
        );
    }

    #[test]
    fn unique_override_keeps_last() {
        let mt = memtable_of(&[("a", "1"), ("a", "2"), ("a", "3")]);
        let out = mt
            .into_sorted_reduced(DirMode::UniqueOverride, false, false)
            .unwrap();
        assert_eq!(strs(out), vec![("a".into(), "3".into())]);
    }

    #[test]
    fn unique_drop_keeps_first() {
        let mt = memtable_of(&[("a", "1"), ("a", "2"), ("a", "3")]);
        let out = mt
            .into_sorted_reduced(DirMode::UniqueDrop, false, false)
            .unwrap();
        assert_eq!(strs(out), vec![("a".into(), "1".into())]);
    }

    #[test]
    fn unique_mode_without_paranoid_checks_behaves_like_unique_drop() {
        let mt = memtable_of(&[("a", "1"), ("a", "2")]);
        let out = mt
            .into_sorted_reduced(DirMode::Unique, false, false)
            .unwrap();
        assert_eq!(strs(out), vec![("a".into(), "1".into())]);
    }

    #[test]
    fn unique_mode_with_paranoid_checks_rejects_duplicates() {
        let mt = memtable_of(&[("a", "1"), ("a", "2")]);
        let err = mt
            .into_sorted_reduced(DirMode::Unique, false, true)
            .unwrap_err();
        assert!(matches!(err, Error::AssertionFailed { .. }));
    }

    #[test]
    fn sorts_unless_skip_sort() {
        let mt = memtable_of(&[("c", "3"), ("a", "1"), ("b", "2")]);
        let out = mt
            .into_sorted_reduced(DirMode::MultiMap, false, false)
            .unwrap();
        assert_eq!(
            strs(out),
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("c".into(), "3".into())
            ]
        );
    }

    #[test]
    fn skip_sort_trusts_input_without_paranoid_checks() {
        let mt = memtable_of(&[("c", "3"), ("a", "1")]);
        let out = mt
            .into_sorted_reduced(DirMode::MultiMap, true, false)
            .unwrap();
        // trusted as-is: input was not actually sorted, and skip_sort means
        // we do not fix that up.
        assert_eq!(strs(out), vec![("c".into(), "3".into()), ("a".into(), "1".into())]);
    }

    #[test]
    fn skip_sort_with_paranoid_checks_catches_disorder() {
        let mt = memtable_of(&[("c", "3"), ("a", "1")]);
        let err = mt
            .into_sorted_reduced(DirMode::MultiMap, true, true)
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn stable_sort_preserves_insertion_order_within_equal_keys() {
        let mt = memtable_of(&[("b", "1"), ("a", "x"), ("b", "2")]);
        let out = mt
            .into_sorted_reduced(DirMode::MultiMap, false, false)
            .unwrap();
        assert_eq!(
            strs(out),
            vec![
                ("a".into(), "x".into()),
                ("b".into(), "1".into()),
                ("b".into(), "2".into())
            ]
        );
    }
}
