//! Typed access to a pinned key/value table.
//!
//! A [`RawTable`] moves opaque bytes in and out of one kernel map (or its
//! in-memory stand-in). [`Table`] layers the fixed-layout records on top and
//! implements the batch semantics the CNI relies on.
//!
//! Single-key operations are atomic in the kernel. Batch operations are not:
//! they are applied entry by entry, keep going after a failure and report
//! how many entries made it plus the first error.

use crate::error::{RecordError, Result, TableError};
use crate::record::Record;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a table is pinned and the shape it must have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub path: PathBuf,
    pub name: String,
    pub key_size: usize,
    pub value_size: usize,
    pub capacity: u32,
}

impl TableSpec {
    pub fn new(
        path: impl Into<PathBuf>,
        name: &str,
        key_size: usize,
        value_size: usize,
        capacity: u32,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.to_string(),
            key_size,
            value_size,
            capacity,
        }
    }

    /// Spec whose sizes come from the record layouts.
    pub fn for_records<K: Record, V: Record>(
        path: impl Into<PathBuf>,
        name: &str,
        capacity: u32,
    ) -> Self {
        Self::new(path, name, K::SIZE, V::SIZE, capacity)
    }

    /// Directory the pin lives in.
    pub fn pin_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    pub(crate) fn check_key(&self, actual: usize) -> Result<()> {
        self.check("key", self.key_size, actual)
    }

    pub(crate) fn check_value(&self, actual: usize) -> Result<()> {
        self.check("value", self.value_size, actual)
    }

    fn check(&self, field: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(TableError::SizeMismatch {
                table: self.name.clone(),
                field,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Byte-level access to one table.
pub trait RawTable: Send {
    fn spec(&self) -> &TableSpec;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or replace.
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns whether the key was present.
    fn remove(&mut self, key: &[u8]) -> Result<bool>;

    fn keys(&self) -> Result<Vec<Vec<u8>>>;
}

/// Opens tables at their pin paths, creating them when missing.
pub trait TableBackend {
    /// Create the directory a pin will live in.
    fn ensure_pin_dir(&self, dir: &Path) -> std::io::Result<()>;

    /// Attach to the table pinned at `spec.path`, or create and pin it.
    ///
    /// `K` and `V` are the key and value widths; they must agree with the
    /// spec. A table already pinned with a different shape is a
    /// `SizeMismatch`.
    fn get_or_create<const K: usize, const V: usize>(
        &self,
        spec: &TableSpec,
    ) -> Result<Box<dyn RawTable>>;
}

/// Result of a best-effort batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Entries actually written or removed.
    pub applied: usize,
    pub first_error: Option<TableError>,
}

impl BatchOutcome {
    fn fail(&mut self, err: TableError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.first_error.is_none()
    }

    /// `Ok(applied)` or a `PartialBatch` carrying the first error.
    pub fn into_result(self) -> Result<usize> {
        match self.first_error {
            None => Ok(self.applied),
            Some(source) => Err(TableError::PartialBatch {
                applied: self.applied,
                source: Box::new(source),
            }),
        }
    }
}

/// What [`Table::reconcile`] changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub written: usize,
    pub removed: usize,
}

/// A table of `K -> V` records.
pub struct Table<K, V> {
    raw: Box<dyn RawTable>,
    _records: PhantomData<fn() -> (K, V)>,
}

impl<K: Record, V: Record> Table<K, V> {
    pub fn new(raw: Box<dyn RawTable>) -> Self {
        Self {
            raw,
            _records: PhantomData,
        }
    }

    pub fn spec(&self) -> &TableSpec {
        self.raw.spec()
    }

    pub fn name(&self) -> &str {
        &self.raw.spec().name
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        let bytes = key.encode();
        self.spec().check_key(bytes.len())?;
        Ok(bytes)
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>> {
        let bytes = value.encode();
        self.spec().check_value(bytes.len())?;
        Ok(bytes)
    }

    fn decode_error(&self, field: &'static str, err: RecordError) -> TableError {
        match err {
            RecordError::Length { expected, actual } => TableError::SizeMismatch {
                table: self.name().to_string(),
                field,
                expected,
                actual,
            },
            source => TableError::Corrupt {
                table: self.name().to_string(),
                source,
            },
        }
    }

    /// Look up a key. A miss is `TableError::NotFound`, never a zero record.
    pub fn get(&self, key: &K) -> Result<V> {
        let key = self.encode_key(key)?;
        match self.raw.lookup(&key)? {
            Some(bytes) => V::decode(&bytes).map_err(|e| self.decode_error("value", e)),
            None => Err(TableError::NotFound {
                table: self.name().to_string(),
            }),
        }
    }

    /// Upsert one entry. Nothing is written if either record has the wrong
    /// width for this table.
    pub fn set(&mut self, key: &K, value: &V) -> Result<()> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        self.raw.update(&key, &value)
    }

    /// Upsert many entries, continuing past failures.
    ///
    /// Mismatched slice lengths are rejected before anything is written.
    pub fn batch_set(&mut self, keys: &[K], values: &[V]) -> Result<BatchOutcome> {
        if keys.len() != values.len() {
            return Err(TableError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }

        let mut outcome = BatchOutcome::default();
        for (key, value) in keys.iter().zip(values) {
            match self.set(key, value) {
                Ok(()) => outcome.applied += 1,
                Err(e) => outcome.fail(e),
            }
        }
        Ok(outcome)
    }

    /// Remove one entry. Removing an absent key succeeds.
    pub fn delete(&mut self, key: &K) -> Result<()> {
        let key = self.encode_key(key)?;
        self.raw.remove(&key)?;
        Ok(())
    }

    /// Remove many entries; `applied` counts keys that were present.
    pub fn batch_delete(&mut self, keys: &[K]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for key in keys {
            match self.encode_key(key) {
                Ok(bytes) => self.remove_into(&bytes, &mut outcome),
                Err(e) => outcome.fail(e),
            }
        }
        outcome
    }

    fn remove_into(&mut self, key: &[u8], outcome: &mut BatchOutcome) {
        match self.raw.remove(key) {
            Ok(true) => outcome.applied += 1,
            Ok(false) => {}
            Err(e) => outcome.fail(e),
        }
    }

    /// Clear the table by snapshotting its keys and deleting the snapshot.
    ///
    /// Two phases, not atomic: keys inserted after the snapshot survive, keys
    /// deleted by someone else in between are skipped without error.
    pub fn delete_all(&mut self) -> Result<BatchOutcome> {
        let snapshot = self.raw.keys()?;
        let mut outcome = BatchOutcome::default();
        for key in &snapshot {
            self.remove_into(key, &mut outcome);
        }
        debug!(
            table = %self.name(),
            snapshot = snapshot.len(),
            removed = outcome.applied,
            "Cleared table"
        );
        Ok(outcome)
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        self.raw
            .keys()?
            .iter()
            .map(|k| K::decode(k).map_err(|e| self.decode_error("key", e)))
            .collect()
    }

    /// Decoded snapshot of every entry. Keys removed while iterating are
    /// left out.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        for raw_key in self.raw.keys()? {
            let Some(raw_value) = self.raw.lookup(&raw_key)? else {
                continue;
            };
            let key = K::decode(&raw_key).map_err(|e| self.decode_error("key", e))?;
            let value = V::decode(&raw_value).map_err(|e| self.decode_error("value", e))?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.raw.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Make the table hold exactly `desired`.
    ///
    /// Stale keys go first so a table near capacity has room for the new
    /// set. Fails with `PartialBatch` if any step did not fully apply.
    pub fn reconcile(&mut self, desired: &[(K, V)]) -> Result<ReconcileReport> {
        let mut wanted = HashSet::with_capacity(desired.len());
        for (key, _) in desired {
            wanted.insert(self.encode_key(key)?);
        }

        let mut removed = BatchOutcome::default();
        for key in self.raw.keys()? {
            if !wanted.contains(&key) {
                self.remove_into(&key, &mut removed);
            }
        }
        let removed = removed.into_result()?;

        let mut written = BatchOutcome::default();
        for (key, value) in desired {
            match self.set(key, value) {
                Ok(()) => written.applied += 1,
                Err(e) => written.fail(e),
            }
        }
        let written = written.into_result()?;

        debug!(table = %self.name(), written, removed, "Reconciled table");
        Ok(ReconcileReport { written, removed })
    }
}
