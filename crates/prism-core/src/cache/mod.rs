//! Column cache.
//!
//! One JSON file per derived column, named by the column's canonical string.
//! Each file holds the column identity and its values keyed by row id, so a
//! cached column can be spliced into any table that shares row ids with it.

pub mod documents;
pub(crate) mod io;

use crate::column::{ColumnIdentity, ColumnKind};
use crate::errors::{PrismError, PrismResult};
use crate::table::ColumnStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use documents::DocumentStore;

/// Extension of column files.
pub const COLUMN_EXTENSION: &str = "json";

const POSTDISTILL_PREFIX: &str = "POSTDISTILL";

/// On-disk form of a cached column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSeries {
    pub column: ColumnIdentity,
    pub values: BTreeMap<String, Value>,
}

impl CachedSeries {
    pub fn missing(&self) -> usize {
        self.values.values().filter(|v| v.is_null()).count()
    }
}

/// How much of a column the cache holds for the current rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    /// Row positions still holding the missing sentinel.
    Partial { missing: Vec<usize> },
    /// Nothing usable on disk.
    Absent,
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

/// Summary row for `prism cache list`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub column: ColumnIdentity,
    pub rows: usize,
    pub missing: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ColumnCache {
    dir: PathBuf,
}

impl ColumnCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, column: &ColumnIdentity) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(&column.canonical()), COLUMN_EXTENSION))
    }

    /// Read a cached column. A missing file is `None`; so is a file that does
    /// not decode, which is logged and left for the next persist to replace.
    pub fn read(&self, column: &ColumnIdentity) -> PrismResult<Option<CachedSeries>> {
        let path = self.path_for(column);
        let Some(bytes) = io::read_optional(&path)? else {
            debug!(column = %column, "cache miss");
            return Ok(None);
        };
        match serde_json::from_slice::<CachedSeries>(&bytes) {
            Ok(series) if series.column == *column => Ok(Some(series)),
            Ok(series) => {
                warn!(
                    column = %column,
                    found = %series.column,
                    "cache file holds a different column, ignoring"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(column = %column, path = %path.display(), error = %e, "torn cache file, ignoring");
                Ok(None)
            }
        }
    }

    /// Splice a cached column into `table`. Rows the cache does not know
    /// become missing. Returns whether anything was loaded.
    pub fn load(&self, column: &ColumnIdentity, table: &mut ColumnStore) -> PrismResult<bool> {
        match self.read(column)? {
            Some(series) => {
                table.splice(column.clone(), &series.values);
                debug!(column = %column, rows = series.values.len(), "loaded cached column");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load `column` and classify it against the rows of `table`. A column
    /// missing on every row counts as never computed.
    pub fn completeness(
        &self,
        column: &ColumnIdentity,
        table: &mut ColumnStore,
    ) -> PrismResult<Completeness> {
        if !self.load(column, table)? {
            return Ok(Completeness::Absent);
        }
        let missing = table.missing_rows(column);
        Ok(if missing.is_empty() {
            Completeness::Complete
        } else if missing.len() == table.len() {
            Completeness::Absent
        } else {
            Completeness::Partial { missing }
        })
    }

    /// Splice every cached column [derived](ColumnIdentity::derived) from
    /// `column` into `table` and return their identities.
    pub fn load_derived(
        &self,
        column: &ColumnIdentity,
        table: &mut ColumnStore,
    ) -> PrismResult<Vec<ColumnIdentity>> {
        let head = file_stem(&format!("{}{}.", column.kind.prefix(), column.name));
        let mut loaded = Vec::new();
        for stem in self.column_stems(|name| name.starts_with(head.as_str()))? {
            let path = self.dir.join(format!("{}.{}", stem, COLUMN_EXTENSION));
            let Some(bytes) = io::read_optional(&path)? else {
                continue;
            };
            match serde_json::from_slice::<CachedSeries>(&bytes) {
                Ok(series) if series.column.is_derived_from(column) => {
                    table.splice(series.column.clone(), &series.values);
                    debug!(column = %series.column, "loaded derived column");
                    loaded.push(series.column);
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "torn cache file, ignoring"),
            }
        }
        loaded.sort();
        Ok(loaded)
    }

    pub fn is_complete(&self, column: &ColumnIdentity, table: &mut ColumnStore) -> PrismResult<bool> {
        Ok(self.completeness(column, table)?.is_complete())
    }

    /// Persist a column of `table`.
    pub fn persist(&self, column: &ColumnIdentity, table: &ColumnStore) -> PrismResult<()> {
        let values = table.keyed_series(column).ok_or_else(|| {
            PrismError::cache(format!("column {} is not in the table", column))
        })?;
        self.persist_series(column, values)
    }

    pub fn persist_series(
        &self,
        column: &ColumnIdentity,
        values: BTreeMap<String, Value>,
    ) -> PrismResult<()> {
        let series = CachedSeries {
            column: column.clone(),
            values,
        };
        let bytes = serde_json::to_vec(&series)
            .map_err(|e| PrismError::cache(format!("failed to encode {}: {}", column, e)))?;
        io::write_atomic_impl(&self.path_for(column), &bytes)?;
        debug!(column = %column, rows = series.values.len(), "persisted column");
        Ok(())
    }

    /// Postdistill columns for `model` and `prompt_id` found by scanning the
    /// directory. Requirement score and rationale columns are left out.
    ///
    /// Recovers columns from runs whose functions are no longer registered.
    /// The name is whatever sits between the kind prefix and `model_prompt`.
    pub fn discover_postdistill(&self, model: &str, prompt_id: &str) -> PrismResult<Vec<ColumnIdentity>> {
        let matcher = globset::Glob::new(&format!("{}*.{}", POSTDISTILL_PREFIX, COLUMN_EXTENSION))
            .map_err(|e| PrismError::cache(format!("invalid glob: {}", e)))?
            .compile_matcher();
        let suffix = file_stem(&format!("{}_{}", model, prompt_id));

        let mut found = Vec::new();
        for stem in self.column_stems(|name| matcher.is_match(name))? {
            let Some(rest) = stem.strip_prefix(POSTDISTILL_PREFIX) else {
                continue;
            };
            let Some(name) = rest.strip_suffix(suffix.as_str()) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let column = ColumnIdentity::postdistill(unescape_stem(name), model, prompt_id);
            if !column.is_requirement_column() {
                found.push(column);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Every decodable column file in the directory.
    pub fn list(&self) -> PrismResult<Vec<CacheEntry>> {
        let mut out = Vec::new();
        for stem in self.column_stems(is_column_file)? {
            let path = self.dir.join(format!("{}.{}", stem, COLUMN_EXTENSION));
            let Some(bytes) = io::read_optional(&path)? else {
                continue;
            };
            match serde_json::from_slice::<CachedSeries>(&bytes) {
                Ok(series) => out.push(CacheEntry {
                    rows: series.values.len(),
                    missing: series.missing(),
                    column: series.column,
                    path,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping undecodable cache file"),
            }
        }
        out.sort_by(|a, b| a.column.cmp(&b.column));
        Ok(out)
    }

    pub fn remove(&self, column: &ColumnIdentity) -> PrismResult<bool> {
        match std::fs::remove_file(self.path_for(column)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every column file, and the auxiliary documents too when
    /// `include_documents` is set. Returns the number of files removed.
    pub fn clear(&self, include_documents: bool) -> PrismResult<usize> {
        let mut removed = 0;
        for stem in self.column_stems(|name| {
            is_column_file(name) || (include_documents && documents::is_document_file(name))
        })? {
            let path = self.dir.join(format!("{}.{}", stem, COLUMN_EXTENSION));
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(dir = %self.dir.display(), removed, "cleared cache");
        Ok(removed)
    }

    fn column_stems(&self, keep: impl Fn(&str) -> bool) -> PrismResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{}", COLUMN_EXTENSION);
        let mut stems = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !keep(&name) {
                continue;
            }
            if let Some(stem) = name.strip_suffix(&suffix) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }
}

fn is_column_file(name: &str) -> bool {
    name.ends_with(&format!(".{}", COLUMN_EXTENSION))
        && [
            ColumnKind::Predistill,
            ColumnKind::Output,
            ColumnKind::Embedding,
            ColumnKind::Postdistill,
        ]
        .iter()
        .any(|k| name.starts_with(k.prefix()))
}

/// Canonical strings may hold path separators (model names like
/// `org/model`); escape them for use as a file name.
fn file_stem(canonical: &str) -> String {
    let mut out = String::with_capacity(canonical.len());
    for c in canonical.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_stem(stem: &str) -> String {
    stem.replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%25", "%")
}
