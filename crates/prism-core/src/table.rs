//! Row-indexed column store.
//!
//! Every column is a `Vec<Value>` aligned with the row index. `Value::Null` is
//! the missing-value sentinel: a derived column is complete once it holds no
//! nulls. Rows are fixed at construction; columns only get added or filled.

use crate::column::{push_unique, ColumnIdentity, MetadataType};
use crate::errors::{PrismError, PrismResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Column name used for synthesized row ids.
pub const SYNTHETIC_ID_COLUMN: &str = "index";
/// Column name used when the data column would otherwise alias the id column.
pub const DUPLICATED_DATA_COLUMN: &str = "data";

const NOMINAL_MAX_DISTINCT: usize = 20;

#[derive(Debug, Clone)]
pub struct Column {
    pub identity: ColumnIdentity,
    pub metadata_type: MetadataType,
    pub values: Vec<Value>,
}

impl Column {
    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }
}

/// Which raw columns play the id, data and label roles.
#[derive(Debug, Clone, Default)]
pub struct TableRoles {
    pub id_column: String,
    pub data_column: String,
    pub label_column: String,
}

/// Roles resolved against the built table.
#[derive(Debug, Clone)]
pub struct ResolvedRoles {
    pub id: ColumnIdentity,
    pub data: ColumnIdentity,
    pub label: ColumnIdentity,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnStore {
    row_keys: Vec<String>,
    row_index: HashMap<String, usize>,
    columns: BTreeMap<String, Column>,
    order: Vec<ColumnIdentity>,
}

impl ColumnStore {
    /// Empty table over the given row keys. Keys must be unique.
    pub fn with_rows(row_keys: Vec<String>) -> PrismResult<Self> {
        let mut row_index = HashMap::with_capacity(row_keys.len());
        for (i, key) in row_keys.iter().enumerate() {
            if row_index.insert(key.clone(), i).is_some() {
                return Err(PrismError::config(format!("duplicate row id '{}'", key)));
            }
        }
        Ok(Self {
            row_keys,
            row_index,
            columns: BTreeMap::new(),
            order: Vec::new(),
        })
    }

    /// Build the table from raw JSON records.
    ///
    /// An empty id column synthesizes an `index` column of row ordinals. A data
    /// column equal to the id column is copied into `data` so the two differ.
    pub fn from_records(
        records: Vec<Map<String, Value>>,
        roles: &TableRoles,
    ) -> PrismResult<(Self, ResolvedRoles)> {
        let mut names: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for record in &records {
            for key in record.keys() {
                if seen.insert(key.clone()) {
                    names.push(key.clone());
                }
            }
        }

        let id_name = if roles.id_column.is_empty() {
            SYNTHETIC_ID_COLUMN.to_string()
        } else {
            if !seen.contains(&roles.id_column) && !records.is_empty() {
                return Err(PrismError::config(format!(
                    "id column '{}' not present in records",
                    roles.id_column
                )));
            }
            roles.id_column.clone()
        };

        let row_keys: Vec<String> = records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                if roles.id_column.is_empty() {
                    i.to_string()
                } else {
                    r.get(&id_name).map(value_as_key).unwrap_or_default()
                }
            })
            .collect();
        let mut store = Self::with_rows(row_keys)?;

        if roles.id_column.is_empty() {
            let values = (0..records.len()).map(|i| Value::from(i as u64)).collect();
            store.insert(ColumnIdentity::metadata(SYNTHETIC_ID_COLUMN), values)?;
        }
        for name in &names {
            let values = records
                .iter()
                .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            store.insert(ColumnIdentity::metadata(name.as_str()), values)?;
        }

        let data = if roles.data_column.is_empty() {
            ColumnIdentity::metadata("")
        } else if roles.data_column == id_name {
            let values = store
                .values(&ColumnIdentity::metadata(id_name.as_str()))
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            store.insert(ColumnIdentity::metadata(DUPLICATED_DATA_COLUMN), values)?;
            ColumnIdentity::metadata(DUPLICATED_DATA_COLUMN)
        } else {
            ColumnIdentity::metadata(roles.data_column.as_str())
        };

        let resolved = ResolvedRoles {
            id: ColumnIdentity::metadata(id_name),
            data,
            label: ColumnIdentity::metadata(roles.label_column.as_str()),
        };
        Ok((store, resolved))
    }

    pub fn len(&self) -> usize {
        self.row_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_keys.is_empty()
    }

    pub fn row_keys(&self) -> &[String] {
        &self.row_keys
    }

    pub fn position(&self, row_key: &str) -> Option<usize> {
        self.row_index.get(row_key).copied()
    }

    /// Columns in insertion order.
    pub fn identities(&self) -> &[ColumnIdentity] {
        &self.order
    }

    pub fn contains(&self, identity: &ColumnIdentity) -> bool {
        self.columns.contains_key(&identity.canonical())
    }

    pub fn column(&self, identity: &ColumnIdentity) -> Option<&Column> {
        self.columns.get(&identity.canonical())
    }

    /// Look a column up by its canonical string.
    pub fn column_by_name(&self, canonical: &str) -> Option<&Column> {
        self.columns.get(canonical)
    }

    pub fn values(&self, identity: &ColumnIdentity) -> Option<&[Value]> {
        self.column(identity).map(|c| c.values.as_slice())
    }

    pub fn cell(&self, identity: &ColumnIdentity, row: usize) -> Option<&Value> {
        self.column(identity).and_then(|c| c.values.get(row))
    }

    /// Insert or replace a full column. Length must match the row count.
    pub fn insert(&mut self, identity: ColumnIdentity, values: Vec<Value>) -> PrismResult<()> {
        if values.len() != self.len() {
            return Err(PrismError::Stage {
                column: identity.to_string(),
                message: format!(
                    "column has {} values but table has {} rows",
                    values.len(),
                    self.len()
                ),
            });
        }
        let metadata_type = infer_metadata_type(&values);
        push_unique(&mut self.order, identity.clone());
        self.columns.insert(
            identity.canonical(),
            Column {
                identity,
                metadata_type,
                values,
            },
        );
        Ok(())
    }

    /// Splice a keyed series into the table. Rows absent from `series` become
    /// null; keys that are not rows of this table are ignored.
    pub fn splice(&mut self, identity: ColumnIdentity, series: &BTreeMap<String, Value>) {
        let values: Vec<Value> = self
            .row_keys
            .iter()
            .map(|k| series.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        let metadata_type = infer_metadata_type(&values);
        push_unique(&mut self.order, identity.clone());
        self.columns.insert(
            identity.canonical(),
            Column {
                identity,
                metadata_type,
                values,
            },
        );
    }

    /// Make sure `identity` exists, filling it with nulls if it does not.
    pub fn ensure_column(&mut self, identity: &ColumnIdentity) {
        if !self.contains(identity) {
            let nulls = vec![Value::Null; self.len()];
            push_unique(&mut self.order, identity.clone());
            self.columns.insert(
                identity.canonical(),
                Column {
                    identity: identity.clone(),
                    metadata_type: MetadataType::Other,
                    values: nulls,
                },
            );
        }
    }

    /// Fill one cell in place. Creates the column if needed.
    ///
    /// The column's metadata type is left as it was; call
    /// [`ColumnStore::refresh_metadata_type`] once a run of writes is done.
    pub fn set_cell(&mut self, identity: &ColumnIdentity, row: usize, value: Value) -> bool {
        if row >= self.len() {
            return false;
        }
        self.ensure_column(identity);
        match self.columns.get_mut(&identity.canonical()) {
            Some(col) => {
                col.values[row] = value;
                true
            }
            None => false,
        }
    }

    /// Re-infer the metadata type of a column from its current values.
    pub fn refresh_metadata_type(&mut self, identity: &ColumnIdentity) {
        if let Some(col) = self.columns.get_mut(&identity.canonical()) {
            col.metadata_type = infer_metadata_type(&col.values);
        }
    }

    /// Copy of this table holding only `columns`, over the same rows.
    /// Columns the table does not have are skipped.
    pub fn project(&self, columns: &[ColumnIdentity]) -> ColumnStore {
        let mut out = ColumnStore {
            row_keys: self.row_keys.clone(),
            row_index: self.row_index.clone(),
            columns: BTreeMap::new(),
            order: Vec::new(),
        };
        for identity in columns {
            if let Some(col) = self.column(identity) {
                push_unique(&mut out.order, identity.clone());
                out.columns.insert(identity.canonical(), col.clone());
            }
        }
        out
    }

    /// Positions of rows holding the missing sentinel. A column that does not
    /// exist is missing everywhere.
    pub fn missing_rows(&self, identity: &ColumnIdentity) -> Vec<usize> {
        match self.column(identity) {
            Some(col) => col
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_null())
                .map(|(i, _)| i)
                .collect(),
            None => (0..self.len()).collect(),
        }
    }

    /// Column keyed by row id, the shape persisted to the cache.
    pub fn keyed_series(&self, identity: &ColumnIdentity) -> Option<BTreeMap<String, Value>> {
        self.column(identity).map(|col| {
            self.row_keys
                .iter()
                .cloned()
                .zip(col.values.iter().cloned())
                .collect()
        })
    }

    /// Sub-table holding only `rows`, in the given order.
    pub fn take(&self, rows: &[usize]) -> ColumnStore {
        let row_keys: Vec<String> = rows
            .iter()
            .filter_map(|&i| self.row_keys.get(i).cloned())
            .collect();
        let row_index = row_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| {
                let values = rows
                    .iter()
                    .filter_map(|&i| col.values.get(i).cloned())
                    .collect();
                (
                    name.clone(),
                    Column {
                        identity: col.identity.clone(),
                        metadata_type: col.metadata_type,
                        values,
                    },
                )
            })
            .collect();
        ColumnStore {
            row_keys,
            row_index,
            columns,
            order: self.order.clone(),
        }
    }

    /// Row `i` as a JSON object restricted to `columns`.
    pub fn record(&self, row: usize, columns: &[ColumnIdentity]) -> Map<String, Value> {
        columns
            .iter()
            .map(|c| {
                let v = self.cell(c, row).cloned().unwrap_or(Value::Null);
                (c.canonical(), v)
            })
            .collect()
    }
}

/// Row ids are compared as strings whatever their JSON type.
pub fn value_as_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Classify a column by its non-null values.
pub fn infer_metadata_type(values: &[Value]) -> MetadataType {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        return MetadataType::Other;
    }
    if present.iter().all(|v| v.is_boolean()) {
        return MetadataType::Boolean;
    }
    let distinct: HashSet<String> = present.iter().map(|v| v.to_string()).collect();
    if present.iter().all(|v| v.is_number()) {
        return if distinct.len() > NOMINAL_MAX_DISTINCT {
            MetadataType::Continuous
        } else {
            MetadataType::Nominal
        };
    }
    if present.iter().all(|v| {
        v.as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
    }) {
        return MetadataType::Datetime;
    }
    if present.iter().all(|v| v.is_string()) && distinct.len() <= NOMINAL_MAX_DISTINCT {
        return MetadataType::Nominal;
    }
    MetadataType::Other
}
