use crate::cache::ColumnCache;
use crate::column::ColumnIdentity;
use crate::errors::{PrismError, PrismResult};
use crate::registry::{DistillFunction, DistillReturn, FunctionOptions, ModelFunction};
use crate::table::ColumnStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What a task computes.
#[derive(Clone)]
pub enum Job {
    Distill(Arc<dyn DistillFunction>),
    /// Inference also yields the embedding column when the model returns one.
    Inference {
        function: Arc<dyn ModelFunction>,
        embedding: ColumnIdentity,
    },
}

/// One unit of work: compute `column` over the whole of `table`.
#[derive(Clone)]
pub struct Task {
    pub job: Job,
    pub column: ColumnIdentity,
    pub options: FunctionOptions,
    pub table: Arc<ColumnStore>,
    pub batch_size: usize,
    /// Position in the work list; results merge in this order.
    pub ordinal: usize,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("column", &self.column)
            .field("ordinal", &self.ordinal)
            .field("rows", &self.table.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub ordinal: usize,
    pub columns: Vec<(ColumnIdentity, Vec<Value>)>,
}

impl Task {
    /// Run the job in `batch_size` row chunks, persist every produced column
    /// and hand the values back for merging.
    ///
    /// A distill function may return columns derived from the task column
    /// next to its own; rows of a batch that left one out are null.
    pub fn run(&self, cache: &ColumnCache) -> PrismResult<TaskOutput> {
        let rows = self.table.len();
        let batch = self.batch_size.max(1);
        let mut options = self.options.clone();
        options.column = Some(self.column.clone());
        let mut primary: Vec<Value> = Vec::with_capacity(rows);
        let mut derived: Vec<(ColumnIdentity, Vec<Value>)> = Vec::new();
        let mut embedding: Vec<Value> = Vec::new();
        let mut any_embedding = false;

        let mut start = 0;
        while start < rows {
            let end = (start + batch).min(rows);
            let chunk = if start == 0 && end == rows {
                None
            } else {
                Some(self.table.take(&(start..end).collect::<Vec<_>>()))
            };
            let table = chunk.as_ref().unwrap_or(&*self.table);

            match &self.job {
                Job::Distill(function) => {
                    let out = function
                        .call(table, &options)
                        .map_err(|e| PrismError::stage(&self.column, e))?;
                    self.absorb(out, &mut primary, &mut derived, start, end)?;
                }
                Job::Inference { function, .. } => {
                    let out = function
                        .call(table, &options)
                        .map_err(|e| PrismError::stage(&self.column, e))?;
                    self.check_len(out.model_output.len(), end - start)?;
                    primary.extend(out.model_output);
                    match out.embedding {
                        Some(values) => {
                            self.check_len(values.len(), end - start)?;
                            any_embedding = true;
                            embedding.extend(values);
                        }
                        None => embedding.extend(std::iter::repeat(Value::Null).take(end - start)),
                    }
                }
            }
            debug!(column = %self.column, start, end, "computed batch");
            start = end;
        }

        let mut columns = vec![(self.column.clone(), primary)];
        columns.extend(derived);
        if let Job::Inference { embedding: id, .. } = &self.job {
            if any_embedding {
                columns.push((id.clone(), embedding));
            }
        }
        for (column, values) in &columns {
            cache.persist_series(column, self.keyed(values))?;
        }
        Ok(TaskOutput {
            ordinal: self.ordinal,
            columns,
        })
    }

    /// Append one batch of distill output. Every series is checked against
    /// the batch length; derived series missing from earlier batches are
    /// back-filled with nulls.
    fn absorb(
        &self,
        out: DistillReturn,
        primary: &mut Vec<Value>,
        derived: &mut Vec<(ColumnIdentity, Vec<Value>)>,
        start: usize,
        end: usize,
    ) -> PrismResult<()> {
        let mut own = false;
        for (column, values) in out.columns {
            self.check_len(values.len(), end - start)?;
            if column == self.column {
                if own {
                    return Err(PrismError::stage(&self.column, "function returned its column twice"));
                }
                own = true;
                primary.extend(values);
                continue;
            }
            if !column.is_derived_from(&self.column) {
                return Err(PrismError::stage(
                    &self.column,
                    format!("function returned unrelated column {}", column),
                ));
            }
            let series = match derived.iter().position(|(c, _)| *c == column) {
                Some(i) => &mut derived[i].1,
                None => {
                    let last = derived.len();
                    derived.push((column, vec![Value::Null; start]));
                    &mut derived[last].1
                }
            };
            if series.len() != start {
                return Err(PrismError::stage(&self.column, "function returned a column twice"));
            }
            series.extend(values);
        }
        if !own {
            return Err(PrismError::stage(&self.column, "function returned no values for its column"));
        }
        for (_, series) in derived.iter_mut() {
            series.resize(end, Value::Null);
        }
        Ok(())
    }

    fn keyed(&self, values: &[Value]) -> BTreeMap<String, Value> {
        self.table
            .row_keys()
            .iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect()
    }

    fn check_len(&self, got: usize, want: usize) -> PrismResult<()> {
        if got != want {
            return Err(PrismError::Stage {
                column: self.column.to_string(),
                message: format!("function returned {} values for {} rows", got, want),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelReturn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(n: usize) -> Arc<ColumnStore> {
        Arc::new(ColumnStore::with_rows((0..n).map(|i| format!("r{}", i)).collect()).unwrap())
    }

    #[test]
    fn runs_in_batches_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ColumnCache::new(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let f = move |t: &ColumnStore, o: &FunctionOptions| -> anyhow::Result<DistillReturn> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(DistillReturn::single(
                o,
                t.row_keys().iter().map(|k| json!(k.len())).collect(),
            ))
        };
        let task = Task {
            job: Job::Distill(Arc::new(f)),
            column: ColumnIdentity::predistill("keylen"),
            options: FunctionOptions::default(),
            table: table(5),
            batch_size: 2,
            ordinal: 0,
        };
        let out = task.run(&cache).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.columns[0].1.len(), 5);
        assert!(cache.read(&task.column).unwrap().is_some());
    }

    #[test]
    fn wrong_length_is_a_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ColumnCache::new(dir.path());
        let f = |_: &ColumnStore, o: &FunctionOptions| -> anyhow::Result<DistillReturn> {
            Ok(DistillReturn::single(o, vec![]))
        };
        let task = Task {
            job: Job::Distill(Arc::new(f)),
            column: ColumnIdentity::predistill("broken"),
            options: FunctionOptions::default(),
            table: table(2),
            batch_size: 10,
            ordinal: 0,
        };
        assert!(matches!(task.run(&cache), Err(PrismError::Stage { .. })));
        assert!(cache.read(&task.column).unwrap().is_none());
    }

    fn distill_task(f: impl DistillFunction + 'static, rows: usize, batch_size: usize) -> Task {
        Task {
            job: Job::Distill(Arc::new(f)),
            column: ColumnIdentity::predistill("stats"),
            options: FunctionOptions::default(),
            table: table(rows),
            batch_size,
            ordinal: 0,
        }
    }

    #[test]
    fn distill_may_return_derived_columns() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ColumnCache::new(dir.path());
        let f = |t: &ColumnStore, o: &FunctionOptions| -> anyhow::Result<DistillReturn> {
            let own = o.column.clone().unwrap();
            let first = t.row_keys()[0].clone();
            let out = DistillReturn::single(o, vec![json!(1); t.len()]);
            // only the batch starting at r2 reports the derived column
            Ok(if first == "r2" {
                out.with(own.derived("twice"), vec![json!(2); t.len()])
            } else {
                out
            })
        };
        let task = distill_task(f, 5, 2);
        let out = task.run(&cache).unwrap();
        let twice = ColumnIdentity::predistill("stats").derived("twice");
        assert_eq!(out.columns.len(), 2);
        assert_eq!(out.columns[1].0, twice);
        assert_eq!(
            out.columns[1].1,
            vec![Value::Null, Value::Null, json!(2), json!(2), Value::Null]
        );
        assert!(cache.read(&twice).unwrap().is_some());
    }

    #[test]
    fn unrelated_or_missing_columns_are_stage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ColumnCache::new(dir.path());
        let stray = |t: &ColumnStore, o: &FunctionOptions| -> anyhow::Result<DistillReturn> {
            Ok(DistillReturn::single(o, vec![json!(1); t.len()])
                .with(ColumnIdentity::predistill("other"), vec![json!(1); t.len()]))
        };
        assert!(matches!(distill_task(stray, 2, 10).run(&cache), Err(PrismError::Stage { .. })));

        let derived_only = |t: &ColumnStore, o: &FunctionOptions| -> anyhow::Result<DistillReturn> {
            let own = o.column.clone().unwrap();
            Ok(DistillReturn::default().with(own.derived("x"), vec![json!(1); t.len()]))
        };
        assert!(matches!(
            distill_task(derived_only, 2, 10).run(&cache),
            Err(PrismError::Stage { .. })
        ));
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn inference_emits_embedding_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ColumnCache::new(dir.path());
        let f = |t: &ColumnStore, _: &FunctionOptions| -> anyhow::Result<ModelReturn> {
            Ok(ModelReturn {
                model_output: vec![json!("out"); t.len()],
                embedding: Some(vec![json!([0.1, 0.2]); t.len()]),
            })
        };
        let task = Task {
            job: Job::Inference {
                function: Arc::new(f),
                embedding: ColumnIdentity::embedding("m", "v1"),
            },
            column: ColumnIdentity::output("m", "v1"),
            options: FunctionOptions::default(),
            table: table(3),
            batch_size: 10,
            ordinal: 4,
        };
        let out = task.run(&cache).unwrap();
        assert_eq!(out.ordinal, 4);
        assert_eq!(out.columns.len(), 2);
        assert_eq!(out.columns[1].0, ColumnIdentity::embedding("m", "v1"));
    }
}
