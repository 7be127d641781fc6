//! Work-list execution for the non-evaluation stages.
//!
//! Both modes run the same tasks and persist through the same code path, so
//! the cache ends up byte-identical whichever mode ran.

mod task;

pub use task::{Job, Task, TaskOutput};

use crate::cache::ColumnCache;
use crate::column::ColumnIdentity;
use crate::config::ExecutionMode;
use crate::errors::{PrismError, PrismResult};
use crate::table::ColumnStore;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Results of one dispatch, in work-list order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outputs: Vec<TaskOutput>,
    /// Tasks whose function failed. Only populated in parallel mode.
    pub failed: Vec<(ColumnIdentity, PrismError)>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    mode: ExecutionMode,
    workers: usize,
    cache: ColumnCache,
}

impl Dispatcher {
    pub fn new(mode: ExecutionMode, workers: usize, cache: ColumnCache) -> Self {
        Self {
            mode,
            workers: workers.max(1),
            cache,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run every task. In parallel mode a failing task drops only its own
    /// columns; in sequential mode the first failure aborts the dispatch.
    pub async fn execute(&self, tasks: Vec<Task>) -> PrismResult<DispatchReport> {
        if tasks.is_empty() {
            return Ok(DispatchReport::default());
        }
        debug!(tasks = tasks.len(), mode = ?self.mode, "dispatching");
        match self.mode {
            ExecutionMode::Sequential => self.execute_sequential(tasks),
            ExecutionMode::Parallel => self.execute_parallel(tasks).await,
        }
    }

    fn execute_sequential(&self, tasks: Vec<Task>) -> PrismResult<DispatchReport> {
        let mut report = DispatchReport::default();
        for task in tasks {
            report.outputs.push(task.run(&self.cache)?);
        }
        Ok(report)
    }

    async fn execute_parallel(&self, tasks: Vec<Task>) -> PrismResult<DispatchReport> {
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();

        for task in tasks {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PrismError::Stage {
                    column: task.column.to_string(),
                    message: format!("worker pool closed: {}", e),
                })?;
            let cache = self.cache.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let column = task.column.clone();
                let result = tokio::task::spawn_blocking(move || task.run(&cache))
                    .await
                    .unwrap_or_else(|e| Err(PrismError::stage(&column, format!("worker panicked: {}", e))));
                (column, result)
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(output))) => report.outputs.push(output),
                Ok((column, Err(e))) => {
                    warn!(column = %column, error = %e, "task failed, skipping column");
                    report.failed.push((column, e));
                }
                Err(e) => warn!(error = %e, "worker join failed"),
            }
        }
        report.outputs.sort_by_key(|o| o.ordinal);
        Ok(report)
    }
}

/// Merge task results into `table` in work-list order. Returns the columns
/// that were added or replaced.
pub fn merge_outputs(
    table: &mut ColumnStore,
    outputs: Vec<TaskOutput>,
) -> PrismResult<Vec<ColumnIdentity>> {
    let mut merged = Vec::new();
    for output in outputs {
        for (column, values) in output.columns {
            table.insert(column.clone(), values)?;
            merged.push(column);
        }
    }
    Ok(merged)
}
