//! Registered computation functions.
//!
//! Callers declare the stage of each function when registering it; nothing is
//! inferred from the function itself.

use crate::column::{ColumnIdentity, RATIONALE_PREFIX, SCORE_PREFIX};
use crate::errors::{PrismError, PrismResult};
use crate::table::ColumnStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Context handed to every registered function.
#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
    pub id_column: Option<ColumnIdentity>,
    pub data_column: Option<ColumnIdentity>,
    pub label_column: Option<ColumnIdentity>,
    pub data_path: String,
    pub label_path: String,
    /// Model output column, set for inference and postdistill calls.
    pub output_column: Option<ColumnIdentity>,
    pub output_path: String,
    /// Prompt text, set for inference calls.
    pub prompt: Option<String>,
    /// Logical distill function name to the column that holds its result.
    pub distill_columns: BTreeMap<String, ColumnIdentity>,
    /// Column a metric reads its verdicts from, when it is requirement-scoped.
    pub score_column: Option<ColumnIdentity>,
    /// Column a distill call computes. Extra series it returns must be
    /// [derived](ColumnIdentity::derived) from this one.
    pub column: Option<ColumnIdentity>,
}

impl FunctionOptions {
    /// Values of a distill function's column, by logical name.
    pub fn distill_values<'a>(&self, table: &'a ColumnStore, name: &str) -> Option<&'a [Value]> {
        self.distill_columns
            .get(name)
            .and_then(|c| table.values(c))
    }
}

/// Output of a predistill or postdistill function: one or more columns,
/// each with one value per row. The function's own column is required.
#[derive(Debug, Clone, Default)]
pub struct DistillReturn {
    pub columns: Vec<(ColumnIdentity, Vec<Value>)>,
}

impl DistillReturn {
    /// `values` for the column named in `options.column`.
    pub fn single(options: &FunctionOptions, values: Vec<Value>) -> Self {
        Self::default().with_own(options, values)
    }

    pub fn with_own(self, options: &FunctionOptions, values: Vec<Value>) -> Self {
        match &options.column {
            Some(column) => self.with(column.clone(), values),
            None => self,
        }
    }

    pub fn with(mut self, column: ColumnIdentity, values: Vec<Value>) -> Self {
        self.columns.push((column, values));
        self
    }
}

/// Output of an inference call.
#[derive(Debug, Clone, Default)]
pub struct ModelReturn {
    pub model_output: Vec<Value>,
    pub embedding: Option<Vec<Value>>,
}

pub trait DistillFunction: Send + Sync {
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<DistillReturn>;
}

impl<F> DistillFunction for F
where
    F: Fn(&ColumnStore, &FunctionOptions) -> anyhow::Result<DistillReturn> + Send + Sync,
{
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<DistillReturn> {
        self(table, options)
    }
}

/// Inference over a table for one model.
pub trait ModelFunction: Send + Sync {
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<ModelReturn>;
}

impl<F> ModelFunction for F
where
    F: Fn(&ColumnStore, &FunctionOptions) -> anyhow::Result<ModelReturn> + Send + Sync,
{
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<ModelReturn> {
        self(table, options)
    }
}

/// Builds the inference function for a model name.
pub trait ModelFactory: Send + Sync {
    fn build(&self, model: &str) -> anyhow::Result<Arc<dyn ModelFunction>>;
}

impl<F> ModelFactory for F
where
    F: Fn(&str) -> anyhow::Result<Arc<dyn ModelFunction>> + Send + Sync,
{
    fn build(&self, model: &str) -> anyhow::Result<Arc<dyn ModelFunction>> {
        self(model)
    }
}

/// Aggregates a filtered table into one optional number.
pub trait MetricFunction: Send + Sync {
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<Option<f64>>;
}

impl<F> MetricFunction for F
where
    F: Fn(&ColumnStore, &FunctionOptions) -> anyhow::Result<Option<f64>> + Send + Sync,
{
    fn call(&self, table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<Option<f64>> {
        self(table, options)
    }
}

/// A function together with the stage it belongs to.
pub enum Registration {
    Predistill {
        name: String,
        function: Arc<dyn DistillFunction>,
    },
    Postdistill {
        name: String,
        function: Arc<dyn DistillFunction>,
    },
    Model(Arc<dyn ModelFactory>),
    Metric {
        name: String,
        function: Arc<dyn MetricFunction>,
    },
}

impl Registration {
    pub fn predistill(name: impl Into<String>, f: impl DistillFunction + 'static) -> Self {
        Self::Predistill {
            name: name.into(),
            function: Arc::new(f),
        }
    }

    pub fn postdistill(name: impl Into<String>, f: impl DistillFunction + 'static) -> Self {
        Self::Postdistill {
            name: name.into(),
            function: Arc::new(f),
        }
    }

    pub fn model(f: impl ModelFactory + 'static) -> Self {
        Self::Model(Arc::new(f))
    }

    pub fn metric(name: impl Into<String>, f: impl MetricFunction + 'static) -> Self {
        Self::Metric {
            name: name.into(),
            function: Arc::new(f),
        }
    }
}

#[derive(Default, Clone)]
pub struct FunctionRegistry {
    predistill: Vec<(String, Arc<dyn DistillFunction>)>,
    postdistill: Vec<(String, Arc<dyn DistillFunction>)>,
    model: Option<Arc<dyn ModelFactory>>,
    metrics: BTreeMap<String, Arc<dyn MetricFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("predistill", &self.predistill_names())
            .field("postdistill", &self.postdistill_names())
            .field("model", &self.model.is_some())
            .field("metrics", &self.metrics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `count`, `mean` and `pass_rate`.
    pub fn with_builtin_metrics() -> Self {
        let mut reg = Self::new();
        for (name, function) in crate::query::metrics::builtins() {
            reg.metrics.insert(name.to_string(), function);
        }
        reg
    }

    pub fn register(&mut self, registration: Registration) -> PrismResult<()> {
        match registration {
            Registration::Predistill { name, function } => {
                insert_unique(&mut self.predistill, name, function, "predistill")
            }
            Registration::Postdistill { name, function } => {
                insert_unique(&mut self.postdistill, name, function, "postdistill")
            }
            Registration::Model(factory) => {
                if self.model.is_some() {
                    return Err(PrismError::config("a model function is already registered"));
                }
                self.model = Some(factory);
                Ok(())
            }
            Registration::Metric { name, function } => {
                self.metrics.insert(name, function);
                Ok(())
            }
        }
    }

    /// True when no stage has anything to compute.
    pub fn has_no_computation(&self) -> bool {
        self.predistill.is_empty() && self.postdistill.is_empty() && self.model.is_none()
    }

    pub fn predistill(&self) -> &[(String, Arc<dyn DistillFunction>)] {
        &self.predistill
    }

    pub fn postdistill(&self) -> &[(String, Arc<dyn DistillFunction>)] {
        &self.postdistill
    }

    pub fn predistill_names(&self) -> Vec<&str> {
        self.predistill.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn postdistill_names(&self) -> Vec<&str> {
        self.postdistill.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn model_factory(&self) -> Option<&Arc<dyn ModelFactory>> {
        self.model.as_ref()
    }

    pub fn metric(&self, name: &str) -> PrismResult<&Arc<dyn MetricFunction>> {
        self.metrics
            .get(name)
            .ok_or_else(|| PrismError::UnknownFunction {
                name: name.to_string(),
            })
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }
}

fn insert_unique(
    list: &mut Vec<(String, Arc<dyn DistillFunction>)>,
    name: String,
    function: Arc<dyn DistillFunction>,
    stage: &str,
) -> PrismResult<()> {
    if name.is_empty() {
        return Err(PrismError::config(format!("{} function needs a name", stage)));
    }
    if name.contains('.') {
        return Err(PrismError::config(format!(
            "{} function name '{}' may not contain '.'",
            stage, name
        )));
    }
    if stage == "postdistill" && (name.starts_with(SCORE_PREFIX) || name.starts_with(RATIONALE_PREFIX)) {
        return Err(PrismError::config(format!(
            "postdistill function name '{}' is reserved for requirement columns",
            name
        )));
    }
    if list.iter().any(|(n, _)| *n == name) {
        return Err(PrismError::config(format!(
            "{} function '{}' registered twice",
            stage, name
        )));
    }
    list.push((name, function));
    Ok(())
}
