use super::{read, Pipeline};
use crate::column::{ColumnIdentity, ColumnKind, MetadataType};
use crate::errors::similarity::closest_name;
use crate::errors::{PrismError, PrismResult};
use crate::query::{
    filter_rows, FilterIds, FilterPredicateGroup, GroupMetric, MetricKey, PlotRequest,
    TableRequest, TagMetricKey, DIFF_COLUMN,
};
use crate::registry::FunctionOptions;
use crate::table::{Column, ColumnStore};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Which model and requirement a metric is computed for.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricScope<'a> {
    pub model: Option<&'a str>,
    pub prompt_id: Option<&'a str>,
    pub requirement_id: Option<&'a str>,
}

impl<'a> MetricScope<'a> {
    fn of(key: &'a MetricKey) -> Self {
        Self {
            model: (!key.model.is_empty()).then_some(key.model.as_str()),
            prompt_id: key.prompt_id.as_deref(),
            requirement_id: key.requirement_id.as_deref(),
        }
    }
}

impl Pipeline {
    /// Metric and size of each requested slice.
    pub fn get_metrics_for_slices(
        &self,
        keys: &[MetricKey],
        filter_ids: Option<&FilterIds>,
    ) -> PrismResult<Vec<GroupMetric>> {
        self.get_metrics_for_slices_and_tags(keys, None, filter_ids, &[])
    }

    /// Like [`Self::get_metrics_for_slices`], further restricted to `tag_ids`
    /// and to the rows of the tags named in `tag_list`.
    pub fn get_metrics_for_slices_and_tags(
        &self,
        keys: &[MetricKey],
        tag_ids: Option<&FilterIds>,
        filter_ids: Option<&FilterIds>,
        tag_list: &[String],
    ) -> PrismResult<Vec<GroupMetric>> {
        let table = self.snapshot();
        let ids: Vec<&FilterIds> = tag_ids.into_iter().chain(filter_ids).collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let rows = match self.select(&table, Some(&key.sli.filter_predicates), &ids, tag_list) {
                Ok(rows) => rows,
                Err(e) if e.is_undefined_variable() => {
                    debug!(slice = %key.sli.slice_name, error = %e, "slice filter is undefined");
                    out.push(GroupMetric {
                        metric: None,
                        size: 0,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            out.push(self.group_metric(&table, &rows, &key.metric, MetricScope::of(key)));
        }
        Ok(out)
    }

    /// Metric and size of each requested tag. An empty tag selects nothing.
    pub fn get_metrics_for_tags(&self, keys: &[TagMetricKey]) -> PrismResult<Vec<GroupMetric>> {
        let table = self.snapshot();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let rows = if key.tag.selection_ids.ids.is_empty() {
                Vec::new()
            } else {
                filter_rows(&table, None, &[&key.tag.selection_ids])?
            };
            let scope = MetricScope {
                model: (!key.model.is_empty()).then_some(key.model.as_str()),
                ..Default::default()
            };
            out.push(self.group_metric(&table, &rows, &key.metric, scope));
        }
        Ok(out)
    }

    fn group_metric(
        &self,
        table: &ColumnStore,
        rows: &[usize],
        metric: &str,
        scope: MetricScope<'_>,
    ) -> GroupMetric {
        let size = rows.len();
        let has_target = !self.roles.label.name.is_empty() || scope.requirement_id.is_some();
        if metric.is_empty() || !has_target || rows.is_empty() {
            return GroupMetric { metric: None, size };
        }
        let subset = table.take(rows);
        let value = match self.calculate_metric(&subset, metric, scope) {
            Ok(v) => v,
            Err(e) => {
                warn!(metric, error = %e, "metric failed");
                None
            }
        };
        GroupMetric {
            metric: value,
            size,
        }
    }

    /// Apply the registered metric `metric` to an already filtered table.
    /// `None` until inference has finished.
    pub fn calculate_metric(
        &self,
        table: &ColumnStore,
        metric: &str,
        scope: MetricScope<'_>,
    ) -> PrismResult<Option<f64>> {
        if !self.done_running_inference() {
            return Ok(None);
        }
        let function = self.registry.metric(metric)?;
        let options = self.metric_options(scope);
        function.call(table, &options).map_err(|e| PrismError::Stage {
            column: format!("metric {}", metric),
            message: e.to_string(),
        })
    }

    fn metric_options(&self, scope: MetricScope<'_>) -> FunctionOptions {
        let mut options = self.base_options();
        let Some(model) = scope.model else {
            return options;
        };
        let prompt_id = scope
            .prompt_id
            .map(str::to_string)
            .or_else(|| self.current_prompt_id())
            .unwrap_or_default();
        let output = ColumnIdentity::output(model, &prompt_id);
        options.output_path = self.cache.path_for(&output).display().to_string();
        options.output_column = Some(output);
        for column in read(&self.columns).iter() {
            if column.kind == ColumnKind::Postdistill
                && !column.is_requirement_column()
                && column.model.as_deref() == Some(model)
                && column.prompt_id.as_deref() == Some(prompt_id.as_str())
            {
                options
                    .distill_columns
                    .insert(column.name.clone(), column.clone());
            }
        }
        if let Some(requirement_id) = scope.requirement_id {
            options.score_column = Some(ColumnIdentity::requirement_score(
                model,
                &prompt_id,
                requirement_id,
            ));
        }
        options
    }

    /// Row positions passing the predicates, every non-empty id set and, when
    /// `tag_list` names tags, the union of those tags.
    fn select(
        &self,
        table: &ColumnStore,
        predicates: Option<&FilterPredicateGroup>,
        id_sets: &[&FilterIds],
        tag_list: &[String],
    ) -> PrismResult<Vec<usize>> {
        let tagged = if tag_list.is_empty() {
            None
        } else {
            let docs = read(&self.docs);
            let ids: Vec<Value> = tag_list
                .iter()
                .filter_map(|name| docs.tags.get(name))
                .flat_map(|t| t.selection_ids.ids.iter().cloned())
                .collect();
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            Some(FilterIds { ids })
        };
        let mut sets: Vec<&FilterIds> = id_sets.to_vec();
        if let Some(t) = &tagged {
            sets.push(t);
        }
        filter_rows(table, predicates, &sets)
    }

    /// Ids of the rows matching a plot request, in table order.
    pub fn get_filtered_ids(&self, request: &PlotRequest) -> PrismResult<Vec<Value>> {
        let table = self.snapshot();
        let rows = self.select(&table, Some(&request.filter_predicates), &[&request.tag_ids], &[])?;
        Ok(rows
            .into_iter()
            .map(|r| table.cell(&self.roles.id, r).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Filtered, sorted, ranged and projected rows as JSON records keyed by
    /// canonical column name. A request naming two diff columns also gets a
    /// `diff` entry per record, which the request may sort on.
    pub fn get_filtered_table(&self, request: &TableRequest) -> PrismResult<Vec<Map<String, Value>>> {
        let table = self.snapshot();
        for column in &request.columns {
            self.require_column(&table, column)?;
        }
        let diff = match (&request.diff_column_1, &request.diff_column_2) {
            (Some(first), Some(second)) => {
                self.require_column(&table, first)?;
                self.require_column(&table, second)?;
                match (table.column(first), table.column(second)) {
                    (Some(a), Some(b)) => Some(diff_series(a, b)),
                    _ => None,
                }
            }
            _ => None,
        };
        let mut ids: Vec<&FilterIds> = vec![&request.tag_ids];
        if let Some(f) = &request.filter_ids {
            ids.push(f);
        }
        let mut rows = self.select(&table, Some(&request.filter_predicates), &ids, &request.tag_list)?;

        if let (Some(column), ascending) = &request.sort {
            let values = match &diff {
                Some(d) if column.is_metadata() && column.name == DIFF_COLUMN && !table.contains(column) => {
                    d.as_slice()
                }
                _ => self.require_column(&table, column)?,
            };
            rows.sort_by(|a, b| sort_order(&values[*a], &values[*b], *ascending));
        }

        let (start, end) = request.slice_range;
        let end = end.min(rows.len());
        let start = start.min(end);

        let data_key = self.roles.data.canonical();
        let prefix = self.config.data_path.as_str();
        Ok(rows[start..end]
            .iter()
            .map(|&row| {
                let mut record = table.record(row, &request.columns);
                if let Some(d) = &diff {
                    record.insert(DIFF_COLUMN.to_string(), d[row].clone());
                }
                if !prefix.is_empty() {
                    if let Some(Value::String(s)) = record.get_mut(&data_key) {
                        s.insert_str(0, prefix);
                    }
                }
                record
            })
            .collect())
    }

    fn require_column<'t>(
        &self,
        table: &'t ColumnStore,
        column: &ColumnIdentity,
    ) -> PrismResult<&'t [Value]> {
        table.values(column).ok_or_else(|| {
            let name = column.canonical();
            let known: Vec<String> = table.identities().iter().map(|c| c.canonical()).collect();
            PrismError::UndefinedVariable {
                suggestion: closest_name(&name, known.iter().map(String::as_str)),
                name,
            }
        })
    }
}

/// Row-wise comparison of two columns: the numeric difference when the
/// first is continuous or holds only numbers, otherwise whether the values
/// differ. Null where either side is missing.
fn diff_series(first: &Column, second: &Column) -> Vec<Value> {
    let number = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let numeric = first.metadata_type == MetadataType::Continuous
        || first.values.iter().all(|v| v.is_null() || v.is_number());
    first
        .values
        .iter()
        .zip(&second.values)
        .map(|(a, b)| {
            if a.is_null() || b.is_null() {
                return Value::Null;
            }
            if numeric {
                match (number(a), number(b)) {
                    (Some(x), Some(y)) => serde_json::Number::from_f64(x - y).map_or(Value::Null, Value::Number),
                    _ => Value::Null,
                }
            } else {
                Value::Bool(a != b)
            }
        })
        .collect()
}

/// Nulls sort last in either direction.
fn sort_order(a: &Value, b: &Value, ascending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = compare_values(a, b);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
