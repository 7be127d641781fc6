//! Built-in metric functions.

use crate::column::ColumnIdentity;
use crate::registry::{FunctionOptions, MetricFunction};
use crate::table::ColumnStore;
use serde_json::Value;
use std::sync::Arc;

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The column a metric aggregates: a requirement's score column when one is
/// addressed, else the label column.
fn target_column(options: &FunctionOptions) -> Option<&ColumnIdentity> {
    options
        .score_column
        .as_ref()
        .or(options.label_column.as_ref())
}

fn numbers(table: &ColumnStore, options: &FunctionOptions) -> Vec<f64> {
    target_column(options)
        .and_then(|c| table.values(c))
        .map(|vals| vals.iter().filter_map(as_number).collect())
        .unwrap_or_default()
}

pub fn count(table: &ColumnStore, _options: &FunctionOptions) -> anyhow::Result<Option<f64>> {
    Ok(Some(table.len() as f64))
}

pub fn mean(table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<Option<f64>> {
    let xs = numbers(table, options);
    if xs.is_empty() {
        return Ok(None);
    }
    Ok(Some(xs.iter().sum::<f64>() / xs.len() as f64))
}

/// Share of non-missing values that count as a pass, in percent.
pub fn pass_rate(table: &ColumnStore, options: &FunctionOptions) -> anyhow::Result<Option<f64>> {
    let xs = numbers(table, options);
    if xs.is_empty() {
        return Ok(None);
    }
    let passed = xs.iter().filter(|x| **x > 0.0).count();
    Ok(Some(100.0 * passed as f64 / xs.len() as f64))
}

pub(crate) fn builtins() -> Vec<(&'static str, Arc<dyn MetricFunction>)> {
    let count: Arc<dyn MetricFunction> = Arc::new(count);
    let mean: Arc<dyn MetricFunction> = Arc::new(mean);
    let pass_rate: Arc<dyn MetricFunction> = Arc::new(pass_rate);
    vec![("count", count), ("mean", mean), ("pass_rate", pass_rate)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> (ColumnStore, FunctionOptions) {
        let mut t = ColumnStore::with_rows(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let label = ColumnIdentity::metadata("label");
        let score = ColumnIdentity::requirement_score("m", "v1", "0");
        t.insert(label.clone(), vec![json!(2), json!(4), Value::Null]).unwrap();
        t.insert(score.clone(), vec![json!(true), json!(false), json!(true)])
            .unwrap();
        let opts = FunctionOptions {
            label_column: Some(label),
            ..Default::default()
        };
        (t, opts)
    }

    #[test]
    fn mean_skips_missing_labels() {
        let (t, opts) = table();
        assert_eq!(mean(&t, &opts).unwrap(), Some(3.0));
        assert_eq!(count(&t, &opts).unwrap(), Some(3.0));
    }

    #[test]
    fn pass_rate_reads_score_column_when_set() {
        let (t, mut opts) = table();
        opts.score_column = Some(ColumnIdentity::requirement_score("m", "v1", "0"));
        let rate = pass_rate(&t, &opts).unwrap().unwrap();
        assert!((rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn no_target_column_yields_none() {
        let (t, _) = table();
        assert_eq!(mean(&t, &FunctionOptions::default()).unwrap(), None);
    }
}
