//! Slices, tags and the request/response types of the query surface.

pub mod filter;
pub mod metrics;

pub use filter::{
    filter_rows, FilterIds, FilterNode, FilterOp, FilterPredicate, FilterPredicateGroup, Join,
};

use crate::column::ColumnIdentity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the slice that always exists and selects every row.
pub const ALL_INSTANCES: &str = "All Instances";
/// Record key of the comparison column of a two-column table request.
pub const DIFF_COLUMN: &str = "diff";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub slice_name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub filter_predicates: FilterPredicateGroup,
}

impl Slice {
    pub fn all_instances() -> Self {
        Self {
            slice_name: ALL_INSTANCES.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub tag_name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub selection_ids: FilterIds,
}

/// Saved report layout. Only the name is interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKey {
    pub sli: Slice,
    pub model: String,
    pub metric: String,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub requirement_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMetricKey {
    pub tag: Tag,
    pub model: String,
    pub metric: String,
}

/// Metric value over a row subset, with the subset's size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupMetric {
    pub metric: Option<f64>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRequest {
    pub columns: Vec<ColumnIdentity>,
    /// With both set, every record gets a [`DIFF_COLUMN`] comparing the two.
    #[serde(default)]
    pub diff_column_1: Option<ColumnIdentity>,
    #[serde(default)]
    pub diff_column_2: Option<ColumnIdentity>,
    /// Half-open row range of the filtered, sorted result.
    pub slice_range: (usize, usize),
    #[serde(default)]
    pub filter_predicates: FilterPredicateGroup,
    /// Sort column and ascending flag.
    #[serde(default = "no_sort")]
    pub sort: (Option<ColumnIdentity>, bool),
    #[serde(default)]
    pub tag_ids: FilterIds,
    #[serde(default)]
    pub filter_ids: Option<FilterIds>,
    #[serde(default)]
    pub tag_list: Vec<String>,
}

fn no_sort() -> (Option<ColumnIdentity>, bool) {
    (None, true)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlotRequest {
    #[serde(default)]
    pub filter_predicates: FilterPredicateGroup,
    #[serde(default)]
    pub tag_ids: FilterIds,
}

/// A user's correction of one graded row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorFeedback {
    pub model: String,
    pub prompt_id: String,
    pub example_id: String,
    pub corrected_eval: bool,
    pub requirement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub done_processing: bool,
    pub complete_columns: Vec<ColumnIdentity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metric_key_wire_format() {
        let key: MetricKey = serde_json::from_value(json!({
            "sli": {"sliceName": "All Instances", "folder": "", "filterPredicates": {"predicates": [], "join": ""}},
            "model": "gpt-4o",
            "metric": "pass_rate",
            "promptId": "v2",
            "requirementId": "0"
        }))
        .unwrap();
        assert_eq!(key.sli.slice_name, ALL_INSTANCES);
        assert_eq!(key.requirement_id.as_deref(), Some("0"));
    }

    #[test]
    fn table_request_defaults() {
        let req: TableRequest = serde_json::from_value(json!({
            "columns": [{"columnType": "METADATA", "name": "text"}],
            "sliceRange": [0, 10]
        }))
        .unwrap();
        assert_eq!(req.slice_range, (0, 10));
        assert_eq!(req.sort, (None, true));
        assert!(req.filter_predicates.is_empty());
        assert!(req.diff_column_1.is_none());
    }

    #[test]
    fn report_keeps_unknown_fields() {
        let r: Report = serde_json::from_value(json!({"name": "weekly", "layout": [1, 2]})).unwrap();
        assert_eq!(r.body["layout"], json!([1, 2]));
        assert_eq!(serde_json::to_value(&r).unwrap()["layout"], json!([1, 2]));
    }
}
