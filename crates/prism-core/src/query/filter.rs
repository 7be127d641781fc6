//! Filter predicates over the column store.

use crate::column::ColumnIdentity;
use crate::errors::similarity::closest_name;
use crate::errors::{PrismError, PrismResult};
use crate::table::{value_as_key, ColumnStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    /// SQL-style pattern, `%` and `_` wildcards, case-insensitive.
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "NOT LIKE")]
    NotLike,
}

/// How a node combines with the nodes before it. The first node's join is
/// ignored; an empty join after the first node means `&`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Join {
    #[serde(rename = "&")]
    And,
    #[serde(rename = "|")]
    Or,
    #[default]
    #[serde(rename = "")]
    Unset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPredicate {
    pub column: ColumnIdentity,
    pub operation: FilterOp,
    pub value: Value,
    #[serde(default)]
    pub join: Join,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Predicate(FilterPredicate),
    Group(FilterPredicateGroup),
}

impl FilterNode {
    fn join(&self) -> Join {
        match self {
            FilterNode::Predicate(p) => p.join,
            FilterNode::Group(g) => g.join,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPredicateGroup {
    #[serde(default)]
    pub predicates: Vec<FilterNode>,
    #[serde(default)]
    pub join: Join,
}

/// Explicit row selection by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterIds {
    #[serde(default)]
    pub ids: Vec<Value>,
}

impl FilterIds {
    pub fn from_keys<I: IntoIterator<Item = S>, S: Into<String>>(keys: I) -> Self {
        Self {
            ids: keys.into_iter().map(|k| Value::String(k.into())).collect(),
        }
    }
}

impl FilterPredicateGroup {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Row mask of the group. An empty group keeps every row.
    pub fn evaluate(&self, table: &ColumnStore) -> PrismResult<Vec<bool>> {
        let mut mask: Option<Vec<bool>> = None;
        for node in &self.predicates {
            let child = match node {
                FilterNode::Predicate(p) => p.evaluate(table)?,
                FilterNode::Group(g) => g.evaluate(table)?,
            };
            mask = Some(match mask {
                None => child,
                Some(acc) => {
                    let or = node.join() == Join::Or;
                    acc.into_iter()
                        .zip(child)
                        .map(|(a, b)| if or { a || b } else { a && b })
                        .collect()
                }
            });
        }
        Ok(mask.unwrap_or_else(|| vec![true; table.len()]))
    }
}

impl FilterPredicate {
    /// Row mask of one comparison. Missing cells never match.
    pub fn evaluate(&self, table: &ColumnStore) -> PrismResult<Vec<bool>> {
        let Some(column) = table.column(&self.column) else {
            let name = self.column.canonical();
            let known: Vec<String> = table.identities().iter().map(|c| c.canonical()).collect();
            return Err(PrismError::UndefinedVariable {
                suggestion: closest_name(&name, known.iter().map(String::as_str)),
                name,
            });
        };
        let pattern = match self.operation {
            FilterOp::Like | FilterOp::NotLike => Some(like_pattern(&self.value)?),
            _ => None,
        };
        Ok(column
            .values
            .iter()
            .map(|cell| {
                if cell.is_null() {
                    return false;
                }
                match self.operation {
                    FilterOp::Eq => loosely_equal(cell, &self.value),
                    FilterOp::Ne => !loosely_equal(cell, &self.value),
                    FilterOp::Gt => compare(cell, &self.value) == Some(Ordering::Greater),
                    FilterOp::Ge => matches!(
                        compare(cell, &self.value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    FilterOp::Lt => compare(cell, &self.value) == Some(Ordering::Less),
                    FilterOp::Le => matches!(
                        compare(cell, &self.value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    FilterOp::Like | FilterOp::NotLike => {
                        let hit = pattern
                            .as_ref()
                            .is_some_and(|re| re.is_match(&value_as_key(cell)));
                        hit == (self.operation == FilterOp::Like)
                    }
                }
            })
            .collect())
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(cell: &Value, target: &Value) -> bool {
    if cell == target {
        return true;
    }
    match (cell, target) {
        (Value::String(_), Value::String(_)) => false,
        _ => match (as_number(cell), as_number(target)) {
            (Some(a), Some(b)) => a == b,
            _ => value_as_key(cell) == value_as_key(target),
        },
    }
}

fn compare(cell: &Value, target: &Value) -> Option<Ordering> {
    match (cell, target) {
        (Value::String(a), Value::String(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        _ => as_number(cell)?.partial_cmp(&as_number(target)?),
    }
}

fn like_pattern(value: &Value) -> PrismResult<Regex> {
    let raw = value_as_key(value);
    let mut re = String::from("(?is)^");
    for c in raw.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| PrismError::config(format!("bad LIKE pattern '{}': {}", raw, e)))
}

/// Row positions that pass `predicates` and every non-empty id set.
pub fn filter_rows(
    table: &ColumnStore,
    predicates: Option<&FilterPredicateGroup>,
    id_sets: &[&FilterIds],
) -> PrismResult<Vec<usize>> {
    let mask = match predicates {
        Some(group) => group.evaluate(table)?,
        None => vec![true; table.len()],
    };
    let sets: Vec<HashSet<String>> = id_sets
        .iter()
        .filter(|s| !s.ids.is_empty())
        .map(|s| s.ids.iter().map(value_as_key).collect())
        .collect();
    Ok(mask
        .into_iter()
        .enumerate()
        .filter(|(i, keep)| {
            *keep
                && sets
                    .iter()
                    .all(|set| set.contains(&table.row_keys()[*i]))
        })
        .map(|(i, _)| i)
        .collect())
}
