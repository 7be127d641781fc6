//! Requirement grading loop.
//!
//! Unlike the other stages, grading resumes per row: only rows whose score is
//! still missing are sent to the grader, and whatever was graded is persisted
//! even when the batch stops early.

pub mod grading;
pub mod parse;

pub use grading::{
    GradingClient, GradingOutcome, GradingRequest, GradingResponse, LlmGradingClient,
};
pub use parse::{parse_verdict, Verdict};

use crate::cache::ColumnCache;
use crate::column::ColumnIdentity;
use crate::config::GradingConfig;
use crate::errors::{PrismError, PrismResult};
use crate::prompts::align::strip_annotations;
use crate::prompts::{Prompt, Requirement};
use crate::table::ColumnStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to grade: one requirement of one prompt against one model's outputs.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationTarget<'a> {
    pub model: &'a str,
    pub prompt: &'a Prompt,
    pub requirement: &'a Requirement,
}

impl EvaluationTarget<'_> {
    pub fn output_column(&self) -> ColumnIdentity {
        ColumnIdentity::output(self.model, &self.prompt.version)
    }

    pub fn score_column(&self) -> ColumnIdentity {
        ColumnIdentity::requirement_score(self.model, &self.prompt.version, &self.requirement.id)
    }

    pub fn rationale_column(&self) -> ColumnIdentity {
        ColumnIdentity::requirement_rationale(
            self.model,
            &self.prompt.version,
            &self.requirement.id,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    /// Rows sent to the grader.
    pub submitted: usize,
    pub graded: usize,
    /// Replies that did not parse; those rows stay missing.
    pub parse_failures: usize,
    /// Rows skipped because the model output is missing.
    pub skipped: usize,
    /// Rows that never got a reply (closed channel or timeout).
    pub unanswered: usize,
}

fn output_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Grade every row of `table` still missing a score for `target`.
///
/// Score and rationale columns are loaded from the cache first, filled as
/// replies arrive and persisted before returning, including when a failed
/// response stops the batch.
pub async fn evaluate_requirement(
    client: &dyn GradingClient,
    settings: &GradingConfig,
    cache: &ColumnCache,
    table: &mut ColumnStore,
    target: EvaluationTarget<'_>,
) -> PrismResult<EvaluationSummary> {
    let score = target.score_column();
    let rationale = target.rationale_column();
    let output = target.output_column();

    cache.load(&score, table)?;
    cache.load(&rationale, table)?;
    table.ensure_column(&score);
    table.ensure_column(&rationale);

    let mut summary = EvaluationSummary::default();
    let mut rows = Vec::new();
    for row in table.missing_rows(&score) {
        match table.cell(&output, row) {
            Some(v) if !v.is_null() => rows.push(row),
            _ => summary.skipped += 1,
        }
    }
    if rows.is_empty() {
        debug!(column = %score, skipped = summary.skipped, "nothing to grade");
        return Ok(summary);
    }

    let prompt_text = strip_annotations(&target.prompt.text);
    let system = grading::system_prompt(target.requirement);
    let mut pending: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
        let key = table.row_keys()[row].clone();
        let out = table
            .cell(&output, row)
            .map(output_text)
            .unwrap_or_default();
        requests.push(GradingRequest {
            metadata: json!({ "row": key }),
            system: system.clone(),
            prompt: grading::build_prompt(&prompt_text, target.requirement, &out),
        });
        pending.insert(key, row);
    }
    summary.submitted = requests.len();
    info!(column = %score, rows = summary.submitted, "grading requirement");

    let mut rx = client
        .submit(&settings.endpoint, requests)
        .await
        .map_err(|e| PrismError::GradingFailed {
            column: score.to_string(),
            message: e.to_string(),
        })?;
    let wait = settings.timeout_seconds.map(Duration::from_secs);

    let mut failure: Option<PrismError> = None;
    while !pending.is_empty() {
        let next = match wait {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(column = %score, pending = pending.len(), "timed out waiting for grades");
                    break;
                }
            },
            None => rx.recv().await,
        };
        let Some(resp) = next else {
            warn!(column = %score, pending = pending.len(), "grading channel closed early");
            break;
        };
        let key = resp
            .metadata
            .get("row")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(row) = pending.remove(&key) else {
            debug!(column = %score, row = %key, "ignoring reply for unknown row");
            continue;
        };

        match resp.outcome {
            GradingOutcome::Failed(message) => {
                warn!(column = %score, row = %key, error = %message, "grading request failed");
                failure = Some(PrismError::GradingFailed {
                    column: score.to_string(),
                    message,
                });
                break;
            }
            GradingOutcome::Completed(text) => match parse_verdict(&text) {
                Ok(verdict) => {
                    table.set_cell(&score, row, Value::Bool(verdict.passed));
                    table.set_cell(&rationale, row, Value::String(verdict.rationale));
                    summary.graded += 1;
                }
                Err(e) if settings.isolate_parse_failures => {
                    warn!(column = %score, row = %key, error = %e, "unparseable grade, row left for retry");
                    summary.parse_failures += 1;
                }
                Err(e) => {
                    failure = Some(PrismError::GradingParse {
                        column: score.to_string(),
                        row: key,
                        message: e.to_string(),
                    });
                    break;
                }
            },
        }
    }
    if failure.is_none() {
        summary.unanswered = pending.len();
    }
    table.refresh_metadata_type(&score);
    table.refresh_metadata_type(&rationale);

    cache.persist(&score, table)?;
    cache.persist(&rationale, table)?;

    match failure {
        Some(err) => Err(err),
        None => {
            info!(
                column = %score,
                graded = summary.graded,
                parse_failures = summary.parse_failures,
                "grading done"
            );
            Ok(summary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replies from a script keyed by row, in reverse submission order.
    struct ScriptedGrader {
        replies: HashMap<String, GradingOutcome>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedGrader {
        fn new(replies: &[(&str, GradingOutcome)]) -> Self {
            Self {
                replies: replies
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GradingClient for ScriptedGrader {
        async fn submit(
            &self,
            _endpoint: &str,
            requests: Vec<GradingRequest>,
        ) -> anyhow::Result<mpsc::Receiver<GradingResponse>> {
            let (tx, rx) = mpsc::channel(requests.len().max(1));
            for req in requests.into_iter().rev() {
                let key = req.metadata["row"].as_str().unwrap().to_string();
                self.seen.lock().unwrap().push(key.clone());
                let outcome = self
                    .replies
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| GradingOutcome::Completed(r#"{"passed": 1, "rationale": "ok"}"#.into()));
                tx.send(GradingResponse {
                    metadata: req.metadata,
                    outcome,
                })
                .await
                .unwrap();
            }
            Ok(rx)
        }
    }

    fn fixture(dir: &tempfile::TempDir) -> (ColumnCache, ColumnStore, Prompt) {
        let cache = ColumnCache::new(dir.path());
        let mut table =
            ColumnStore::with_rows(["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect())
                .unwrap();
        let mut prompt = Prompt::new("Be brief.");
        prompt.version = "v1".into();
        prompt.add_requirement(Requirement {
            name: "brevity".into(),
            ..Default::default()
        });
        table
            .insert(
                ColumnIdentity::output("m", "v1"),
                vec![json!("x"), json!("y"), json!("z"), json!("w")],
            )
            .unwrap();
        (cache, table, prompt)
    }

    #[tokio::test]
    async fn grades_every_row_in_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut table, prompt) = fixture(&dir);
        let grader = ScriptedGrader::new(&[(
            "b",
            GradingOutcome::Completed(r#"{"passed": false, "rationale": "too long"}"#.into()),
        )]);
        let target = EvaluationTarget {
            model: "m",
            prompt: &prompt,
            requirement: &prompt.requirements["0"],
        };
        let summary = evaluate_requirement(
            &grader,
            &GradingConfig::default(),
            &cache,
            &mut table,
            target,
        )
        .await
        .unwrap();
        assert_eq!(summary.graded, 4);
        let scores = table.values(&target.score_column()).unwrap();
        assert_eq!(scores, &[json!(true), json!(false), json!(true), json!(true)]);
        assert_eq!(
            table.values(&target.rationale_column()).unwrap()[1],
            json!("too long")
        );
        assert!(cache.read(&target.score_column()).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_response_keeps_graded_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut table, prompt) = fixture(&dir);
        // Reverse order: d, c, b fail, a never read.
        let grader = ScriptedGrader::new(&[("b", GradingOutcome::Failed("rate limited".into()))]);
        let target = EvaluationTarget {
            model: "m",
            prompt: &prompt,
            requirement: &prompt.requirements["0"],
        };
        let err = evaluate_requirement(
            &grader,
            &GradingConfig::default(),
            &cache,
            &mut table,
            target,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PrismError::GradingFailed { .. }));
        let cached = cache.read(&target.score_column()).unwrap().unwrap();
        assert_eq!(cached.values["d"], json!(true));
        assert_eq!(cached.values["c"], json!(true));
        assert_eq!(cached.values["b"], Value::Null);
        assert_eq!(cached.values["a"], Value::Null);
    }

    #[tokio::test]
    async fn parse_failure_is_isolated_or_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut table, prompt) = fixture(&dir);
        let bad = [("c", GradingOutcome::Completed("not json".into()))];
        let target = EvaluationTarget {
            model: "m",
            prompt: &prompt,
            requirement: &prompt.requirements["0"],
        };

        let summary = evaluate_requirement(
            &ScriptedGrader::new(&bad),
            &GradingConfig::default(),
            &cache,
            &mut table,
            target,
        )
        .await
        .unwrap();
        assert_eq!((summary.graded, summary.parse_failures), (3, 1));
        assert_eq!(table.missing_rows(&target.score_column()), vec![2]);

        let strict = GradingConfig {
            isolate_parse_failures: false,
            ..GradingConfig::default()
        };
        let err = evaluate_requirement(
            &ScriptedGrader::new(&bad),
            &strict,
            &cache,
            &mut table,
            target,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PrismError::GradingParse { ref row, .. } if row == "c"));
    }

    #[tokio::test]
    async fn rows_without_output_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut table, prompt) = fixture(&dir);
        table.set_cell(&ColumnIdentity::output("m", "v1"), 0, Value::Null);
        let grader = ScriptedGrader::new(&[]);
        let target = EvaluationTarget {
            model: "m",
            prompt: &prompt,
            requirement: &prompt.requirements["0"],
        };
        let summary = evaluate_requirement(
            &grader,
            &GradingConfig::default(),
            &cache,
            &mut table,
            target,
        )
        .await
        .unwrap();
        assert_eq!((summary.submitted, summary.skipped), (3, 1));
        assert_eq!(grader.seen.lock().unwrap().len(), 3);
    }
}
