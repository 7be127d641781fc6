use super::{write, Pipeline};
use crate::cache::Completeness;
use crate::column::ColumnIdentity;
use crate::dispatch::{merge_outputs, Job, Task};
use crate::errors::{PrismError, PrismResult};
use crate::evaluation::{evaluate_requirement, EvaluationTarget};
use crate::prompts::align::strip_annotations;
use crate::registry::{DistillFunction, FunctionOptions, ModelFunction};
use crate::table::ColumnStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A column a stage may need to compute. Model functions are only built for
/// columns the cache cannot serve.
pub(super) struct Candidate {
    column: ColumnIdentity,
    pending: Pending,
    options: FunctionOptions,
}

enum Pending {
    Distill(Arc<dyn DistillFunction>),
    Model {
        model: String,
        embedding: ColumnIdentity,
    },
}

impl Pipeline {
    pub(super) async fn predistill(&self) -> PrismResult<()> {
        let options = self.base_options();
        let candidates: Vec<Candidate> = self
            .registry
            .predistill()
            .iter()
            .map(|(name, function)| Candidate {
                column: ColumnIdentity::predistill(name),
                pending: Pending::Distill(function.clone()),
                options: options.clone(),
            })
            .collect();
        info!(functions = candidates.len(), "predistill");
        self.run_stage(candidates).await
    }

    /// Inference for each `(model, prompt_id)` pair.
    pub(super) async fn inference(&self, pairs: &[(String, String)]) -> PrismResult<()> {
        if self.registry.model_factory().is_none() {
            debug!("no model function registered, skipping inference");
            return Ok(());
        }
        let base = self.base_options();
        let mut candidates = Vec::with_capacity(pairs.len());
        for (model, prompt_id) in pairs {
            let prompt = self.prompt(prompt_id)?;
            let output = ColumnIdentity::output(model, prompt_id);
            let mut options = base.clone();
            options.output_path = self.cache.path_for(&output).display().to_string();
            options.output_column = Some(output.clone());
            options.prompt = Some(strip_annotations(&prompt.text));
            candidates.push(Candidate {
                column: output,
                pending: Pending::Model {
                    model: model.clone(),
                    embedding: ColumnIdentity::embedding(model, prompt_id),
                },
                options,
            });
        }
        info!(runs = candidates.len(), "inference");
        self.run_stage(candidates).await
    }

    /// Grade `(model, prompt_id, requirement_id)` triples one after another.
    ///
    /// Each triple grades a private projection of the table holding only the
    /// output, score and rationale columns; score and rationale are merged
    /// back whether or not grading finished.
    pub(super) async fn evaluate(&self, triples: &[(String, String, String)]) -> PrismResult<()> {
        let Some(grader) = self.grader.clone() else {
            debug!("no grading client, skipping requirement evaluation");
            return Ok(());
        };
        for (model, prompt_id, requirement_id) in triples {
            let prompt = self.prompt(prompt_id)?;
            let requirement = prompt.requirement(requirement_id)?.clone();
            let target = EvaluationTarget {
                model,
                prompt: &prompt,
                requirement: &requirement,
            };
            let mut work = self.snapshot().project(&[
                target.output_column(),
                target.score_column(),
                target.rationale_column(),
            ]);
            let result = evaluate_requirement(
                grader.as_ref(),
                &self.config.grading,
                &self.cache,
                &mut work,
                target,
            )
            .await;
            self.adopt(&work, &[target.score_column(), target.rationale_column()])?;
            let summary = result?;
            info!(
                model = %model,
                prompt = %prompt_id,
                requirement = %requirement_id,
                graded = summary.graded,
                parse_failures = summary.parse_failures,
                skipped = summary.skipped,
                "requirement graded"
            );
        }
        Ok(())
    }

    pub(super) async fn postdistill(&self) -> PrismResult<()> {
        let Some(prompt_id) = self.current_prompt_id() else {
            return Ok(());
        };
        let base = self.base_options();
        let mut candidates = Vec::new();
        for model in &self.config.models {
            let output = ColumnIdentity::output(model, &prompt_id);
            let mut options = base.clone();
            options.output_path = self.cache.path_for(&output).display().to_string();
            options.output_column = Some(output);
            for (name, function) in self.registry.postdistill() {
                candidates.push(Candidate {
                    column: ColumnIdentity::postdistill(name, model, &prompt_id),
                    pending: Pending::Distill(function.clone()),
                    options: options.clone(),
                });
            }
        }
        info!(runs = candidates.len(), "postdistill");
        self.run_stage(candidates).await?;
        self.load_orphaned_postdistill(&prompt_id)
    }

    /// Load postdistill columns of `prompt_id` left in the cache by functions
    /// that are no longer registered.
    fn load_orphaned_postdistill(&self, prompt_id: &str) -> PrismResult<()> {
        let registered = self.registry.postdistill_names();
        let mut found = Vec::new();
        for model in &self.config.models {
            for column in self.cache.discover_postdistill(model, prompt_id)? {
                let function = column.name.split('.').next().unwrap_or_default();
                if !registered.contains(&function) {
                    found.push(column);
                }
            }
        }
        if found.is_empty() {
            return Ok(());
        }
        let mut guard = write(&self.table);
        let table = Arc::make_mut(&mut guard);
        for column in &found {
            if self.cache.load(column, table)? {
                debug!(column = %column, "loaded orphaned postdistill column");
                self.register_column(table, column);
            }
        }
        Ok(())
    }

    /// Serve what the cache can, compute the rest and merge the results.
    async fn run_stage(&self, candidates: Vec<Candidate>) -> PrismResult<()> {
        let tasks = self.plan(candidates)?;
        if tasks.is_empty() {
            return Ok(());
        }
        let report = self.dispatcher.execute(tasks).await?;
        for (column, e) in &report.failed {
            warn!(column = %column, error = %e, "column left incomplete");
        }
        let mut guard = write(&self.table);
        let table = Arc::make_mut(&mut guard);
        for column in merge_outputs(table, report.outputs)? {
            self.register_column(table, &column);
        }
        Ok(())
    }

    fn plan(&self, candidates: Vec<Candidate>) -> PrismResult<Vec<Task>> {
        let mut to_run = Vec::new();
        {
            let mut guard = write(&self.table);
            let table = Arc::make_mut(&mut guard);
            for candidate in candidates {
                let state = self.cache.completeness(&candidate.column, table)?;
                if let Pending::Model { embedding, .. } = &candidate.pending {
                    self.cache.load(embedding, table)?;
                    if table.contains(embedding) {
                        self.register_column(table, embedding);
                    }
                }
                match state {
                    Completeness::Complete => {
                        debug!(column = %candidate.column, "served from cache");
                        self.register_column(table, &candidate.column);
                        if let Pending::Distill(_) = &candidate.pending {
                            for derived in self.cache.load_derived(&candidate.column, table)? {
                                self.register_column(table, &derived);
                            }
                        }
                    }
                    Completeness::Partial { missing } => {
                        debug!(column = %candidate.column, missing = missing.len(), "partially cached, recomputing");
                        to_run.push(candidate);
                    }
                    Completeness::Absent => to_run.push(candidate),
                }
            }
        }
        if to_run.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = self.snapshot();
        let mut models: HashMap<String, Arc<dyn ModelFunction>> = HashMap::new();
        let mut tasks = Vec::with_capacity(to_run.len());
        for (ordinal, candidate) in to_run.into_iter().enumerate() {
            let job = match candidate.pending {
                Pending::Distill(function) => Job::Distill(function),
                Pending::Model { model, embedding } => Job::Inference {
                    function: self.model_function(&mut models, &model, &candidate.column)?,
                    embedding,
                },
            };
            tasks.push(Task {
                job,
                column: candidate.column,
                options: candidate.options,
                table: snapshot.clone(),
                batch_size: self.config.batch_size,
                ordinal,
            });
        }
        Ok(tasks)
    }

    fn model_function(
        &self,
        built: &mut HashMap<String, Arc<dyn ModelFunction>>,
        model: &str,
        column: &ColumnIdentity,
    ) -> PrismResult<Arc<dyn ModelFunction>> {
        if let Some(f) = built.get(model) {
            return Ok(f.clone());
        }
        let factory = self
            .registry
            .model_factory()
            .ok_or_else(|| PrismError::stage(column, "no model function registered"))?;
        let function = factory
            .build(model)
            .map_err(|e| PrismError::stage(column, e))?;
        built.insert(model.to_string(), function.clone());
        Ok(function)
    }

    /// Copy `columns` from a working table into the shared one.
    fn adopt(&self, work: &ColumnStore, columns: &[ColumnIdentity]) -> PrismResult<()> {
        let mut guard = write(&self.table);
        let table = Arc::make_mut(&mut guard);
        for column in columns {
            if let Some(values) = work.values(column) {
                table.insert(column.clone(), values.to_vec())?;
                self.register_column(table, column);
            }
        }
        Ok(())
    }

    /// Run inference and grade every requirement of `prompt_id` for `model`.
    /// Fails with `AlreadyRunning` while another run writes the output
    /// column or any of these score columns.
    pub async fn run_prompt(&self, model: &str, prompt_id: &str) -> PrismResult<()> {
        let prompt = self.prompt(prompt_id)?;
        let pairs = [(model.to_string(), prompt_id.to_string())];
        let triples: Vec<(String, String, String)> = prompt
            .ordered_requirements()
            .into_iter()
            .map(|r| (model.to_string(), prompt_id.to_string(), r.id.clone()))
            .collect();
        let _claim = self.claim(&Self::run_columns(&pairs, &triples))?;
        self.inference(&pairs).await?;
        self.evaluate(&triples).await
    }

    /// Run inference if needed, then grade one requirement. Fails with
    /// `AlreadyRunning` while another run grades the same requirement.
    pub async fn run_prompt_with_requirement(
        &self,
        model: &str,
        prompt_id: &str,
        requirement_id: &str,
    ) -> PrismResult<()> {
        self.prompt(prompt_id)?.requirement(requirement_id)?;
        let triple = [(
            model.to_string(),
            prompt_id.to_string(),
            requirement_id.to_string(),
        )];
        let _claim = self.claim(&Self::run_columns(&[], &triple))?;
        self.inference(&[(model.to_string(), prompt_id.to_string())])
            .await?;
        self.evaluate(&triple).await
    }
}
