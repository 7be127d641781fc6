//! Pipeline orchestrator.
//!
//! One [`Pipeline`] owns the column store, the caches and the prompt book of a
//! project. `start_processing` drives the four stages in a background task;
//! callers poll [`Pipeline::status`] or watch the [`PipelineHandle`].

mod documents;
mod query;
mod stages;

pub use query::MetricScope;

use crate::cache::documents::Document;
use crate::cache::{ColumnCache, DocumentStore};
use crate::column::{push_unique, ColumnIdentity};
use crate::config::PrismConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{PrismError, PrismResult};
use crate::evaluation::{GradingClient, LlmGradingClient};
use crate::prompts::{Prompt, PromptBook};
use crate::providers::llm::LlmClient;
use crate::query::{Report, Slice, StatusResponse, Tag, ALL_INSTANCES};
use crate::registry::{FunctionOptions, FunctionRegistry};
use crate::table::{ColumnStore, ResolvedRoles, TableRoles};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Initializing,
    RunningPredistill,
    RunningInference,
    RunningEvaluation,
    RunningPostdistill,
    Done,
}

impl PipelineState {
    pub fn status_text(self) -> &'static str {
        match self {
            PipelineState::Initializing => "Initializing",
            PipelineState::RunningPredistill => "Running predistill functions",
            PipelineState::RunningInference => "Running inference",
            PipelineState::RunningEvaluation => "Running requirement evaluation",
            PipelineState::RunningPostdistill => "Running postdistill functions",
            PipelineState::Done => "Done processing",
        }
    }
}

/// Current stage, plus the error that stopped the run if there was one. A
/// failed run stays on the stage that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub error: Option<String>,
}

/// Handle on a background run.
pub struct PipelineHandle {
    task: JoinHandle<PrismResult<()>>,
    state: watch::Receiver<PipelineStatus>,
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the background task at its next await point. A stage that is
    /// mid-dispatch keeps its already spawned workers running to completion.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn join(self) -> PrismResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PrismError::Stage {
                column: "pipeline".to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Documents {
    folders: Vec<String>,
    tags: BTreeMap<String, Tag>,
    slices: BTreeMap<String, Slice>,
    reports: Vec<Report>,
}

pub struct Pipeline {
    config: PrismConfig,
    registry: FunctionRegistry,
    cache: ColumnCache,
    store: DocumentStore,
    dispatcher: Dispatcher,
    grader: Option<Arc<dyn GradingClient>>,
    author: Option<Arc<dyn LlmClient>>,
    roles: ResolvedRoles,
    table: RwLock<Arc<ColumnStore>>,
    state: watch::Sender<PipelineStatus>,
    done_running_inference: AtomicBool,
    columns: RwLock<Vec<ColumnIdentity>>,
    complete_columns: RwLock<Vec<ColumnIdentity>>,
    prompts: RwLock<PromptBook>,
    docs: RwLock<Documents>,
    in_flight: Mutex<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Pipeline {
    /// Build the table from `records` and load the project documents from the
    /// cache directory.
    pub fn new(
        config: PrismConfig,
        registry: FunctionRegistry,
        records: Vec<Map<String, Value>>,
    ) -> PrismResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_path).map_err(|e| {
            PrismError::cache(format!(
                "failed to create cache dir {}: {}",
                config.cache_path.display(),
                e
            ))
        })?;

        let roles = TableRoles {
            id_column: config.id_column.clone(),
            data_column: config.data_column.clone(),
            label_column: config.label_column.clone(),
        };
        let (table, resolved) = ColumnStore::from_records(records, &roles)?;
        let metadata: Vec<ColumnIdentity> = table.identities().to_vec();

        let cache = ColumnCache::new(&config.cache_path);
        let store = DocumentStore::new(&config.cache_path);

        let mut prompts: PromptBook = store.load(Document::Prompts);
        if prompts.is_empty() {
            prompts = PromptBook::from_seeds(&config.prompts);
        }
        let mut slices: BTreeMap<String, Slice> = store.load(Document::Slices);
        slices
            .entry(ALL_INSTANCES.to_string())
            .or_insert_with(Slice::all_instances);
        let docs = Documents {
            folders: store.load(Document::Folders),
            tags: store.load(Document::Tags),
            slices,
            reports: store.load(Document::Reports),
        };

        let dispatcher = Dispatcher::new(config.execution, config.effective_workers(), cache.clone());
        let (state, _) = watch::channel(PipelineStatus {
            state: PipelineState::Initializing,
            error: None,
        });
        info!(
            rows = table.len(),
            columns = metadata.len(),
            cache = %config.cache_path.display(),
            "pipeline ready"
        );

        Ok(Self {
            config,
            registry,
            cache,
            store,
            dispatcher,
            grader: None,
            author: None,
            roles: resolved,
            table: RwLock::new(Arc::new(table)),
            state,
            done_running_inference: AtomicBool::new(false),
            columns: RwLock::new(metadata.clone()),
            complete_columns: RwLock::new(metadata),
            prompts: RwLock::new(prompts),
            docs: RwLock::new(docs),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_grader(mut self, grader: Arc<dyn GradingClient>) -> Self {
        self.grader = Some(grader);
        self
    }

    /// Model used for prompt authoring. Also grades through it unless a
    /// grading client was set.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        if self.grader.is_none() {
            self.grader = Some(Arc::new(LlmGradingClient::new(
                llm.clone(),
                self.config.grading.concurrency,
            )));
        }
        self.author = Some(llm);
        self
    }

    pub fn config(&self) -> &PrismConfig {
        &self.config
    }

    pub fn cache(&self) -> &ColumnCache {
        &self.cache
    }

    /// Current table. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ColumnStore> {
        read(&self.table).clone()
    }

    pub fn columns(&self) -> Vec<ColumnIdentity> {
        read(&self.columns).clone()
    }

    pub fn complete_columns(&self) -> Vec<ColumnIdentity> {
        read(&self.complete_columns).clone()
    }

    pub fn done_running_inference(&self) -> bool {
        self.done_running_inference.load(Ordering::SeqCst)
    }

    pub fn pipeline_status(&self) -> PipelineStatus {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> StatusResponse {
        let status = self.pipeline_status();
        StatusResponse {
            status: status.state.status_text().to_string(),
            done_processing: status.state == PipelineState::Done,
            complete_columns: self.complete_columns(),
        }
    }

    /// Run the pipeline in a background task and return immediately.
    pub fn start_processing(self: &Arc<Self>) -> PipelineHandle {
        let this = Arc::clone(self);
        let state = self.state.subscribe();
        let task = tokio::spawn(async move {
            let result = this.process().await;
            if let Err(e) = &result {
                error!(error = %e, stage = this.pipeline_status().state.status_text(), "pipeline stopped");
                this.state.send_modify(|s| s.error = Some(e.to_string()));
            }
            result
        });
        PipelineHandle { task, state }
    }

    /// Run all four stages in order on the caller's task.
    pub async fn process(&self) -> PrismResult<()> {
        if self.registry.has_no_computation() {
            self.done_running_inference.store(true, Ordering::SeqCst);
            self.set_state(PipelineState::Done);
            return Ok(());
        }

        let pairs = self.current_pairs();
        let triples = self.current_triples();
        let _claim = self.claim(&Self::run_columns(&pairs, &triples))?;

        self.set_state(PipelineState::RunningPredistill);
        self.predistill().await?;

        self.set_state(PipelineState::RunningInference);
        self.inference(&pairs).await?;
        self.done_running_inference.store(true, Ordering::SeqCst);

        self.set_state(PipelineState::RunningEvaluation);
        self.evaluate(&triples).await?;

        self.set_state(PipelineState::RunningPostdistill);
        self.postdistill().await?;

        self.set_state(PipelineState::Done);
        Ok(())
    }

    fn set_state(&self, state: PipelineState) {
        info!(status = state.status_text(), "pipeline state");
        self.state.send_replace(PipelineStatus { state, error: None });
    }

    pub fn current_prompt_id(&self) -> Option<String> {
        read(&self.prompts).current().map(|p| p.version.clone())
    }

    pub fn prompt(&self, prompt_id: &str) -> PrismResult<Prompt> {
        read(&self.prompts).get(prompt_id).cloned()
    }

    fn current_pairs(&self) -> Vec<(String, String)> {
        let Some(prompt_id) = self.current_prompt_id() else {
            return Vec::new();
        };
        self.config
            .models
            .iter()
            .map(|m| (m.clone(), prompt_id.clone()))
            .collect()
    }

    fn current_triples(&self) -> Vec<(String, String, String)> {
        let book = read(&self.prompts);
        let Some(prompt) = book.current() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for model in &self.config.models {
            for req in prompt.ordered_requirements() {
                out.push((model.clone(), prompt.version.clone(), req.id.clone()));
            }
        }
        out
    }

    /// Options shared by every function call: roles, paths and the columns
    /// of all predistill functions.
    pub(crate) fn base_options(&self) -> FunctionOptions {
        let role = |c: &ColumnIdentity| (!c.name.is_empty()).then(|| c.clone());
        FunctionOptions {
            id_column: role(&self.roles.id),
            data_column: role(&self.roles.data),
            label_column: role(&self.roles.label),
            data_path: self.config.data_path.clone(),
            label_path: self.config.label_path.clone(),
            distill_columns: self
                .registry
                .predistill_names()
                .into_iter()
                .map(|n| (n.to_string(), ColumnIdentity::predistill(n)))
                .collect(),
            ..Default::default()
        }
    }

    /// Record `column` as known, and as complete when it has no missing rows.
    fn register_column(&self, table: &ColumnStore, column: &ColumnIdentity) {
        push_unique(&mut write(&self.columns), column.clone());
        let complete = table.contains(column) && table.missing_rows(column).is_empty();
        let mut done = write(&self.complete_columns);
        if complete {
            push_unique(&mut done, column.clone());
        } else {
            done.retain(|c| c != column);
        }
    }
}

/// Removes its keys from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    keys: Vec<String>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            set.remove(key);
        }
    }
}

impl Pipeline {
    /// Claim every column a run will write. Either all are claimed or none
    /// is, and a column stays claimed until the guard is dropped.
    fn claim(&self, columns: &[ColumnIdentity]) -> PrismResult<InFlight<'_>> {
        let keys: Vec<String> = columns.iter().map(ColumnIdentity::canonical).collect();
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = keys.iter().find(|k| set.contains(*k)) {
            return Err(PrismError::AlreadyRunning {
                column: busy.clone(),
            });
        }
        set.extend(keys.iter().cloned());
        Ok(InFlight {
            set: &self.in_flight,
            keys,
        })
    }

    /// Output columns of `pairs` and score columns of `triples`.
    fn run_columns(
        pairs: &[(String, String)],
        triples: &[(String, String, String)],
    ) -> Vec<ColumnIdentity> {
        let mut columns: Vec<ColumnIdentity> = pairs
            .iter()
            .map(|(model, prompt_id)| ColumnIdentity::output(model, prompt_id))
            .collect();
        columns.extend(
            triples
                .iter()
                .map(|(model, prompt_id, req)| ColumnIdentity::requirement_score(model, prompt_id, req)),
        );
        columns
    }
}
