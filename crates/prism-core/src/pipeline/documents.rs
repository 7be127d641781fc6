//! Editable project documents: folders, tags, slices, reports and prompts.
//!
//! Every mutation is a silent no-op when the project is not editable.

use super::{read, write, Pipeline};
use crate::cache::documents::Document;
use crate::column::ColumnIdentity;
use crate::errors::{PrismError, PrismResult};
use crate::prompts::{authoring, Example, Prompt, PromptBook, Requirement};
use crate::providers::llm::LlmClient;
use crate::query::{EvaluatorFeedback, Report, Slice, Tag, ALL_INSTANCES};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

impl Pipeline {
    pub fn editable(&self) -> bool {
        self.config.editable
    }

    fn author(&self) -> anyhow::Result<Arc<dyn LlmClient>> {
        self.author
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no authoring model configured"))
    }

    pub fn folders(&self) -> Vec<String> {
        read(&self.docs).folders.clone()
    }

    pub fn set_folders(&self, folders: Vec<String>) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        docs.folders = folders;
        self.store.save(Document::Folders, &docs.folders)
    }

    pub fn tags(&self) -> BTreeMap<String, Tag> {
        read(&self.docs).tags.clone()
    }

    /// Create or replace the tag with the same name.
    pub fn create_new_tag(&self, tag: Tag) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        debug!(tag = %tag.tag_name, rows = tag.selection_ids.ids.len(), "saving tag");
        docs.tags.insert(tag.tag_name.clone(), tag);
        self.store.save(Document::Tags, &docs.tags)
    }

    pub fn delete_tag(&self, name: &str) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        if docs.tags.remove(name).is_none() {
            return Ok(());
        }
        self.store.save(Document::Tags, &docs.tags)
    }

    pub fn slices(&self) -> BTreeMap<String, Slice> {
        read(&self.docs).slices.clone()
    }

    pub fn create_new_slice(&self, slice: Slice) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        docs.slices.insert(slice.slice_name.clone(), slice);
        self.store.save(Document::Slices, &docs.slices)
    }

    /// Delete a slice. "All Instances" cannot be deleted.
    pub fn delete_slice(&self, name: &str) -> PrismResult<()> {
        if !self.editable() || name == ALL_INSTANCES {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        if docs.slices.remove(name).is_none() {
            return Ok(());
        }
        self.store.save(Document::Slices, &docs.slices)
    }

    pub fn reports(&self) -> Vec<Report> {
        read(&self.docs).reports.clone()
    }

    pub fn set_reports(&self, reports: Vec<Report>) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut docs = write(&self.docs);
        docs.reports = reports;
        self.store.save(Document::Reports, &docs.reports)
    }

    pub fn prompts(&self) -> PromptBook {
        read(&self.prompts).clone()
    }

    fn save_prompts(&self, book: &PromptBook) -> PrismResult<()> {
        self.store.save(Document::Prompts, book)
    }

    /// Add `prompt` as the newest version and make it current.
    ///
    /// With an authoring model the prompt is compiled first; without one its
    /// existing snippets are only re-anchored. Returns `None` when the project
    /// is not editable.
    pub async fn create_new_prompt(&self, mut prompt: Prompt) -> anyhow::Result<Option<Prompt>> {
        if !self.editable() {
            return Ok(None);
        }
        match &self.author {
            Some(llm) => authoring::compile_prompt(llm.as_ref(), &mut prompt).await?,
            None => authoring::reannotate(&mut prompt),
        }
        let mut book = write(&self.prompts);
        let version = book.push(prompt);
        self.save_prompts(&book)?;
        info!(prompt = %version, "created prompt");
        Ok(Some(book.get(&version)?.clone()))
    }

    /// Extract requirements from a prompt's text and attach them.
    pub async fn extract_requirements(&self, prompt_id: &str) -> anyhow::Result<Vec<String>> {
        if !self.editable() {
            return Ok(Vec::new());
        }
        let llm = self.author()?;
        let mut prompt = self.prompt(prompt_id)?;
        let added = authoring::extract_requirements(llm.as_ref(), &mut prompt).await?;
        self.merge_authored(prompt)?;
        Ok(added)
    }

    pub async fn compile_prompt(&self, prompt_id: &str) -> anyhow::Result<()> {
        if !self.editable() {
            return Ok(());
        }
        let llm = self.author()?;
        let mut prompt = self.prompt(prompt_id)?;
        authoring::compile_prompt(llm.as_ref(), &mut prompt).await?;
        self.merge_authored(prompt)?;
        Ok(())
    }

    /// Suggest text for the empty fields of `requirement`. Nothing is saved.
    pub async fn optimize_requirement(&self, requirement: &Requirement) -> anyhow::Result<Requirement> {
        let llm = self.author()?;
        authoring::optimize_requirement(llm.as_ref(), requirement).await
    }

    /// Merge an authored copy back into the book under the lock, so edits
    /// made while the model was answering survive.
    fn merge_authored(&self, authored: Prompt) -> PrismResult<()> {
        let mut book = write(&self.prompts);
        let version = authored.version.clone();
        book.get_mut(&version)?.absorb_authored(authored);
        self.save_prompts(&book)
    }

    /// Append an example to a requirement. Examples without an id get their
    /// position as id.
    pub fn add_example(
        &self,
        prompt_id: &str,
        requirement_id: &str,
        mut example: Example,
    ) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        let mut book = write(&self.prompts);
        let requirement = book.get_mut(prompt_id)?.requirement_mut(requirement_id)?;
        if example.id.is_empty() {
            example.id = requirement.examples.len().to_string();
        }
        requirement.examples.push(example);
        self.save_prompts(&book)
    }

    /// Overwrite one graded verdict with a user's correction and persist the
    /// score column.
    pub fn record_evaluator_feedback(&self, feedback: &EvaluatorFeedback) -> PrismResult<()> {
        if !self.editable() {
            return Ok(());
        }
        self.prompt(&feedback.prompt_id)?
            .requirement(&feedback.requirement_id)?;
        let score = ColumnIdentity::requirement_score(
            &feedback.model,
            &feedback.prompt_id,
            &feedback.requirement_id,
        );

        let mut guard = write(&self.table);
        let table = Arc::make_mut(&mut guard);
        let row = table.position(&feedback.example_id).ok_or_else(|| {
            PrismError::config(format!("unknown row '{}'", feedback.example_id))
        })?;
        self.cache.load(&score, table)?;
        table.ensure_column(&score);
        table.set_cell(&score, row, Value::Bool(feedback.corrected_eval));
        table.refresh_metadata_type(&score);
        self.cache.persist(&score, table)?;
        self.register_column(table, &score);
        info!(column = %score, row = %feedback.example_id, verdict = feedback.corrected_eval, "recorded feedback");
        Ok(())
    }
}
