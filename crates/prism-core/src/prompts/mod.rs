//! Prompt versions and the requirements attached to them.

pub mod align;
pub mod authoring;
pub mod templates;

use crate::errors::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A labelled output used as grounding for requirement edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Example {
    #[serde(default)]
    pub id: String,
    pub input: String,
    pub output: String,
    pub is_positive: bool,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt_snippet: String,
    #[serde(default)]
    pub evaluation_method: String,
    #[serde(default)]
    pub examples: Vec<Example>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub text: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn requirement(&self, id: &str) -> PrismResult<&Requirement> {
        self.requirements
            .get(id)
            .ok_or_else(|| PrismError::UnknownRequirement {
                prompt_id: self.version.clone(),
                requirement_id: id.to_string(),
            })
    }

    pub fn requirement_mut(&mut self, id: &str) -> PrismResult<&mut Requirement> {
        let version = self.version.clone();
        self.requirements
            .get_mut(id)
            .ok_or_else(|| PrismError::UnknownRequirement {
                prompt_id: version,
                requirement_id: id.to_string(),
            })
    }

    /// Requirements ordered by numeric id where ids are numeric.
    pub fn ordered_requirements(&self) -> Vec<&Requirement> {
        let mut reqs: Vec<&Requirement> = self.requirements.values().collect();
        reqs.sort_by_key(|r| (r.id.parse::<u64>().unwrap_or(u64::MAX), r.id.clone()));
        reqs
    }

    /// Smallest unused numeric requirement id.
    pub fn next_requirement_id(&self) -> String {
        self.requirements
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .map_or(0, |m| m + 1)
            .to_string()
    }

    /// Attach `req` under a fresh id and return that id.
    pub fn add_requirement(&mut self, mut req: Requirement) -> String {
        let id = self.next_requirement_id();
        req.id = id.clone();
        self.requirements.insert(id.clone(), req);
        id
    }

    /// Take the text and requirement wording of `authored`, a copy of this
    /// prompt edited by an authoring model. Examples recorded on `self` in
    /// the meantime are kept.
    pub fn absorb_authored(&mut self, authored: Prompt) {
        self.text = authored.text;
        for (id, req) in authored.requirements {
            match self.requirements.get_mut(&id) {
                Some(live) => {
                    live.name = req.name;
                    live.description = req.description;
                    live.evaluation_method = req.evaluation_method;
                    live.prompt_snippet = req.prompt_snippet;
                }
                None => {
                    self.requirements.insert(id, req);
                }
            }
        }
    }
}

/// All prompt versions, oldest first. The last one is current.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptBook {
    prompts: Vec<Prompt>,
}

impl PromptBook {
    /// Book seeded from plain texts as `v1`, `v2`, ... An empty seed list
    /// yields a single empty `v1`.
    pub fn from_seeds(texts: &[String]) -> Self {
        let mut book = Self::default();
        if texts.is_empty() {
            book.push(Prompt::new(""));
        }
        for text in texts {
            book.push(Prompt::new(text.clone()));
        }
        book
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn versions(&self) -> Vec<String> {
        self.prompts.iter().map(|p| p.version.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prompt> {
        self.prompts.iter()
    }

    pub fn current(&self) -> Option<&Prompt> {
        self.prompts.last()
    }

    pub fn get(&self, version: &str) -> PrismResult<&Prompt> {
        self.prompts
            .iter()
            .find(|p| p.version == version)
            .ok_or_else(|| PrismError::UnknownPrompt {
                prompt_id: version.to_string(),
            })
    }

    pub fn get_mut(&mut self, version: &str) -> PrismResult<&mut Prompt> {
        self.prompts
            .iter_mut()
            .find(|p| p.version == version)
            .ok_or_else(|| PrismError::UnknownPrompt {
                prompt_id: version.to_string(),
            })
    }

    /// `v{max+1}` over the existing numeric versions.
    pub fn new_prompt_version(&self) -> String {
        let max = self
            .prompts
            .iter()
            .filter_map(|p| p.version.strip_prefix('v'))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("v{}", max + 1)
    }

    /// Append `prompt` as the newest version and return that version.
    pub fn push(&mut self, mut prompt: Prompt) -> String {
        let version = self.new_prompt_version();
        prompt.version = version.clone();
        for (id, req) in prompt.requirements.iter_mut() {
            if req.id.is_empty() {
                req.id = id.clone();
            }
        }
        self.prompts.push(prompt);
        version
    }
}
