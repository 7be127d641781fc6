//! Column identity: the canonical key of every column in the table and every
//! file in the column cache.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// What produced a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnKind {
    Metadata,
    Predistill,
    Output,
    Embedding,
    Postdistill,
}

impl ColumnKind {
    /// Prefix used in the canonical string. Metadata columns carry none.
    pub fn prefix(self) -> &'static str {
        match self {
            ColumnKind::Metadata => "",
            ColumnKind::Predistill => "PREDISTILL",
            ColumnKind::Output => "OUTPUT",
            ColumnKind::Embedding => "EMBEDDING",
            ColumnKind::Postdistill => "POSTDISTILL",
        }
    }
}

/// Value shape of a column, inferred from its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetadataType {
    Nominal,
    Continuous,
    Boolean,
    Datetime,
    #[default]
    Other,
}

/// Structural identity of a column.
///
/// Equality, ordering and hashing all go through [`ColumnIdentity::canonical`],
/// so two identities with the same canonical string are the same column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnIdentity {
    #[serde(rename = "columnType")]
    pub kind: ColumnKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// Name prefix of requirement score columns.
pub const SCORE_PREFIX: &str = "score_";
/// Name prefix of requirement rationale columns.
pub const RATIONALE_PREFIX: &str = "rationale_";

impl ColumnIdentity {
    pub fn new(
        kind: ColumnKind,
        name: impl Into<String>,
        model: Option<&str>,
        prompt_id: Option<&str>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            model: model.filter(|m| !m.is_empty()).map(str::to_string),
            prompt_id: prompt_id.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn metadata(name: impl Into<String>) -> Self {
        Self::new(ColumnKind::Metadata, name, None, None)
    }

    pub fn predistill(name: impl Into<String>) -> Self {
        Self::new(ColumnKind::Predistill, name, None, None)
    }

    /// Result of a postdistill function over one model's outputs for one
    /// prompt version.
    pub fn postdistill(name: impl Into<String>, model: &str, prompt_id: &str) -> Self {
        Self::new(ColumnKind::Postdistill, name, Some(model), Some(prompt_id))
    }

    pub fn output(model: &str, prompt_id: &str) -> Self {
        Self::new(ColumnKind::Output, "output", Some(model), Some(prompt_id))
    }

    pub fn embedding(model: &str, prompt_id: &str) -> Self {
        Self::new(ColumnKind::Embedding, "embedding", Some(model), Some(prompt_id))
    }

    /// Pass/fail column of one requirement graded against one model's outputs.
    pub fn requirement_score(model: &str, prompt_id: &str, requirement_id: &str) -> Self {
        Self::new(
            ColumnKind::Postdistill,
            format!("{SCORE_PREFIX}{requirement_id}"),
            Some(model),
            Some(prompt_id),
        )
    }

    /// Grader rationale paired with [`ColumnIdentity::requirement_score`].
    pub fn requirement_rationale(model: &str, prompt_id: &str, requirement_id: &str) -> Self {
        Self::new(
            ColumnKind::Postdistill,
            format!("{RATIONALE_PREFIX}{requirement_id}"),
            Some(model),
            Some(prompt_id),
        )
    }

    /// `kind-prefix ++ name ++ model ++ "_" ++ prompt_id`; the prompt part is
    /// dropped when there is no prompt.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + 32);
        out.push_str(self.kind.prefix());
        out.push_str(&self.name);
        if let Some(model) = &self.model {
            out.push_str(model);
        }
        if let Some(prompt) = &self.prompt_id {
            out.push('_');
            out.push_str(prompt);
        }
        out
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == ColumnKind::Metadata
    }

    /// Companion column `{name}.{suffix}` produced by the same function call.
    pub fn derived(&self, suffix: &str) -> Self {
        Self {
            kind: self.kind,
            name: format!("{}.{}", self.name, suffix),
            model: self.model.clone(),
            prompt_id: self.prompt_id.clone(),
        }
    }

    pub fn is_derived_from(&self, base: &ColumnIdentity) -> bool {
        self.kind == base.kind
            && self.model == base.model
            && self.prompt_id == base.prompt_id
            && self
                .name
                .strip_prefix(base.name.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|suffix| !suffix.is_empty())
    }

    /// Score or rationale column of a graded requirement.
    pub fn is_requirement_column(&self) -> bool {
        self.kind == ColumnKind::Postdistill
            && (self.name.starts_with(SCORE_PREFIX) || self.name.starts_with(RATIONALE_PREFIX))
    }
}

impl fmt::Display for ColumnIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl PartialEq for ColumnIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for ColumnIdentity {}

impl Hash for ColumnIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl PartialOrd for ColumnIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

/// Push `identity` unless an equal identity is already present.
pub fn push_unique(list: &mut Vec<ColumnIdentity>, identity: ColumnIdentity) -> bool {
    if list.contains(&identity) {
        return false;
    }
    list.push(identity);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn metadata_has_no_prefix() {
        assert_eq!(ColumnIdentity::metadata("label").canonical(), "label");
    }

    #[test]
    fn canonical_layout() {
        assert_eq!(
            ColumnIdentity::output("gpt-4o", "v2").canonical(),
            "OUTPUToutputgpt-4o_v2"
        );
        assert_eq!(
            ColumnIdentity::postdistill("length", "gpt-4o", "v2").canonical(),
            "POSTDISTILLlengthgpt-4o_v2"
        );
        assert_eq!(
            ColumnIdentity::predistill("word_count").canonical(),
            "PREDISTILLword_count"
        );
        assert_eq!(
            ColumnIdentity::requirement_score("m", "v1", "3").canonical(),
            "POSTDISTILLscore_3m_v1"
        );
    }

    #[test]
    fn derived_columns_share_model_and_prompt() {
        let base = ColumnIdentity::postdistill("length", "m", "v1");
        let words = base.derived("words");
        assert_eq!(words.canonical(), "POSTDISTILLlength.wordsm_v1");
        assert!(words.is_derived_from(&base));
        assert!(!base.is_derived_from(&base));
        assert!(!words.is_derived_from(&ColumnIdentity::postdistill("length", "m", "v2")));
        assert!(!ColumnIdentity::postdistill("lengthy", "m", "v1").is_derived_from(&base));
    }

    #[test]
    fn empty_model_and_prompt_are_absent() {
        let a = ColumnIdentity::new(ColumnKind::Predistill, "f", Some(""), Some(""));
        assert_eq!(a, ColumnIdentity::predistill("f"));
        assert_eq!(a.model, None);
        assert_eq!(a.prompt_id, None);
    }

    #[test]
    fn equality_follows_canonical_string() {
        let a = ColumnIdentity::output("m", "v1");
        let b = ColumnIdentity::output("m", "v1");
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(!set.insert(b));

        let mut list = vec![a];
        assert!(!push_unique(&mut list, ColumnIdentity::output("m", "v1")));
        assert!(push_unique(&mut list, ColumnIdentity::output("m", "v2")));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn enumerated_identities_do_not_collide() {
        let models = ["gpt-4o", "gpt-4o-mini", "llama3"];
        let prompts = ["v1", "v2", "v10"];
        let distills = ["length", "sentiment"];
        let requirements = ["0", "1", "12"];

        let mut all = Vec::new();
        for d in distills {
            all.push(ColumnIdentity::predistill(d));
            for m in models {
                for p in prompts {
                    all.push(ColumnIdentity::postdistill(d, m, p));
                }
            }
        }
        for m in models {
            for p in prompts {
                all.push(ColumnIdentity::output(m, p));
                all.push(ColumnIdentity::embedding(m, p));
                for r in requirements {
                    all.push(ColumnIdentity::requirement_score(m, p, r));
                    all.push(ColumnIdentity::requirement_rationale(m, p, r));
                }
            }
        }
        let strings: HashSet<String> = all.iter().map(|c| c.canonical()).collect();
        assert_eq!(strings.len(), all.len());
    }

    #[test]
    fn serde_uses_camel_case_wire_names() {
        let col = ColumnIdentity::output("m", "v1");
        let v = serde_json::to_value(&col).unwrap();
        assert_eq!(v["columnType"], "OUTPUT");
        assert_eq!(v["promptId"], "v1");
        let back: ColumnIdentity = serde_json::from_value(v).unwrap();
        assert_eq!(back, col);
    }
}
