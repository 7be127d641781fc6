//! Model-assisted prompt authoring: requirement extraction, prompt
//! compilation and requirement completion.

use super::align::{anchor_prompt, strip_annotations, Anchor};
use super::templates::{self, AUTHORING_SYSTEM};
use super::{Prompt, Requirement};
use crate::evaluation::parse::extract_json;
use crate::providers::llm::LlmClient;
use crate::table::value_as_key;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Annotated form of an empty prompt.
pub const EMPTY_PROMPT: &str = "<prompt></prompt>";

#[derive(Debug, Deserialize)]
struct ExtractedRequirement {
    #[serde(default = "unnamed")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "evaluationMethod")]
    evaluation_method: String,
    #[serde(default, alias = "promptSnippet")]
    prompt_snippet: String,
}

fn unnamed() -> String {
    "Unnamed Requirement".to_string()
}

#[derive(Debug, Deserialize)]
struct CompiledPrompt {
    #[serde(alias = "Prompt")]
    prompt: String,
    #[serde(default, alias = "Requirements_prompt_snippets")]
    requirements_prompt_snippets: Vec<SnippetAssignment>,
}

#[derive(Debug, Deserialize)]
struct SnippetAssignment {
    requirement_id: Value,
    #[serde(default)]
    prompt_snippet: String,
}

#[derive(Debug, Deserialize)]
struct OptimizedRequirement {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    evaluation_method: String,
}

async fn ask(llm: &dyn LlmClient, prompt: &str) -> anyhow::Result<Value> {
    let system = [AUTHORING_SYSTEM.to_string()];
    let resp = llm.complete(prompt, Some(&system[..])).await?;
    debug!(provider = llm.provider_name(), model = %resp.model, "authoring reply");
    extract_json(&resp.text)
}

/// Re-anchor every requirement snippet of `prompt` in its text. Each
/// anchored snippet is replaced by the prompt wording it matched.
pub fn reannotate(prompt: &mut Prompt) {
    let reqs = prompt.ordered_requirements();
    let anchors: Vec<Anchor<'_>> = reqs
        .iter()
        .filter(|r| !r.prompt_snippet.trim().is_empty())
        .map(|r| Anchor {
            id: r.id.as_str(),
            name: r.name.as_str(),
            snippet: r.prompt_snippet.trim(),
        })
        .collect();
    let (text, matched) = anchor_prompt(&prompt.text, &anchors);
    prompt.text = text;
    for (id, literal) in matched {
        if let Some(req) = prompt.requirements.get_mut(&id) {
            req.prompt_snippet = literal;
        }
    }
}

/// Ask the model for the requirements stated in `prompt` and attach them.
/// Returns the ids of the new requirements.
pub async fn extract_requirements(
    llm: &dyn LlmClient,
    prompt: &mut Prompt,
) -> anyhow::Result<Vec<String>> {
    let plain = strip_annotations(&prompt.text);
    if prompt.text == EMPTY_PROMPT || plain.trim().is_empty() {
        return Ok(Vec::new());
    }
    let request = templates::render(templates::REQUIREMENT_EXTRACTOR, &[("prompt", plain.as_str())]);
    let reply = ask(llm, &request).await?;
    let items = match reply {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("requirements") {
            Some(Value::Array(items)) => items,
            _ => anyhow::bail!("extraction reply has no requirement list"),
        },
        _ => anyhow::bail!("extraction reply is not a list"),
    };

    let mut added = Vec::new();
    for item in items {
        let extracted: ExtractedRequirement = match serde_json::from_value(item) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "skipping malformed extracted requirement");
                continue;
            }
        };
        added.push(prompt.add_requirement(Requirement {
            name: extracted.name,
            description: extracted.description,
            evaluation_method: extracted.evaluation_method,
            prompt_snippet: extracted.prompt_snippet.trim().to_string(),
            ..Default::default()
        }));
    }
    prompt.text = plain;
    reannotate(prompt);
    info!(prompt = %prompt.version, requirements = added.len(), "extracted requirements");
    Ok(added)
}

/// Rewrite `prompt` so it states all of its requirements. Requirements
/// without a snippet get the one the model wrote for them.
pub async fn compile_prompt(llm: &dyn LlmClient, prompt: &mut Prompt) -> anyhow::Result<()> {
    if prompt.requirements.is_empty() {
        reannotate(prompt);
        return Ok(());
    }
    let listing: Vec<Value> = prompt
        .ordered_requirements()
        .iter()
        .map(|r| {
            json!({
                "requirement_id": r.id,
                "name": r.name,
                "description": r.description,
                "prompt_snippet": r.prompt_snippet,
            })
        })
        .collect();
    let listing = serde_json::to_string_pretty(&listing)?;
    let request = templates::render(templates::PROMPT_COMPILER, &[("requirements", listing.as_str())]);
    let reply: CompiledPrompt = serde_json::from_value(ask(llm, &request).await?)
        .map_err(|e| anyhow::anyhow!("compile reply has unexpected shape: {}", e))?;

    for assignment in reply.requirements_prompt_snippets {
        let id = value_as_key(&assignment.requirement_id);
        match prompt.requirements.get_mut(&id) {
            Some(req) if req.prompt_snippet.trim().is_empty() => {
                req.prompt_snippet = assignment.prompt_snippet.trim().to_string();
            }
            Some(_) => {}
            None => warn!(requirement = %id, "compile reply names an unknown requirement"),
        }
    }
    prompt.text = reply.prompt;
    reannotate(prompt);
    info!(prompt = %prompt.version, "compiled prompt");
    Ok(())
}

/// Fill the empty `name`, `description` and `evaluation_method` fields of
/// `req`. Fields that already have text are never replaced.
pub async fn optimize_requirement(
    llm: &dyn LlmClient,
    req: &Requirement,
) -> anyhow::Result<Requirement> {
    let mut out = req.clone();
    if !req.name.is_empty() && !req.description.is_empty() && !req.evaluation_method.is_empty() {
        return Ok(out);
    }
    let current = json!({
        "name": req.name,
        "description": req.description,
        "evaluation_method": req.evaluation_method,
    });
    let request = templates::render(
        templates::REQUIREMENT_OPTIMIZER,
        &[("requirement", current.to_string().as_str())],
    );
    let filled: OptimizedRequirement = serde_json::from_value(ask(llm, &request).await?)
        .map_err(|e| anyhow::anyhow!("optimizer reply has unexpected shape: {}", e))?;

    for (slot, suggestion) in [
        (&mut out.name, filled.name),
        (&mut out.description, filled.description),
        (&mut out.evaluation_method, filled.evaluation_method),
    ] {
        if slot.is_empty() {
            *slot = suggestion;
        }
    }
    Ok(out)
}
