//! Instructions sent to the authoring model. Placeholders are `{{name}}`.

pub const AUTHORING_SYSTEM: &str = "You are a careful prompt engineer. \
     Reply with JSON only, no prose and no code fences.";

pub const REQUIREMENT_EXTRACTOR: &str = r#"Read the prompt below and list the success criteria a reviewer would use to judge a model's answer to it.

Rules:
1. Return a JSON array. Each element has the keys "name", "description", "evaluation_method" and "prompt_snippet".
2. "prompt_snippet" must copy the exact wording of the prompt that states the criterion.
3. Merge criteria that say the same thing; list each criterion once.
4. Write "evaluation_method" as short, objective, numbered steps.
5. Keep every field brief.

Prompt: '''{{prompt}}'''
"#;

pub const PROMPT_COMPILER: &str = r#"Write one prompt that satisfies every requirement listed below.

Rules:
1. When a requirement has a non-empty "prompt_snippet", the prompt must contain that text word for word.
2. When a requirement has an empty "prompt_snippet", write a sentence for it and report that sentence, exactly as it appears in the prompt, as its snippet.
3. Reply with a JSON object of the form
   {"prompt": "<the prompt>", "requirements_prompt_snippets": [{"requirement_id": "<id>", "prompt_snippet": "<snippet>"}]}
   listing only the requirements whose snippet you wrote.

Requirements: '''{{requirements}}'''
"#;

pub const REQUIREMENT_OPTIMIZER: &str = r#"Complete the requirement below. It has the fields "name", "description" and "evaluation_method".

Rules:
1. Any field that is an empty string must be filled in, based on the description and the other fields.
2. Any field that already has text must be returned unchanged.
3. An "evaluation_method" you write must be a list of concrete, checkable steps.

Example of a complete requirement:
{"name": "answer-length", "description": "Answers stay under 50 words.", "evaluation_method": "1. Count the words of the answer.\n2. Fail it if the count exceeds 50."}

Reply with the completed requirement as a JSON object with the same three keys.

Requirement: {{requirement}}
"#;

/// Substitute `{{key}}` placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_placeholders() {
        let out = render(REQUIREMENT_EXTRACTOR, &[("prompt", "Be brief.")]);
        assert!(out.contains("Prompt: '''Be brief.'''"));
        assert!(!out.contains("{{prompt}}"));
    }
}
