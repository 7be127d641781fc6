//! Anchoring requirement snippets inside prompt text.
//!
//! Model-authored snippets are usually close paraphrases of the prompt
//! wording. The aligner finds the window of the prompt most similar to the
//! snippet, and the annotator wraps it as a `<req>` span.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

/// Best window of the prompt for a snippet. Offsets are in chars, half-open.
#[derive(Debug, Clone, PartialEq)]
pub struct SnippetMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub ratio: f64,
}

/// A requirement to anchor: its id, display name and snippet.
#[derive(Debug, Clone)]
pub struct Anchor<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub snippet: &'a str,
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// `2 * lcs / (|a| + |b|)`, 1.0 for two empty strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / (a.len() + b.len()) as f64
}

/// One char to one char, so folded text keeps the original offsets.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Slide a window the length of the whitespace-collapsed snippet across
/// `prompt` and return the most similar window, compared case-insensitively.
/// The leftmost window wins ties. The returned text is the prompt's own
/// wording with surrounding whitespace trimmed.
pub fn find_best_match(prompt: &str, snippet: &str) -> Option<SnippetMatch> {
    let needle: Vec<char> = collapse_whitespace(snippet).chars().map(fold).collect();
    let hay: Vec<char> = prompt.chars().collect();
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    let folded: Vec<char> = hay.iter().copied().map(fold).collect();
    let width = needle.len();

    let mut best: Option<(usize, f64)> = None;
    for start in 0..=hay.len() - width {
        let window: String = folded[start..start + width].iter().collect();
        let normalized: Vec<char> = collapse_whitespace(&window).chars().collect();
        let total = needle.len() + normalized.len();
        let ratio = 2.0 * lcs_len(&needle, &normalized) as f64 / total as f64;
        if ratio > best.map_or(0.0, |(_, r)| r) {
            best = Some((start, ratio));
        }
    }

    let (mut start, ratio) = best?;
    let mut end = start + width;
    if hay[start..end].iter().any(|c| !c.is_whitespace()) {
        while hay[start].is_whitespace() {
            start += 1;
        }
        while hay[end - 1].is_whitespace() {
            end -= 1;
        }
    }
    Some(SnippetMatch {
        text: hay[start..end].iter().collect(),
        start,
        end,
        ratio,
    })
}

lazy_static! {
    /// A whole `<req>` span, content included.
    static ref ANNOTATION: Regex = Regex::new(r#"(?s)<req name="[^"]*"[^>]*>.*?</req>"#).unwrap();
    /// Any single tag of the annotation markup.
    static ref MARKUP: Regex =
        Regex::new(r#"</?(?:prompt|text)>|<req name="[^"]*"[^>]*>|</req>"#).unwrap();
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

/// Wrap every stretch of text outside a `<req>` span in `<text>`. `<req>`
/// spans pass through unchanged, so stripping the markup gives back `text`.
pub fn wrap_plain_segments(text: &str) -> String {
    fn push_plain(segment: &str, out: &mut String) {
        if !segment.is_empty() {
            out.push_str("<text>");
            out.push_str(segment);
            out.push_str("</text>");
        }
    }

    let mut out = String::with_capacity(text.len() + 32);
    let mut last = 0;
    for m in ANNOTATION.find_iter(text) {
        push_plain(&text[last..m.start()], &mut out);
        out.push_str(m.as_str());
        last = m.end();
    }
    push_plain(&text[last..], &mut out);
    out
}

/// Remove `<prompt>`, `<text>` and `<req>` markup, keeping the content.
pub fn strip_annotations(text: &str) -> String {
    MARKUP.replace_all(text, "").into_owned()
}

/// Wrap the best match of `anchor` in `text` as a `<req>` span.
pub fn annotate_requirement(text: &str, anchor: &Anchor<'_>) -> Option<String> {
    let m = find_best_match(text, anchor.snippet)?;
    let chars: Vec<char> = text.chars().collect();
    let before: String = chars[..m.start].iter().collect();
    let after: String = chars[m.end..].iter().collect();
    Some(format!(
        "{}<req name=\"{}\" id=\"{}\">{}</req>{}",
        before,
        escape_attr(anchor.name),
        escape_attr(anchor.id),
        m.text,
        after
    ))
}

/// Rebuild the annotated form of a prompt from its plain text: each anchor
/// is matched against the plain text, overlapping matches keep the earlier
/// anchor, the rest is wrapped as `<text>` and the whole as `<prompt>`.
pub fn annotate_prompt(text: &str, anchors: &[Anchor<'_>]) -> String {
    anchor_prompt(text, anchors).0
}

/// [`annotate_prompt`], also returning the literal prompt text each anchor
/// matched, keyed by anchor id. Anchors without a match are left out.
pub fn anchor_prompt(text: &str, anchors: &[Anchor<'_>]) -> (String, BTreeMap<String, String>) {
    let plain = strip_annotations(text);
    let chars: Vec<char> = plain.chars().collect();

    let mut matched = BTreeMap::new();
    let mut spans: Vec<(usize, usize, &Anchor<'_>)> = Vec::new();
    for anchor in anchors {
        let Some(m) = find_best_match(&plain, anchor.snippet) else {
            tracing::debug!(requirement = anchor.id, "snippet has no match in prompt");
            continue;
        };
        matched.insert(anchor.id.to_string(), m.text);
        if spans.iter().any(|(s, e, _)| m.start < *e && *s < m.end) {
            tracing::debug!(requirement = anchor.id, "snippet overlaps an earlier requirement");
            continue;
        }
        spans.push((m.start, m.end, anchor));
    }
    spans.sort_by_key(|(s, _, _)| *s);

    let mut body = String::with_capacity(plain.len() + spans.len() * 32);
    let mut pos = 0;
    for (start, end, anchor) in spans {
        body.extend(&chars[pos..start]);
        body.push_str(&format!(
            "<req name=\"{}\" id=\"{}\">",
            escape_attr(anchor.name),
            escape_attr(anchor.id)
        ));
        body.extend(&chars[start..end]);
        body.push_str("</req>");
        pos = end;
    }
    body.extend(&chars[pos..]);
    (format!("<prompt>{}</prompt>", wrap_plain_segments(&body)), matched)
}
