use serde_json::Value;

/// Pass/fail verdict parsed from a grader reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub rationale: String,
}

/// First JSON object or array embedded in `text`. Models like to wrap JSON
/// in prose or code fences.
pub fn extract_json(text: &str) -> anyhow::Result<Value> {
    let text = text.trim();
    let start = match (text.find('{'), text.find('[')) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => anyhow::bail!("no JSON start ({{ or [) found in reply"),
    };
    serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no JSON value found in reply"))?
        .map_err(|e| anyhow::anyhow!("invalid JSON: {}", e))
}

fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "pass" | "passed" => Some(true),
            "false" | "0" | "no" | "fail" | "failed" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse `{"passed": ..., "rationale": ...}`. `passed` may be a bool, a
/// number (non-zero is a pass) or a boolean-like string.
pub fn parse_verdict(text: &str) -> anyhow::Result<Verdict> {
    let val = extract_json(text)?;
    let passed = val
        .get("passed")
        .and_then(coerce_bool)
        .ok_or_else(|| anyhow::anyhow!("grader JSON missing 'passed' field"))?;
    let rationale = val
        .get("rationale")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Ok(Verdict { passed, rationale })
}
