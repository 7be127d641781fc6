use crate::errors::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrismConfig {
    pub version: u32,
    pub cache_path: PathBuf,
    #[serde(default)]
    pub id_column: String,
    #[serde(default)]
    pub data_column: String,
    #[serde(default)]
    pub label_column: String,
    /// Optional path prefixes the UI prepends to data and label values.
    #[serde(default)]
    pub data_path: String,
    #[serde(default)]
    pub label_path: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub execution: ExecutionMode,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub grading: GradingConfig,
    /// Seed prompts, used when the cache has no prompt book yet.
    #[serde(default)]
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradingConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on the wait for any single reply. None waits forever.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub isolate_parse_failures: bool,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            concurrency: default_concurrency(),
            timeout_seconds: None,
            isolate_parse_failures: true,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "chat/completions".to_string()
}

fn default_concurrency() -> usize {
    8
}

impl PrismConfig {
    /// Minimal config over a cache directory; everything else defaulted.
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            cache_path: cache_path.into(),
            id_column: String::new(),
            data_column: String::new(),
            label_column: String::new(),
            data_path: String::new(),
            label_path: String::new(),
            models: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            execution: ExecutionMode::default(),
            workers: None,
            editable: true,
            grading: GradingConfig::default(),
            prompts: Vec::new(),
        }
    }

    /// Worker pool size for parallel dispatch.
    pub fn effective_workers(&self) -> usize {
        self.workers
            .filter(|w| *w > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }

    pub fn validate(&self) -> PrismResult<()> {
        if self.version != SUPPORTED_CONFIG_VERSION {
            return Err(PrismError::config(format!(
                "unsupported config version {} (supported: {})",
                self.version, SUPPORTED_CONFIG_VERSION
            )));
        }
        if self.batch_size == 0 {
            return Err(PrismError::config("batch_size must be positive"));
        }
        if self.grading.concurrency == 0 {
            return Err(PrismError::config("grading.concurrency must be positive"));
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.models {
            if m.is_empty() {
                return Err(PrismError::config("model names must not be empty"));
            }
            if !seen.insert(m.as_str()) {
                return Err(PrismError::config(format!("duplicate model '{}'", m)));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> PrismResult<PrismConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PrismError::config(format!("failed to read config {}: {}", path.display(), e))
    })?;
    let mut cfg: PrismConfig = serde_yaml::from_str(&raw)
        .map_err(|e| PrismError::config(format!("failed to parse YAML: {}", e)))?;
    cfg.validate()?;
    if cfg.cache_path.is_relative() {
        if let Some(parent) = path.parent() {
            cfg.cache_path = parent.join(&cfg.cache_path);
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("prism.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "version: 1\ncache_path: .prism\nmodels: [gpt-4o]\nlabel_column: label\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.execution, ExecutionMode::Parallel);
        assert!(cfg.editable);
        assert!(cfg.grading.isolate_parse_failures);
        assert_eq!(cfg.cache_path, dir.path().join(".prism"));
        assert!(cfg.effective_workers() >= 1);
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "version: 2\ncache_path: c\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn rejects_duplicate_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "version: 1\ncache_path: c\nmodels: [a, a]\n");
        assert!(matches!(
            load_config(&path),
            Err(PrismError::Config { .. })
        ));
    }

    #[test]
    fn parses_sequential_and_grading_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "version: 1\ncache_path: /tmp/x\nexecution: sequential\nworkers: 2\n\
             grading:\n  endpoint: grade\n  concurrency: 3\n  timeout_seconds: 30\n  isolate_parse_failures: false\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.execution, ExecutionMode::Sequential);
        assert_eq!(cfg.effective_workers(), 2);
        assert_eq!(cfg.grading.endpoint, "grade");
        assert_eq!(cfg.grading.timeout_seconds, Some(30));
        assert!(!cfg.grading.isolate_parse_failures);
    }
}
