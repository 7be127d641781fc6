//! Auxiliary documents stored next to the column files.

use crate::errors::{PrismError, PrismResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Folders,
    Tags,
    Slices,
    Reports,
    Prompts,
}

impl Document {
    pub const ALL: [Document; 5] = [
        Document::Folders,
        Document::Tags,
        Document::Slices,
        Document::Reports,
        Document::Prompts,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Document::Folders => "folders.json",
            Document::Tags => "tags.json",
            Document::Slices => "slices.json",
            Document::Reports => "reports.json",
            Document::Prompts => "prompts.json",
        }
    }
}

pub(crate) fn is_document_file(name: &str) -> bool {
    Document::ALL.iter().any(|d| d.file_name() == name)
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, doc: Document) -> PathBuf {
        self.dir.join(doc.file_name())
    }

    /// Load a document. Absent and undecodable files both yield the default.
    pub fn load<T: DeserializeOwned + Default>(&self, doc: Document) -> T {
        let path = self.path(doc);
        let bytes = match super::io::read_optional(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return T::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read document");
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed document, using default");
                T::default()
            }
        }
    }

    /// Whether the document has ever been saved.
    pub fn exists(&self, doc: Document) -> bool {
        self.path(doc).is_file()
    }

    pub fn save<T: Serialize>(&self, doc: Document, value: &T) -> PrismResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| {
            PrismError::cache(format!("failed to encode {}: {}", doc.file_name(), e))
        })?;
        super::io::write_atomic_impl(&self.path(doc), &bytes)?;
        debug!(document = doc.file_name(), "saved document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_document_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        let tags: BTreeMap<String, Vec<String>> = store.load(Document::Tags);
        assert!(tags.is_empty());
        assert!(!store.exists(Document::Tags));
    }

    #[test]
    fn malformed_document_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("folders.json"), b"[\"a\", ").unwrap();
        let store = DocumentStore::new(dir.path());
        let folders: Vec<String> = store.load(Document::Folders);
        assert!(folders.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path());
        store
            .save(Document::Folders, &vec!["eval".to_string()])
            .unwrap();
        let folders: Vec<String> = store.load(Document::Folders);
        assert_eq!(folders, ["eval"]);
    }
}
