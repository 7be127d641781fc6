//! Filesystem helpers for the cache directory.

use std::io::Write;
use std::path::Path;

use crate::errors::{PrismError, PrismResult};

/// Write `content` so readers see either the old file or the new one.
///
/// The temp file lives in the destination directory so the final rename never
/// crosses a filesystem boundary.
pub(crate) fn write_atomic_impl(path: &Path, content: &[u8]) -> PrismResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PrismError::cache(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| PrismError::cache(format!("failed to create cache dir: {}", e)))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| PrismError::cache(format!("failed to create temp file: {}", e)))?;
    tmp.write_all(content)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PrismError::cache(format!("failed to write temp file: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| PrismError::cache(format!("failed to rename temp file: {}", e.error)))?;
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> PrismResult<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PrismError::cache(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("col.json");
        write_atomic_impl(&path, b"one").unwrap();
        write_atomic_impl(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "col.json")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
    }
}
