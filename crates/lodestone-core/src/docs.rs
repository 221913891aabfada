//! Discovering plain-text documents in a source directory.
//!
//! Documents are identified by their path relative to the source root, which is
//! what gets stored alongside each vector and used to resolve hits back to text.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A document we found: absolute path and the identifier stored with its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated.
    pub filename: String,
}

/// Lists every regular file under `root`, sorted by name. Hidden entries are skipped.
/// Does not follow symlinks into directories (walkdir default).
pub fn list_documents(root: &Path) -> Result<Vec<Document>, SourceError> {
    if !root.is_dir() {
        return Err(SourceError::NotADirectory(root.to_path_buf()));
    }
    let mut docs = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
    {
        let entry = entry.map_err(|e| SourceError::Walk(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let filename = relative_name(root, path);
        docs.push(Document {
            path: path.to_path_buf(),
            filename,
        });
    }
    Ok(docs)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn relative_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Reads back the non-empty lines `line_start..line_end` of a document, using the
/// same line numbering the chunker records.
pub fn read_line_range(
    root: &Path,
    filename: &str,
    line_start: usize,
    line_end: usize,
) -> Result<Vec<String>, SourceError> {
    let path = root.join(filename);
    let raw = std::fs::read_to_string(&path).map_err(|e| SourceError::Read(path.clone(), e))?;
    Ok(raw
        .lines()
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.is_empty())
        .skip(line_start)
        .take(line_end.saturating_sub(line_start))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("walk error: {0}")]
    Walk(String),
    #[error("document listing task failed: {0}")]
    ListingTask(String),
    #[error("read error for {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("chunk queue closed before all chunks were sent")]
    QueueClosed,
    #[error("chunk source cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_recursively_with_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), "c").unwrap();
        std::fs::write(dir.path().join(".hidden"), "h").unwrap();

        let docs = list_documents(dir.path()).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_documents(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, SourceError::NotADirectory(_)));
    }

    #[test]
    fn line_range_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("d.txt"), "a\n\nb\nc\n\n\nd\n").unwrap();
        let lines = read_line_range(dir.path(), "d.txt", 1, 3).unwrap();
        assert_eq!(lines, vec!["b", "c"]);
    }
}
