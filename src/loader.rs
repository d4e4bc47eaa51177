//! Document loading.
//!
//! Turns files on disk (or raw uploaded bytes) into plain text for the
//! chunker. Plain text and PDF are supported; anything else is rejected
//! up front so ingestion fails before any state is written.

use anyhow::{bail, Context, Result};
use std::path::Path;
use walkdir::WalkDir;

/// File extensions accepted for ingestion.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "pdf"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extract plain text from a file on disk.
pub fn load_file(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        "pdf" => pdf_extract::extract_text(path)
            .with_context(|| format!("Failed to extract text from {}", path.display())),
        other => bail!("unsupported file type: .{}", other),
    }
}

/// Extract plain text from uploaded bytes, dispatching on the file name's
/// extension.
pub fn load_bytes(name: &str, bytes: &[u8]) -> Result<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" => String::from_utf8(bytes.to_vec())
            .with_context(|| format!("{} is not valid UTF-8", name)),
        "pdf" => pdf_extract::extract_text_from_mem(bytes)
            .with_context(|| format!("Failed to extract text from {}", name)),
        other => bail!("unsupported file type: .{}", other),
    }
}

/// Collect supported files under `path` (a file or a directory, walked
/// recursively) as `(name, text)` pairs. Names are the file names, which
/// become `source` keys downstream.
pub fn load_path(path: &Path) -> Result<Vec<(String, String)>> {
    let mut docs = Vec::new();

    if path.is_file() {
        docs.push((file_name(path)?, load_file(path)?));
        return Ok(docs);
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_supported(entry.path()) {
            continue;
        }
        docs.push((file_name(entry.path())?, load_file(entry.path())?));
    }

    if docs.is_empty() {
        bail!("no supported files found under {}", path.display());
    }
    Ok(docs)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("invalid file name: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported(Path::new("notes.txt")));
        assert!(is_supported(Path::new("README.md")));
        assert!(is_supported(Path::new("paper.PDF")));
        assert!(!is_supported(Path::new("image.png")));
        assert!(!is_supported(Path::new("no_extension")));
    }

    #[test]
    fn test_load_bytes_text() {
        let text = load_bytes("a.txt", b"hello world").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_load_bytes_invalid_utf8() {
        assert!(load_bytes("a.txt", &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_load_bytes_unsupported() {
        let err = load_bytes("a.png", b"...").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_load_path_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "first").unwrap();
        std::fs::write(dir.path().join("two.md"), "second").unwrap();
        std::fs::write(dir.path().join("skip.bin"), "binary").unwrap();

        let mut docs = load_path(dir.path()).unwrap();
        docs.sort();
        assert_eq!(
            docs,
            vec![
                ("one.txt".to_string(), "first".to_string()),
                ("two.md".to_string(), "second".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_path_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_path(dir.path()).is_err());
    }
}
