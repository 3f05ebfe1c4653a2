//! Text extraction for uploaded documents.
//!
//! Dispatches on the file extension: `.pdf` goes through `pdf-extract`,
//! `.txt`/`.md`/`.markdown` must be valid UTF-8. Everything else is an
//! [`DocGraphError::UnreadableDocument`].

use std::path::Path;

use crate::error::{DocGraphError, Result};
use crate::models::SourceDocument;

/// Extensions accepted for upload and indexing.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt", "md", "markdown"];

/// Returns true if the path has a supported extension.
pub fn is_supported(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Extract UTF-8 text from file bytes, using `filename` to pick the format.
pub fn extract_text(filename: &str, bytes: &[u8]) -> Result<String> {
    let unreadable = |reason: String| DocGraphError::UnreadableDocument {
        filename: filename.to_string(),
        reason,
    };

    match extension_of(Path::new(filename)).as_deref() {
        Some("pdf") => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| unreadable(format!("PDF extraction failed: {}", e))),
        Some("txt") | Some("md") | Some("markdown") => String::from_utf8(bytes.to_vec())
            .map_err(|e| unreadable(format!("not valid UTF-8: {}", e))),
        Some(other) => Err(unreadable(format!("unsupported file type: .{}", other))),
        None => Err(unreadable("file has no extension".to_string())),
    }
}

/// Read and extract a document from disk.
///
/// The document id is the filename stem, so `reports/A.pdf` becomes `A`.
pub async fn load_document(path: &Path) -> Result<SourceDocument> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DocGraphError::UnreadableDocument {
            filename: path.display().to_string(),
            reason: "path has no file name".to_string(),
        })?
        .to_string();

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DocGraphError::UnreadableDocument {
            filename: filename.clone(),
            reason: e.to_string(),
        })?;

    // pdf-extract is CPU-bound; keep it off the async workers.
    let name = filename.clone();
    let text = tokio::task::spawn_blocking(move || extract_text(&name, &bytes))
        .await
        .map_err(|e| DocGraphError::UnreadableDocument {
            filename: filename.clone(),
            reason: format!("extraction task failed: {}", e),
        })??;

    Ok(SourceDocument {
        id: document_id_for(&filename),
        filename,
        path: Some(path.to_path_buf()),
        text,
    })
}

/// Longest id [`document_id_for`] returns, leaving room for a `_N` suffix
/// within the store's name limit.
pub const MAX_DOCUMENT_ID_LEN: usize = 100;

/// Index name for an uploaded file.
///
/// The filename stem, with every run of characters a store name cannot hold
/// (spaces and punctuation other than `-` and `.`) folded into one `_`.
/// `report (1).pdf` becomes `report_1`.
pub fn document_id_for(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    let mut id = String::with_capacity(stem.len());
    let mut last_underscore = false;
    for c in stem.chars() {
        let c = if c.is_alphanumeric() || matches!(c, '-' | '.') {
            c
        } else {
            '_'
        };
        if c == '_' && last_underscore {
            continue;
        }
        if id.len() + c.len_utf8() > MAX_DOCUMENT_ID_LEN {
            break;
        }
        last_underscore = c == '_';
        id.push(c);
    }

    let id = id
        .trim_start_matches(&['.', '_'][..])
        .trim_end_matches('_');
    if id.is_empty() {
        "document".to_string()
    } else {
        id.to_string()
    }
}
