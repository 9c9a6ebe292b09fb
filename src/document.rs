//! Document loading and format detection.
//!
//! Turns an uploaded file into plain text ready for chunking. The
//! document itself is not retained by the pipeline after chunking;
//! persistence of the original file is the caller's concern.

use std::path::{Path, PathBuf};

use crate::error::DocumentError;

/// Detected input format, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Json,
    Pdf,
}

impl DocumentFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "txt" => Some(DocumentFormat::PlainText),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "json" => Some(DocumentFormat::Json),
            "pdf" => Some(DocumentFormat::Pdf),
            _ => None,
        }
    }
}

/// A loaded document: extracted text plus provenance.
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    pub format: DocumentFormat,
    pub source_path: PathBuf,
}

/// Read a file and extract its text according to the detected format.
///
/// JSON documents are pretty-printed so nested structure survives as
/// readable text. PDF text extraction goes through `pdf-extract`.
/// Never returns an empty document: a file with no extractable text is
/// an error, not a silently empty index.
pub fn load_document(path: &Path) -> Result<Document, DocumentError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let format = DocumentFormat::from_extension(&extension).ok_or_else(|| {
        DocumentError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension,
        }
    })?;

    let text = match format {
        DocumentFormat::PlainText | DocumentFormat::Markdown => read_text(path)?,
        DocumentFormat::Json => {
            let raw = read_text(path)?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).map_err(|e| DocumentError::Extraction {
                    path: path.to_path_buf(),
                    message: format!("invalid JSON: {e}"),
                })?;
            serde_json::to_string_pretty(&value).map_err(|e| DocumentError::Extraction {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
        DocumentFormat::Pdf => {
            let bytes = std::fs::read(path).map_err(|source| DocumentError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| DocumentError::Extraction {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        }
    };

    if text.trim().is_empty() {
        return Err(DocumentError::Empty {
            path: path.to_path_buf(),
        });
    }

    tracing::debug!(
        path = %path.display(),
        format = ?format,
        chars = text.len(),
        "document loaded"
    );

    Ok(Document {
        text,
        format,
        source_path: path.to_path_buf(),
    })
}

fn read_text(path: &Path) -> Result<String, DocumentError> {
    std::fs::read_to_string(path).map_err(|source| DocumentError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}
