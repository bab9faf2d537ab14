//! Document Loading
//!
//! Turns files on disk into [`Document`]s. Loaders are selected by file
//! extension through a [`LoaderRegistry`]; anything that is not a PDF is read
//! as plain text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Maximum file size (50 MB) accepted by the loaders.
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Page separator emitted by pdf-extract between pages.
const PDF_PAGE_BREAK: char = '\u{c}';

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("File too large: {0} bytes (max {1} bytes)")]
    FileTooLarge(u64, u64),
    #[error("PDF extraction failed for {path}: {reason}")]
    Pdf { path: String, reason: String },
    #[error("File is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// A loaded document: ordered pages plus the source they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Path or other identity of the source file
    pub source: String,
    pub pages: Vec<String>,
}

impl Document {
    pub fn new(source: impl Into<String>, pages: Vec<String>) -> Self {
        Self {
            source: source.into(),
            pages,
        }
    }

    /// Single-page document from an in-memory string.
    pub fn from_text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(source, vec![text.into()])
    }

    /// Full text with pages separated by a blank line.
    pub fn text(&self) -> String {
        self.pages.join("\n\n")
    }

    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|p| p.trim().is_empty())
    }
}

/// Something that can turn a path into a [`Document`].
pub trait DocumentLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Document, LoaderError>;
}

/// Plain UTF-8 text files.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextLoader;

impl DocumentLoader for TextLoader {
    fn load(&self, path: &Path) -> Result<Document, LoaderError> {
        let bytes = read_bounded(path)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| LoaderError::InvalidUtf8(path.display().to_string()))?;
        Ok(Document::from_text(path.display().to_string(), text))
    }
}

/// PDF files, one page per form-feed separated section.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfLoader;

impl DocumentLoader for PdfLoader {
    fn load(&self, path: &Path) -> Result<Document, LoaderError> {
        let bytes = read_bounded(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| LoaderError::Pdf {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let pages = split_pdf_pages(&text);
        debug!(path = %path.display(), pages = pages.len(), "Extracted PDF text");
        Ok(Document::new(path.display().to_string(), pages))
    }
}

/// Split extracted PDF text into pages, dropping empty trailing pages.
fn split_pdf_pages(text: &str) -> Vec<String> {
    let mut pages: Vec<String> = text
        .split(PDF_PAGE_BREAK)
        .map(|p| p.trim_matches('\n').to_string())
        .collect();
    while pages.last().map(|p| p.trim().is_empty()).unwrap_or(false) {
        pages.pop();
    }
    pages
}

fn read_bounded(path: &Path) -> Result<Vec<u8>, LoaderError> {
    let io_err = |source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    };
    let file_size = fs::metadata(path).map_err(io_err)?.len();
    if file_size > MAX_FILE_SIZE {
        return Err(LoaderError::FileTooLarge(file_size, MAX_FILE_SIZE));
    }
    fs::read(path).map_err(io_err)
}

/// Capability lookup from file extension to loader.
#[derive(Clone)]
pub struct LoaderRegistry {
    by_extension: HashMap<String, Arc<dyn DocumentLoader>>,
    fallback: Arc<dyn DocumentLoader>,
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        let text: Arc<dyn DocumentLoader> = Arc::new(TextLoader);
        let mut registry = Self {
            by_extension: HashMap::new(),
            fallback: text.clone(),
        };
        registry.register("pdf", Arc::new(PdfLoader));
        for ext in ["txt", "md", "markdown", "csv", "json"] {
            registry.register(ext, text.clone());
        }
        registry
    }
}

impl LoaderRegistry {
    /// Register (or replace) the loader for an extension. Case-insensitive.
    pub fn register(&mut self, extension: &str, loader: Arc<dyn DocumentLoader>) {
        self.by_extension
            .insert(extension.trim_start_matches('.').to_lowercase(), loader);
    }

    pub fn loader_for(&self, path: &Path) -> Arc<dyn DocumentLoader> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.by_extension
            .get(&extension)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn load(&self, path: &Path) -> Result<Document, LoaderError> {
        self.loader_for(path).load(path)
    }
}
