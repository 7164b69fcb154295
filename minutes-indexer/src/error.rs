use std::path::PathBuf;

use thiserror::Error;

/// Main indexing error type
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document path {path}: {reason}")]
    MalformedPath { path: PathBuf, reason: String },

    #[error("Document {path} has the same body and date as {existing}")]
    DuplicateDocument { path: PathBuf, existing: PathBuf },

    #[error("Failed to open document {path}: {message}")]
    DocumentOpen { path: PathBuf, message: String },

    #[error("Failed to render page {page} of {path}: {message}")]
    Render {
        path: PathBuf,
        page: usize,
        message: String,
    },

    #[error("OCR failed on page {page} of {path}")]
    Ocr {
        path: PathBuf,
        page: usize,
        #[source]
        source: OcrError,
    },

    #[error("Store error")]
    Store(#[from] StoreError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Processing cancelled for {path}")]
    Cancelled { path: PathBuf },
}

/// Store (SQLite) errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Schema creation failed: {message}")]
    Schema { message: String },

    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

/// OCR engine errors
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR engine unavailable at {command}")]
    Unavailable {
        command: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("OCR engine I/O failed")]
    Io(#[source] std::io::Error),

    #[error("OCR engine exited with {status}: {stderr}")]
    Engine { status: String, stderr: String },
}

impl IndexError {
    /// Whether this error only invalidates the document being processed.
    ///
    /// Store and configuration failures invalidate the whole run.
    pub fn is_document_scoped(&self) -> bool {
        match self {
            IndexError::Io { .. }
            | IndexError::MalformedPath { .. }
            | IndexError::DuplicateDocument { .. }
            | IndexError::DocumentOpen { .. }
            | IndexError::Render { .. }
            | IndexError::Ocr { .. }
            | IndexError::Cancelled { .. } => true,
            IndexError::Store(_) | IndexError::Config { .. } => false,
        }
    }
}

/// Result type alias for indexing operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Render an error and all of its sources as a single line.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
