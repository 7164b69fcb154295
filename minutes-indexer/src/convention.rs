//! Document identity from the downloader's path layout.
//!
//! Version 1 of the layout is
//!
//! ```text
//! <root>/<body>/<category>/<YYYY-MM-DD>-<meeting>.pdf
//! ```
//!
//! Segments are counted from the end of the path, so the parse needs neither
//! the root nor any filesystem access. The downloader names regular minutes
//! `<date>-minutes.pdf`; that suffix is dropped, while any other meeting name
//! stays part of the document's date key so same-day meetings stay distinct.
//! The date prefix is checked for shape only and stored verbatim.

use std::path::{Component, Path, PathBuf};

use crate::error::{IndexError, IndexResult};

/// Length of a `YYYY-MM-DD` prefix.
const DATE_PREFIX_LEN: usize = 10;

/// Filename suffix of regular meeting minutes.
const MINUTES_SUFFIX: &str = "-minutes";

/// A source document and the identity derived from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub body: String,
    pub category: String,
    /// `YYYY-MM-DD`, followed by the meeting name unless it was plain minutes
    pub date: String,
}

/// Naming conventions understood by the metadata parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathConvention {
    /// `<body>/<category>/<YYYY-MM-DD>-<meeting>.<ext>`
    #[default]
    V1,
}

impl PathConvention {
    /// Parse a document path into its identity.
    pub fn parse(self, path: &Path) -> IndexResult<Document> {
        match self {
            PathConvention::V1 => parse_v1(path),
        }
    }
}

fn parse_v1(path: &Path) -> IndexResult<Document> {
    let malformed = |reason: &str| IndexError::MalformedPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_str()),
            _ => None,
        })
        .collect::<Option<_>>()
        .ok_or_else(|| malformed("path is not valid UTF-8"))?;

    let [.., body, category, filename] = segments.as_slice() else {
        return Err(malformed("expected <body>/<category>/<date>-<meeting> segments"));
    };

    let date =
        document_date(filename).ok_or_else(|| malformed("filename has no YYYY-MM-DD prefix"))?;

    Ok(Document {
        path: path.to_path_buf(),
        body: (*body).to_string(),
        category: (*category).to_string(),
        date: date.to_string(),
    })
}

/// The filename stem without the minutes suffix, if it starts with a date.
fn document_date(filename: &str) -> Option<&str> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    let date = stem.strip_suffix(MINUTES_SUFFIX).unwrap_or(stem);
    has_date_prefix(date).then_some(date)
}

/// Whether `name` starts with `YYYY-MM-DD` followed by nothing, `-` or `.`.
fn has_date_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < DATE_PREFIX_LEN {
        return false;
    }

    let shaped = bytes[..DATE_PREFIX_LEN]
        .iter()
        .enumerate()
        .all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    shaped && matches!(bytes.get(DATE_PREFIX_LEN), None | Some(b'-') | Some(b'.'))
}
