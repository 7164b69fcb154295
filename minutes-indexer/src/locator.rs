//! Recursive discovery of downloaded minutes files.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{IndexError, IndexResult};

/// Collect every regular file below `root`.
///
/// Directories are descended, not listed. Symlinks are not followed. The
/// returned order is unspecified.
pub fn locate_documents(root: &Path) -> IndexResult<Vec<PathBuf>> {
    let metadata = std::fs::metadata(root).map_err(|source| IndexError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(IndexError::Io {
            path: root.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "minutes root is not a directory",
            ),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            IndexError::Io {
                path,
                source: e.into(),
            }
        })?;

        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    debug!(root = %root.display(), files = files.len(), "Located documents");

    Ok(files)
}
