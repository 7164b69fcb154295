//! Per-document state tracking for an ingestion run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::trace;

/// Lifecycle of one document within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    Opened { pages: usize },
    Rendering { page: usize },
    Ocring { page: usize },
    Writing { page: usize },
    Done { pages: usize },
    Failed,
}

impl DocumentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentState::Done { .. } | DocumentState::Failed)
    }
}

/// Shared view of every document's state, plus in-flight counts.
#[derive(Debug, Default)]
pub struct DocumentTracker {
    states: DashMap<PathBuf, DocumentState>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered document as pending.
    pub fn register(&self, path: &Path) {
        self.states.insert(path.to_path_buf(), DocumentState::Pending);
    }

    /// Mark a document as in flight.
    ///
    /// The returned guard marks the document failed if it is dropped before
    /// [`ActiveDocument::finish`] is called, so a panicking worker still
    /// leaves a terminal state and releases its active slot.
    pub fn begin<'a>(&'a self, path: &'a Path) -> ActiveDocument<'a> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        ActiveDocument {
            tracker: self,
            path,
            finished: false,
        }
    }

    pub fn set(&self, path: &Path, state: DocumentState) {
        trace!(path = %path.display(), ?state, "Document state");
        self.states.insert(path.to_path_buf(), state);
    }

    pub fn state(&self, path: &Path) -> Option<DocumentState> {
        self.states.get(path).map(|s| *s)
    }

    /// Documents currently in flight
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of documents simultaneously in flight
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Documents that have not reached a terminal state
    pub fn unfinished(&self) -> usize {
        self.states
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .count()
    }

    fn complete(&self, path: &Path, state: DocumentState) {
        self.set(path, state);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-flight document; see [`DocumentTracker::begin`].
pub struct ActiveDocument<'a> {
    tracker: &'a DocumentTracker,
    path: &'a Path,
    finished: bool,
}

impl ActiveDocument<'_> {
    pub fn finish(mut self, state: DocumentState) {
        self.finished = true;
        self.tracker.complete(self.path, state);
    }
}

impl Drop for ActiveDocument<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.complete(self.path, DocumentState::Failed);
        }
    }
}
