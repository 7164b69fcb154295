//! Processing of a single document on a blocking worker thread.
//!
//! Pages are handled strictly in order: render, OCR, write, then the next
//! page. OCR is the expensive step and parallelism comes from running many
//! documents at once, so there is no fan-out inside a document.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tracker::{DocumentState, DocumentTracker};
use crate::convention::{Document, PathConvention};
use crate::error::{IndexError, IndexResult};
use crate::ocr::OcrEngine;
use crate::render::{PageRenderer, PageVisitor, RenderedPage};
use crate::store::PageStore;

/// Everything a worker thread needs, cheap to clone per document.
#[derive(Clone)]
pub(crate) struct Worker {
    pub(crate) renderer: Arc<dyn PageRenderer>,
    pub(crate) ocr: Arc<dyn OcrEngine>,
    pub(crate) store: Arc<PageStore>,
    pub(crate) convention: PathConvention,
    pub(crate) tracker: Arc<DocumentTracker>,
    pub(crate) cancel: CancellationToken,
}

impl Worker {
    /// Process one document to completion, returning the pages written.
    pub(crate) fn process(&self, path: &Path) -> IndexResult<usize> {
        let active = self.tracker.begin(path);

        let result = self.index_document(path);

        if result.is_err() {
            let stage = self.tracker.state(path);
            debug!(path = %path.display(), ?stage, "Document stopped");
        }
        active.finish(match &result {
            Ok(pages) => DocumentState::Done { pages: *pages },
            Err(_) => DocumentState::Failed,
        });

        result
    }

    fn index_document(&self, path: &Path) -> IndexResult<usize> {
        self.check_cancellation(path)?;

        let document = self.convention.parse(path)?;
        info!(
            path = %path.display(),
            body = %document.body,
            category = %document.category,
            date = %document.date,
            "Indexing document"
        );

        let mut writer = PageWriter {
            worker: self,
            document: &document,
            page_count: 0,
            pages_written: 0,
        };
        self.renderer.render_pages(path, &mut writer)?;
        let pages_written = writer.pages_written;

        // A re-downloaded document may have fewer pages than last time
        let pruned = self
            .store
            .prune_pages(&document.body, &document.date, pages_written)?;
        if pruned > 0 {
            debug!(path = %path.display(), pruned, "Removed stale pages");
        }

        info!(path = %path.display(), pages = pages_written, "Document indexed");

        Ok(pages_written)
    }

    fn check_cancellation(&self, path: &Path) -> IndexResult<()> {
        if self.cancel.is_cancelled() {
            Err(IndexError::Cancelled {
                path: path.to_path_buf(),
            })
        } else {
            Ok(())
        }
    }
}

/// Receives rendered pages and carries each through OCR into the store.
struct PageWriter<'a> {
    worker: &'a Worker,
    document: &'a Document,
    page_count: usize,
    pages_written: usize,
}

impl PageWriter<'_> {
    fn set_state(&self, state: DocumentState) {
        self.worker.tracker.set(&self.document.path, state);
    }
}

impl PageVisitor for PageWriter<'_> {
    fn opened(&mut self, page_count: usize) -> IndexResult<()> {
        self.page_count = page_count;
        self.set_state(DocumentState::Opened { pages: page_count });
        if page_count > 0 {
            self.set_state(DocumentState::Rendering { page: 0 });
        }
        Ok(())
    }

    fn page(&mut self, page: RenderedPage) -> IndexResult<()> {
        let path = &self.document.path;
        self.worker.check_cancellation(path)?;

        let number = page.number;
        self.set_state(DocumentState::Ocring { page: number });
        let text = self
            .worker
            .ocr
            .recognize(&page)
            .map_err(|source| IndexError::Ocr {
                path: path.clone(),
                page: number,
                source,
            })?;

        self.set_state(DocumentState::Writing { page: number });
        self.worker
            .store
            .upsert(&self.document.body, &self.document.date, number, &text)?;
        self.pages_written += 1;

        debug!(
            path = %path.display(),
            page = number,
            chars = text.len(),
            "Page written"
        );

        if number + 1 < self.page_count {
            self.set_state(DocumentState::Rendering { page: number + 1 });
        }

        Ok(())
    }
}
