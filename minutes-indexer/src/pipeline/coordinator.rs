//! Bounded fan-out of document processing across worker threads.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::tracker::{DocumentState, DocumentTracker};
use super::worker::Worker;
use crate::convention::PathConvention;
use crate::error::{IndexError, IndexResult, StoreError, format_error_chain};
use crate::locator::locate_documents;
use crate::ocr::OcrEngine;
use crate::render::PageRenderer;
use crate::store::PageStore;

/// A document that could not be indexed
#[derive(Debug, Clone)]
pub struct DocumentFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one ingestion run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Documents abandoned or never started because the run was cancelled
    pub cancelled: usize,
    pub pages_written: usize,
    pub failures: Vec<DocumentFailure>,
}

/// Drives an ingestion run over a minutes directory.
pub struct Coordinator {
    renderer: Arc<dyn PageRenderer>,
    ocr: Arc<dyn OcrEngine>,
    store: Arc<PageStore>,
    convention: PathConvention,
    concurrency: usize,
    tracker: Arc<DocumentTracker>,
    cancel: CancellationToken,
}

/// Number of documents processed at once when not configured.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Coordinator {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        ocr: Arc<dyn OcrEngine>,
        store: Arc<PageStore>,
    ) -> Self {
        Self {
            renderer,
            ocr,
            store,
            convention: PathConvention::default(),
            concurrency: default_concurrency(),
            tracker: Arc::new(DocumentTracker::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Limit the number of documents in flight (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stop admitting documents, and abandon in-flight ones at the next page
    /// boundary, once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn tracker(&self) -> &Arc<DocumentTracker> {
        &self.tracker
    }

    /// Index every document below `root`.
    ///
    /// Document-scoped failures are logged and counted in the summary. A
    /// store failure stops dispatch, waits for in-flight documents, and is
    /// returned as the run's error.
    pub async fn run(&self, root: &Path) -> IndexResult<RunSummary> {
        let root_buf = root.to_path_buf();
        let paths = task::spawn_blocking(move || locate_documents(&root_buf))
            .await
            .map_err(|e| IndexError::Io {
                path: root.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })??;

        info!(
            root = %root.display(),
            documents = paths.len(),
            concurrency = self.concurrency,
            "Starting ingestion run"
        );

        // Schema creation happens exactly once, before any writer exists
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || store.ensure_schema())
            .await
            .map_err(|e| StoreError::Schema {
                message: format!("Schema task failed: {}", e),
            })??;

        for path in &paths {
            self.tracker.register(path);
        }

        let mut summary = RunSummary {
            discovered: paths.len(),
            ..Default::default()
        };
        let paths = self.reject_duplicates(paths, &mut summary);

        // Child token: a fatal error stops this run without cancelling the
        // caller's token.
        let run_token = self.cancel.child_token();
        let worker = Worker {
            renderer: Arc::clone(&self.renderer),
            ocr: Arc::clone(&self.ocr),
            store: Arc::clone(&self.store),
            convention: self.convention,
            tracker: Arc::clone(&self.tracker),
            cancel: run_token.clone(),
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut in_flight: HashMap<task::Id, PathBuf> = HashMap::new();
        let mut fatal: Option<IndexError> = None;

        for path in paths {
            // Reap finished documents so a store failure stops dispatch promptly
            while let Some(joined) = workers.try_join_next_with_id() {
                self.record(joined, &mut in_flight, &mut summary, &mut fatal, &run_token);
            }
            if fatal.is_some() || run_token.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = run_token.cancelled() => break,
            };

            let worker = worker.clone();
            let task_path = path.clone();
            let handle = workers.spawn_blocking(move || {
                let _permit = permit;
                let outcome = worker.process(&task_path);
                (task_path, outcome)
            });
            in_flight.insert(handle.id(), path);
        }

        // Fan-in: every dispatched document reaches Done or Failed
        while let Some(joined) = workers.join_next_with_id().await {
            self.record(joined, &mut in_flight, &mut summary, &mut fatal, &run_token);
        }

        // Documents never dispatched stay pending
        summary.cancelled += self.tracker.unfinished();

        if let Some(e) = fatal {
            error!(
                error = %format_error_chain(&e),
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Ingestion run aborted"
            );
            return Err(e);
        }

        info!(
            documents = summary.discovered,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            pages = summary.pages_written,
            "Ingestion run complete"
        );

        Ok(summary)
    }

    /// Fail every document whose identity an earlier path already claims.
    ///
    /// Only the first path in sorted order is kept per `(body, date)`, so no
    /// two workers write or prune the same pages.
    fn reject_duplicates(&self, mut paths: Vec<PathBuf>, summary: &mut RunSummary) -> Vec<PathBuf> {
        paths.sort();
        let mut claimed: HashMap<(String, String), PathBuf> = HashMap::new();
        let mut unique = Vec::with_capacity(paths.len());

        for path in paths {
            // Malformed paths fail in their worker
            if let Ok(document) = self.convention.parse(&path) {
                match claimed.entry((document.body, document.date)) {
                    Entry::Vacant(slot) => {
                        slot.insert(path.clone());
                    }
                    Entry::Occupied(first) => {
                        let error = IndexError::DuplicateDocument {
                            path: path.clone(),
                            existing: first.get().clone(),
                        };
                        let message = format_error_chain(&error);
                        warn!(path = %path.display(), error = %message, "Document skipped");
                        self.tracker.set(&path, DocumentState::Failed);
                        summary.failed += 1;
                        summary.failures.push(DocumentFailure {
                            path,
                            error: message,
                        });
                        continue;
                    }
                }
            }
            unique.push(path);
        }

        unique
    }

    fn record(
        &self,
        joined: Result<(task::Id, (PathBuf, IndexResult<usize>)), JoinError>,
        in_flight: &mut HashMap<task::Id, PathBuf>,
        summary: &mut RunSummary,
        fatal: &mut Option<IndexError>,
        run_token: &CancellationToken,
    ) {
        match joined {
            Ok((id, (path, outcome))) => {
                in_flight.remove(&id);
                match outcome {
                    Ok(pages) => {
                        summary.succeeded += 1;
                        summary.pages_written += pages;
                    }
                    Err(IndexError::Cancelled { .. }) => {
                        info!(path = %path.display(), "Document processing cancelled");
                        summary.cancelled += 1;
                    }
                    Err(e) if e.is_document_scoped() => {
                        let message = format_error_chain(&e);
                        warn!(path = %path.display(), error = %message, "Document skipped");
                        summary.failed += 1;
                        summary.failures.push(DocumentFailure {
                            path,
                            error: message,
                        });
                    }
                    Err(e) => {
                        error!(
                            path = %path.display(),
                            error = %format_error_chain(&e),
                            "Fatal error, stopping run"
                        );
                        summary.failed += 1;
                        run_token.cancel();
                        fatal.get_or_insert(e);
                    }
                }
            }
            Err(join_error) => {
                let path = in_flight
                    .remove(&join_error.id())
                    .unwrap_or_default();
                let message = format!("Worker failed: {}", join_error);
                warn!(path = %path.display(), error = %message, "Document skipped");
                summary.failed += 1;
                summary.failures.push(DocumentFailure {
                    path,
                    error: message,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OcrError;
    use crate::render::{PageVisitor, RenderedPage};
    use crate::store::DATABASE_FILE;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Reads `pages=N` from the file instead of parsing a PDF.
    struct FakeRenderer {
        page_delay: Duration,
        opened: AtomicUsize,
    }

    impl FakeRenderer {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(page_delay: Duration) -> Self {
            Self {
                page_delay,
                opened: AtomicUsize::new(0),
            }
        }
    }

    impl PageRenderer for FakeRenderer {
        fn render_pages(&self, path: &Path, visitor: &mut dyn PageVisitor) -> IndexResult<()> {
            let contents = fs::read_to_string(path).map_err(|source| IndexError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let pages: usize = contents
                .trim()
                .strip_prefix("pages=")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| IndexError::DocumentOpen {
                    path: path.to_path_buf(),
                    message: "not a PDF".to_string(),
                })?;

            self.opened.fetch_add(1, Ordering::SeqCst);
            visitor.opened(pages)?;
            for number in 0..pages {
                std::thread::sleep(self.page_delay);
                visitor.page(RenderedPage {
                    number,
                    width: 1,
                    height: 1,
                    jpeg: format!("{}#{}", path.display(), number).into_bytes(),
                })?;
            }
            Ok(())
        }
    }

    /// Echoes the page bytes back as text, tagged with a revision.
    struct FakeOcr {
        revision: &'static str,
        fail_marker: Option<&'static str>,
    }

    impl FakeOcr {
        fn new(revision: &'static str) -> Self {
            Self {
                revision,
                fail_marker: None,
            }
        }
    }

    impl OcrEngine for FakeOcr {
        fn recognize(&self, page: &RenderedPage) -> Result<String, OcrError> {
            let text = String::from_utf8_lossy(&page.jpeg);
            if let Some(marker) = self.fail_marker
                && text.contains(marker)
            {
                return Err(OcrError::Engine {
                    status: "exit status: 1".to_string(),
                    stderr: "Error in pixReadMem".to_string(),
                });
            }
            Ok(format!("{} {}", self.revision, text))
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<PageStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("minutes");
            fs::create_dir_all(&root).unwrap();
            let store = Arc::new(PageStore::open(&dir.path().join(DATABASE_FILE)).unwrap());
            Self {
                _dir: dir,
                root,
                store,
            }
        }

        fn add(&self, relative: &str, contents: &str) -> PathBuf {
            let path = self.root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, contents).unwrap();
            path
        }

        fn coordinator(&self, renderer: Arc<dyn PageRenderer>, ocr: FakeOcr) -> Coordinator {
            Coordinator::new(renderer, Arc::new(ocr), Arc::clone(&self.store))
        }
    }

    const DOC_A: &str = "Marietta/minutes/2024-03-05-minutes.pdf";
    const DOC_B: &str = "Smyrna/minutes/2024-04-01-minutes.pdf";
    const DOC_C: &str = "Kennesaw/minutes/2024-05-20-minutes.pdf";

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupt_document_does_not_stop_siblings() {
        let fx = Fixture::new();
        fx.add(DOC_A, "pages=3");
        let corrupt = fx.add(DOC_B, "garbage");
        fx.add(DOC_C, "pages=2");

        let summary = fx
            .coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"))
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pages_written, 5);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path, corrupt);
        assert!(summary.failures[0].error.contains("not a PDF"));

        assert_eq!(fx.store.page_count().unwrap(), 5);
        for page in 0..3 {
            assert!(fx.store.page_text("Marietta", "2024-03-05", page).unwrap().is_some());
        }
        for page in 0..2 {
            assert!(fx.store.page_text("Kennesaw", "2024-05-20", page).unwrap().is_some());
        }
        assert!(fx.store.page_text("Smyrna", "2024-04-01", 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rerun_replaces_text_without_duplicates() {
        let fx = Fixture::new();
        fx.add(DOC_A, "pages=3");
        fx.add(DOC_C, "pages=1");
        let renderer: Arc<dyn PageRenderer> = Arc::new(FakeRenderer::new());

        fx.coordinator(Arc::clone(&renderer), FakeOcr::new("v1"))
            .run(&fx.root)
            .await
            .unwrap();
        let summary = fx
            .coordinator(renderer, FakeOcr::new("v2"))
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(fx.store.page_count().unwrap(), 4);
        let text = fx
            .store
            .page_text("Marietta", "2024-03-05", 1)
            .unwrap()
            .unwrap();
        assert!(text.starts_with("v2 "), "latest OCR output wins: {text}");
    }

    #[tokio::test]
    async fn test_shrunk_document_drops_stale_pages() {
        let fx = Fixture::new();
        fx.add(DOC_A, "pages=4");
        let renderer: Arc<dyn PageRenderer> = Arc::new(FakeRenderer::new());

        fx.coordinator(Arc::clone(&renderer), FakeOcr::new("v1"))
            .run(&fx.root)
            .await
            .unwrap();
        assert_eq!(fx.store.page_count().unwrap(), 4);

        fx.add(DOC_A, "pages=2");
        fx.coordinator(renderer, FakeOcr::new("v2"))
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(fx.store.page_count().unwrap(), 2);
        assert!(fx.store.page_text("Marietta", "2024-03-05", 2).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_documents_never_exceed_limit() {
        let fx = Fixture::new();
        for i in 0..12 {
            fx.add(
                &format!("Body{}/minutes/2024-01-{:02}-minutes.pdf", i, i + 1),
                "pages=2",
            );
        }
        let limit = 3;

        let coordinator = fx
            .coordinator(
                Arc::new(FakeRenderer::with_delay(Duration::from_millis(15))),
                FakeOcr::new("v1"),
            )
            .with_concurrency(limit);
        let summary = coordinator.run(&fx.root).await.unwrap();

        assert_eq!(summary.succeeded, 12);
        let tracker = coordinator.tracker();
        assert!(tracker.peak_active() >= 1);
        assert!(
            tracker.peak_active() <= limit,
            "peak {} exceeded limit {}",
            tracker.peak_active(),
            limit
        );
        assert_eq!(tracker.active(), 0);
        assert_eq!(fx.store.page_count().unwrap(), 24);
    }

    #[tokio::test]
    async fn test_states_reach_terminal() {
        let fx = Fixture::new();
        let good = fx.add(DOC_A, "pages=2");
        let bad = fx.add(DOC_B, "garbage");
        let stray = fx.add("notes.txt", "pages=1");

        let coordinator = fx.coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"));
        let summary = coordinator.run(&fx.root).await.unwrap();

        let tracker = coordinator.tracker();
        assert_eq!(tracker.state(&good), Some(DocumentState::Done { pages: 2 }));
        assert_eq!(tracker.state(&bad), Some(DocumentState::Failed));
        // Path convention rejects files outside <body>/<category>/
        assert_eq!(tracker.state(&stray), Some(DocumentState::Failed));
        assert_eq!(summary.failed, 2);
        assert!(
            summary
                .failures
                .iter()
                .any(|f| f.path == stray && f.error.contains("Malformed document path"))
        );
    }

    #[tokio::test]
    async fn test_same_day_meetings_keep_their_pages() {
        let fx = Fixture::new();
        fx.add("Marietta/minutes/2024-03-05-city_council.pdf", "pages=4");
        fx.add("Marietta/minutes/2024-03-05-planning_commission.pdf", "pages=2");

        let summary = fx
            .coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"))
            .with_concurrency(1)
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(fx.store.page_count().unwrap(), 6);
        for page in 0..4 {
            let text = fx
                .store
                .page_text("Marietta", "2024-03-05-city_council", page)
                .unwrap()
                .unwrap();
            assert!(text.contains("city_council.pdf#"), "page {page}: {text}");
        }
        for page in 0..2 {
            let text = fx
                .store
                .page_text("Marietta", "2024-03-05-planning_commission", page)
                .unwrap()
                .unwrap();
            assert!(text.contains("planning_commission.pdf#"), "page {page}: {text}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_identity_fails_later_document() {
        let fx = Fixture::new();
        let first = fx.add("Marietta/agendas/2024-03-05-minutes.pdf", "pages=1");
        let second = fx.add("Marietta/minutes/2024-03-05-minutes.pdf", "pages=3");
        let renderer = Arc::new(FakeRenderer::new());

        let coordinator = fx.coordinator(renderer.clone(), FakeOcr::new("v1"));
        let summary = coordinator.run(&fx.root).await.unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].path, second);
        assert!(summary.failures[0].error.contains("same body and date"));
        assert_eq!(renderer.opened.load(Ordering::SeqCst), 1);

        let tracker = coordinator.tracker();
        assert_eq!(tracker.state(&first), Some(DocumentState::Done { pages: 1 }));
        assert_eq!(tracker.state(&second), Some(DocumentState::Failed));

        assert_eq!(fx.store.page_count().unwrap(), 1);
        let text = fx
            .store
            .page_text("Marietta", "2024-03-05", 0)
            .unwrap()
            .unwrap();
        assert!(text.contains("agendas"), "{text}");
    }

    #[tokio::test]
    async fn test_ocr_failure_is_scoped_to_document() {
        let fx = Fixture::new();
        fx.add(DOC_A, "pages=3");
        fx.add(DOC_C, "pages=2");

        let ocr = FakeOcr {
            revision: "v1",
            fail_marker: Some("Marietta/minutes/2024-03-05-minutes.pdf#1"),
        };
        let summary = fx
            .coordinator(Arc::new(FakeRenderer::new()), ocr)
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].error.contains("OCR failed on page 1"));
        assert!(fx.store.page_text("Kennesaw", "2024-05-20", 1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_failure_aborts_run() {
        let fx = Fixture::new();
        for i in 0..4 {
            fx.add(
                &format!("Body{}/minutes/2024-02-{:02}-minutes.pdf", i, i + 1),
                "pages=2",
            );
        }
        fx.store.ensure_schema().unwrap();

        // Reject every write through a second connection
        let db_path = fx.root.parent().unwrap().join(DATABASE_FILE);
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_pages BEFORE INSERT ON pages BEGIN
                SELECT RAISE(ABORT, 'disk full');
            END;",
        )
        .unwrap();
        drop(conn);

        let result = fx
            .coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"))
            .with_concurrency(1)
            .run(&fx.root)
            .await;

        assert!(matches!(result, Err(IndexError::Store(_))));
        assert_eq!(fx.store.page_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let fx = Fixture::new();
        fx.add(DOC_A, "pages=3");
        fx.add(DOC_C, "pages=2");
        let renderer = Arc::new(FakeRenderer::new());

        let token = CancellationToken::new();
        token.cancel();
        let summary = fx
            .coordinator(renderer.clone(), FakeOcr::new("v1"))
            .with_cancellation(token)
            .run(&fx.root)
            .await
            .unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(renderer.opened.load(Ordering::SeqCst), 0);
        assert_eq!(fx.store.page_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_root_fails_run() {
        let fx = Fixture::new();
        let result = fx
            .coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"))
            .run(&fx.root.join("absent"))
            .await;

        assert!(matches!(result, Err(IndexError::Io { .. })));
    }

    #[test]
    fn test_concurrency_floor() {
        let fx = Fixture::new();
        let coordinator = fx
            .coordinator(Arc::new(FakeRenderer::new()), FakeOcr::new("v1"))
            .with_concurrency(0);
        assert_eq!(coordinator.concurrency, 1);
        assert!(default_concurrency() >= 1);
    }
}
