use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod convention;
mod error;
mod locator;
mod ocr;
mod pipeline;
mod render;
mod store;

use crate::config::load_config;
use crate::ocr::TesseractCli;
use crate::pipeline::{Coordinator, default_concurrency};
use crate::render::PdfiumRenderer;
use crate::store::PageStore;

/// Hits printed per search
const SEARCH_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting minutes indexer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let db_path = config.storage.database_path();

    info!(
        minutes_dir = %config.storage.minutes_dir.display(),
        database = %db_path.display(),
        "Configuration loaded"
    );

    let store = Arc::new(PageStore::open(&db_path)?);

    // Any arguments are search terms; otherwise run an ingestion pass
    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if !query.trim().is_empty() {
        store.ensure_schema()?;
        for hit in store.search(&query, SEARCH_LIMIT)? {
            println!("{}\t{}\tpage {}\t{}", hit.body, hit.date, hit.page, hit.snippet);
        }
        return Ok(());
    }

    let renderer = Arc::new(PdfiumRenderer::new(&config.render)?);
    let ocr = Arc::new(TesseractCli::new(&config.ocr));
    let workers = config.ingest.workers.unwrap_or_else(default_concurrency);

    // Ctrl-C finishes in-flight pages and stops admitting documents
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight pages");
            signal_token.cancel();
        }
    });

    let coordinator = Coordinator::new(renderer, ocr, store.clone())
        .with_concurrency(workers)
        .with_cancellation(cancel);
    let summary = coordinator.run(&config.storage.minutes_dir).await?;

    for failure in &summary.failures {
        warn!(path = %failure.path.display(), error = %failure.error, "Not indexed");
    }
    info!(
        indexed = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        pages = summary.pages_written,
        total_pages = store.page_count()?,
        peak_workers = coordinator.tracker().peak_active(),
        "Done"
    );

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("minutes_indexer=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
