//! Concurrent ingestion of minutes documents into the page store.
//!
//! This module coordinates one ingestion run:
//! - Document discovery and one-time schema setup
//! - Admission-gated dispatch of documents to blocking worker threads
//! - Per-document render, OCR, and write of each page
//! - State tracking and cooperative cancellation

mod coordinator;
mod tracker;
mod worker;

pub use coordinator::{Coordinator, default_concurrency};
