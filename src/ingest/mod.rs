//! Ingestion: unread support email in, `pending` tickets out.

pub mod producer;

pub use producer::{IngestReport, IngestionProducer};
