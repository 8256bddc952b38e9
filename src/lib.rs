//! Support triage: email in, prioritized drafts out.

pub mod analysis;
pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod review;
pub mod schedule;
pub mod store;
pub mod tickets;

pub use error::{Error, Result};
