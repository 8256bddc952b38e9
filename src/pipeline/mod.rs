//! Ticket analysis pipeline.
//!
//! Every pending ticket flows through:
//! 1. `Extractor::extract()`: sentiment, urgency, summary, contact info
//! 2. `Drafter::draft()`: a reply for a human to review
//!
//! **No reply is ever sent.** Drafts wait in the review queue.

pub mod processor;

pub use processor::{AnalysisPipeline, BatchReport};
