//! Extraction and drafting capabilities used by the analysis pipeline.
//!
//! Both are traits so the pipeline can run against scripted fakes in tests;
//! `LlmAnalyst` implements both on top of an `LlmProvider`.

pub mod llm_analyst;
pub mod prompts;

pub use llm_analyst::LlmAnalyst;

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::tickets::{Extraction, Sentiment};

/// Pulls structured facts out of a raw support email.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, subject: &str, body: &str) -> Result<Extraction, AnalysisError>;
}

/// Writes a reply draft from an extraction.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(
        &self,
        sentiment: Sentiment,
        summary: &str,
        subject: &str,
    ) -> Result<String, AnalysisError>;
}
