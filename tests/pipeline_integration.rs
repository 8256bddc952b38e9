//! End-to-end tests: mailbox → producer → store → pipeline → review.
//!
//! The model is a stub that reads the urgency it should report out of the
//! subject line (`[u4]`), so ordering assertions are deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use support_triage::analysis::LlmAnalyst;
use support_triage::error::{LlmError, ReviewError};
use support_triage::ingest::IngestionProducer;
use support_triage::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};
use support_triage::mailbox::{MemoryMailbox, SubjectFilter};
use support_triage::pipeline::AnalysisPipeline;
use support_triage::review::ReviewService;
use support_triage::store::{LibSqlBackend, TicketStore};
use support_triage::tickets::{FailureStage, RawMessage, TicketStatus};

#[derive(Clone, Copy)]
enum Mode {
    Normal,
    RateLimited,
    Garbage,
    KeyRevoked,
}

struct StubLlm {
    mode: Mode,
    extraction_calls: AtomicUsize,
    drafting_calls: AtomicUsize,
    /// Raise the flag once this many drafts have been written.
    stop_after_drafts: Option<(usize, Arc<AtomicBool>)>,
}

impl StubLlm {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            extraction_calls: AtomicUsize::new(0),
            drafting_calls: AtomicUsize::new(0),
            stop_after_drafts: None,
        })
    }

    fn stopping_after(drafts: usize, flag: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Normal,
            extraction_calls: AtomicUsize::new(0),
            drafting_calls: AtomicUsize::new(0),
            stop_after_drafts: Some((drafts, flag)),
        })
    }

    fn extractions(&self) -> usize {
        self.extraction_calls.load(Ordering::SeqCst)
    }

    fn drafts(&self) -> usize {
        self.drafting_calls.load(Ordering::SeqCst)
    }
}

/// Pull `N` out of a `[uN]` tag, defaulting to 3.
fn urgency_tag(text: &str) -> u8 {
    text.find("[u")
        .and_then(|i| text[i + 2..].chars().next())
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .unwrap_or(3)
}

fn reply(content: String) -> CompletionResponse {
    CompletionResponse { content }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if system.contains("extract structured facts") {
            self.extraction_calls.fetch_add(1, Ordering::SeqCst);
            return match self.mode {
                Mode::RateLimited => Err(LlmError::RateLimited {
                    provider: "stub".into(),
                    retry_after: None,
                }),
                Mode::Garbage => Ok(reply("Sorry, I can't categorize this.".into())),
                Mode::KeyRevoked => Err(LlmError::AuthFailed {
                    provider: "stub".into(),
                }),
                Mode::Normal => Ok(reply(format!(
                    r#"{{"sentiment": "negative", "urgency": {}, "summary": "Customer needs help", "contact_info": {{}}}}"#,
                    urgency_tag(&user)
                ))),
            };
        }

        let n = self.drafting_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, flag)) = &self.stop_after_drafts
            && n >= *limit
        {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(reply("I'm sorry for the trouble. Here is what to do next.".into()))
    }
}

fn message(id: &str, subject: &str, received_at: DateTime<Utc>) -> RawMessage {
    RawMessage {
        id: id.into(),
        sender: format!("{id}@example.com"),
        subject: subject.into(),
        body: "Something is wrong with my account.".into(),
        received_at,
    }
}

fn pipeline(store: Arc<dyn TicketStore>, llm: Arc<StubLlm>, max_attempts: u32) -> AnalysisPipeline {
    let analyst = Arc::new(LlmAnalyst::new(llm, Duration::from_secs(5)));
    AnalysisPipeline::new(store, analyst.clone(), analyst, max_attempts)
}

fn default_filter() -> SubjectFilter {
    let terms: Vec<String> = ["Support", "Query", "Request", "Help"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    SubjectFilter::new(&terms).unwrap()
}

#[tokio::test]
async fn mail_to_prioritized_drafts() {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(MemoryMailbox::new());
    let t0 = Utc::now() - chrono::Duration::minutes(10);
    mailbox.deliver(message("t1", "Help [u2]", t0));
    mailbox.deliver(message("t2", "Support needed [u5]", t0 + chrono::Duration::seconds(1)));
    mailbox.deliver(message("t3", "Urgent help [u5]", t0 + chrono::Duration::seconds(2)));
    mailbox.deliver(message("t4", "Query about plans [u1]", t0 + chrono::Duration::seconds(3)));
    mailbox.deliver(message("promo", "Big summer sale", t0));

    let producer = IngestionProducer::new(store.clone(), mailbox.clone(), default_filter());
    let report = producer.poll_and_ingest().await.unwrap();
    assert_eq!(report.inserted, 4);
    assert!(!mailbox.is_seen("promo"));

    // Second cycle sees nothing new.
    let again = producer.poll_and_ingest().await.unwrap();
    assert_eq!(again.listed, 0);

    let llm = StubLlm::new(Mode::Normal);
    let batch = pipeline(store.clone(), llm.clone(), 3).process_batch().await.unwrap();
    assert_eq!(batch.drafted, 4);
    assert_eq!(llm.extractions(), 4);

    let review = ReviewService::new(store.clone());
    let queue = review.priority_queue(false).await.unwrap();
    let ids: Vec<&str> = queue.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t2", "t3", "t1", "t4"]);
    assert!(queue.iter().all(|t| t.status == TicketStatus::Drafted));

    review.resolve("t2").await.unwrap();
    let open: Vec<String> = review
        .priority_queue(false)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(open, vec!["t3", "t1", "t4"]);
    assert_eq!(review.priority_queue(true).await.unwrap().len(), 4);
}

#[tokio::test]
async fn reviewer_edits_survive_later_batches() {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(MemoryMailbox::new());
    mailbox.deliver(message("a", "Help [u4]", Utc::now()));
    IngestionProducer::new(store.clone(), mailbox.clone(), default_filter())
        .poll_and_ingest()
        .await
        .unwrap();

    let review = ReviewService::new(store.clone());
    assert!(matches!(
        review.edit_draft("a", "Too early").await,
        Err(ReviewError::NotEditable { .. })
    ));

    let p = pipeline(store.clone(), StubLlm::new(Mode::Normal), 3);
    p.process_batch().await.unwrap();
    review.edit_draft("a", "Hand-written reply").await.unwrap();

    // Another ticket arrives and a new batch runs.
    mailbox.deliver(message("b", "Request [u1]", Utc::now()));
    IngestionProducer::new(store.clone(), mailbox.clone(), default_filter())
        .poll_and_ingest()
        .await
        .unwrap();
    p.process_batch().await.unwrap();

    let a = review.get("a").await.unwrap();
    assert_eq!(a.draft_response.as_deref(), Some("Hand-written reply"));
    assert_eq!(a.urgency.unwrap().value(), 4);
    assert_eq!(a.status, TicketStatus::Drafted);
}

#[tokio::test]
async fn revoked_key_leaves_backlog_untouched() {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(MemoryMailbox::new());
    for id in ["a", "b", "c"] {
        mailbox.deliver(message(id, "Help", Utc::now()));
    }
    IngestionProducer::new(store.clone(), mailbox, default_filter())
        .poll_and_ingest()
        .await
        .unwrap();

    let llm = StubLlm::new(Mode::KeyRevoked);
    let report = pipeline(store.clone(), llm.clone(), 3)
        .process_batch()
        .await
        .unwrap();
    assert!(report.halted);
    assert_eq!(report.failed, 0);
    assert_eq!(llm.extractions(), 1);

    for t in store.get_by_status(TicketStatus::Pending).await.unwrap() {
        assert_eq!(t.extraction_attempts, 0);
        assert!(t.failure_note.is_none());
    }
    assert_eq!(store.get_by_status(TicketStatus::Pending).await.unwrap().len(), 3);

    // With a working key the same backlog goes through.
    let batch = pipeline(store.clone(), StubLlm::new(Mode::Normal), 3)
        .process_batch()
        .await
        .unwrap();
    assert_eq!(batch.drafted, 3);
}

#[tokio::test]
async fn rate_limits_are_bounded_by_max_attempts() {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(MemoryMailbox::new());
    mailbox.deliver(message("a", "Help", Utc::now()));
    IngestionProducer::new(store.clone(), mailbox, default_filter())
        .poll_and_ingest()
        .await
        .unwrap();

    let llm = StubLlm::new(Mode::RateLimited);
    let p = pipeline(store.clone(), llm.clone(), 2);

    p.process_batch().await.unwrap();
    assert_eq!(store.get_by_id("a").await.unwrap().unwrap().status, TicketStatus::Pending);

    p.process_batch().await.unwrap();
    let t = store.get_by_id("a").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Failed);
    assert_eq!(t.failure_stage, Some(FailureStage::Extraction));
    assert_eq!(t.extraction_attempts, 2);

    // Failed tickets are never picked up again.
    p.process_batch().await.unwrap();
    assert_eq!(llm.extractions(), 2);
    assert_eq!(llm.drafts(), 0);
}

#[tokio::test]
async fn unparseable_extraction_fails_the_ticket() {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(MemoryMailbox::new());
    mailbox.deliver(message("a", "Support", Utc::now()));
    IngestionProducer::new(store.clone(), mailbox, default_filter())
        .poll_and_ingest()
        .await
        .unwrap();

    let llm = StubLlm::new(Mode::Garbage);
    pipeline(store.clone(), llm.clone(), 3)
        .process_batch()
        .await
        .unwrap();

    let t = store.get_by_id("a").await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Failed);
    assert!(t.failure_note.as_deref().unwrap().contains("can't categorize"));
    assert!(t.sentiment.is_none() && t.urgency.is_none() && t.summary.is_none());
    assert_eq!(llm.drafts(), 0);
}

#[tokio::test]
async fn interrupted_batch_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tickets.db");
    let t0 = Utc::now();

    {
        let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let mailbox = Arc::new(MemoryMailbox::new());
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            mailbox.deliver(message(id, "Help", t0 + chrono::Duration::seconds(i as i64)));
        }
        IngestionProducer::new(store.clone(), mailbox, default_filter())
            .poll_and_ingest()
            .await
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let llm = StubLlm::stopping_after(2, stop.clone());
        let report = pipeline(store.clone(), llm.clone(), 3)
            .process_batch_with_stop(&stop)
            .await
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.drafted, 2);
    }

    // A new process opens the same file and finishes the job.
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    assert_eq!(
        store.get_by_status(TicketStatus::Drafted).await.unwrap().len(),
        2
    );

    let llm = StubLlm::new(Mode::Normal);
    let report = pipeline(store.clone(), llm.clone(), 3)
        .process_batch()
        .await
        .unwrap();
    assert_eq!(report.snapshot, 1);
    assert_eq!(llm.extractions(), 1);
    assert_eq!(
        store.get_by_id("c").await.unwrap().unwrap().status,
        TicketStatus::Drafted
    );
}
