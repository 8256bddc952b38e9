use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use support_triage::analysis::LlmAnalyst;
use support_triage::config::{MailboxConfig, TriageConfig};
use support_triage::error::{ConfigError, Error};
use support_triage::ingest::IngestionProducer;
use support_triage::llm::{LlmConfig, create_provider};
use support_triage::mailbox::{ImapMailbox, SubjectFilter};
use support_triage::pipeline::AnalysisPipeline;
use support_triage::review::{ReviewService, review_routes};
use support_triage::schedule::{PeriodicHandle, spawn_periodic};
use support_triage::store::{LibSqlBackend, TicketStore};

const USAGE: &str = "usage: support-triage [ingest|process|review|all]";

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Ingest,
    Process,
    Review,
    All,
}

impl Role {
    fn runs_ingest(self) -> bool {
        matches!(self, Self::Ingest | Self::All)
    }

    fn runs_process(self) -> bool {
        matches!(self, Self::Process | Self::All)
    }

    fn runs_review(self) -> bool {
        matches!(self, Self::Review | Self::All)
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "process" => Ok(Self::Process),
            "review" => Ok(Self::Review),
            "all" => Ok(Self::All),
            other => Err(format!("unknown role {other:?}\n{USAGE}")),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let role: Role = match std::env::args().nth(1) {
        Some(arg) => arg.parse().map_err(|message| ConfigError::InvalidValue {
            key: "role".into(),
            message,
        })?,
        None => Role::All,
    };

    // Every setting the role needs is read before anything touches the store.
    let config = TriageConfig::from_env()?;
    let mailbox_config = role.runs_ingest().then(MailboxConfig::from_env).transpose()?;
    let llm_config = role.runs_process().then(LlmConfig::from_env).transpose()?;
    let filter = SubjectFilter::new(&config.subject_filter_terms)?;

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _log_guard = init_tracing(&config);

    eprintln!("support-triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Role: {role:?}");
    eprintln!("   Store: {}", config.db_path.display());

    let store: Arc<dyn TicketStore> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let mut periodic: Vec<PeriodicHandle> = Vec::new();

    if let Some(mailbox_config) = mailbox_config {
        eprintln!(
            "   Mailbox: {}@{}/{}",
            mailbox_config.username, mailbox_config.imap_host, mailbox_config.mailbox
        );
        let mailbox = Arc::new(ImapMailbox::new(mailbox_config));
        let producer = Arc::new(IngestionProducer::new(Arc::clone(&store), mailbox, filter));
        periodic.push(spawn_periodic(producer, config.poll_interval));
    }

    if let Some(llm_config) = llm_config {
        let llm = create_provider(&llm_config)?;
        let analyst = Arc::new(LlmAnalyst::new(llm, config.ai_call_timeout));
        let pipeline = Arc::new(AnalysisPipeline::new(
            Arc::clone(&store),
            analyst.clone(),
            analyst,
            config.max_extraction_attempts,
        ));
        periodic.push(spawn_periodic(pipeline, config.process_interval));
    }

    let server = if role.runs_review() {
        let app = review_routes(Arc::new(ReviewService::new(Arc::clone(&store))));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.review_port)).await?;
        eprintln!("   Review API: http://0.0.0.0:{}/api/tickets", config.review_port);
        tracing::info!(port = config.review_port, "Review server started");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Review server stopped");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    for handle in periodic {
        handle.stop().await;
    }
    if let Some(server) = server {
        server.abort();
    }
    Ok(())
}

/// Console logging plus an optional daily-rolling file. The returned guard
/// flushes the file writer on drop.
fn init_tracing(config: &TriageConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "support-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
