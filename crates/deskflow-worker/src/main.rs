mod clients;
mod config;
mod csr;

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deskflow_durable::engine::{handlers, StepExecutor};
use deskflow_durable::outbox::{
    email_adapter, DispatcherConfig, EventDispatcher, OutboxPublisher, PublisherConfig,
};
use deskflow_durable::persistence::PgWorkflowStore;
use deskflow_durable::worker::{RequeuerConfig, Scheduler, SchedulerConfig, StaleStepRequeuer};
use deskflow_durable::workflow::WorkflowRegistry;
use deskflow_durable::WorkflowStore;

use clients::{HttpContextRetriever, HttpMailer, HttpTicketSource, OpenAiChatClient};
use config::WorkerConfig;
use csr::CsrWorkflow;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskflow_worker=debug,deskflow_durable=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("deskflow-worker starting...");

    let config = WorkerConfig::from_env()?;

    if !config.orchestration_enabled {
        tracing::warn!("orchestration disabled, no scheduler will run");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("../deskflow-durable/migrations")
        .run(&pool)
        .await?;
    tracing::info!("Database connection established");

    let store: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::new(pool));

    // Workflows
    let mut registry = WorkflowRegistry::new();
    registry.register(Arc::new(CsrWorkflow));

    // Step handlers with their collaborators
    let ticket_source = Arc::new(HttpTicketSource::new(config.ticket_api_url.clone()));
    let llm = Arc::new(OpenAiChatClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let retriever = config
        .rag_api_url
        .clone()
        .map(|url| Arc::new(HttpContextRetriever::new(url)) as Arc<dyn handlers::ContextRetriever>);
    if retriever.is_none() {
        tracing::info!("RAG_API_URL not set, retrieve_context degrades to no-op");
    }

    let mut executor = StepExecutor::new();
    executor.register_handler("fetch_ticket", handlers::fetch(ticket_source));
    executor.register_handler("retrieve_context", handlers::retrieve_context(retriever));
    executor.register_handler("draft_response", handlers::draft(llm));
    executor.register_handler("send_response", handlers::send_email());

    // Outbox side
    let dispatcher = Arc::new(EventDispatcher::new(
        DispatcherConfig::new().with_delivery_timeout(config.dispatch_timeout),
    ));
    let mailer = Arc::new(HttpMailer::new(
        config.mail_api_url.clone(),
        config.mail_api_key.clone(),
    ));
    let mut publisher = OutboxPublisher::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        PublisherConfig::default(),
    );
    publisher.register(
        handlers::EMAIL_SEND_EVENT,
        email_adapter(mailer as Arc<dyn handlers::Mailer>),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(executor),
        Arc::new(registry),
        SchedulerConfig::new()
            .with_worker_count(config.worker_count)
            .with_heartbeat_ttl(config.heartbeat_ttl),
    );

    let requeuer = StaleStepRequeuer::new(
        Arc::clone(&store),
        RequeuerConfig::new().with_heartbeat_ttl(config.heartbeat_ttl),
    );

    scheduler.start()?;
    requeuer.start();
    publisher.start();
    tracing::info!(
        worker_id = scheduler.worker_id(),
        workers = config.worker_count,
        "Worker ready to execute workflows"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    // Stop claiming first, then let recovery and delivery drain
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("Scheduler shutdown error: {}", e);
    }
    requeuer.shutdown().await;
    publisher.shutdown().await;

    tracing::info!("deskflow-worker stopped");
    Ok(())
}
