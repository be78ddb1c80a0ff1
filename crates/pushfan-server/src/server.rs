use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use pushfan_core::{
    ContactStore, DynContactStore, DynEventStore, DynMessageStore, DynStatsStore, EventStore,
    MessageStore, StatsStore,
};
use pushfan_db_postgres::PostgresStorage;
use pushfan_notifications::{
    BackgroundQueue, BackgroundWorkQueue, BatchDispatcher, DispatchSettings, EventRecorder,
    PagedSubscriberSource, ProviderRouter, PushService, PushTransport, QueuePublisher,
    QueuedPushService, StatsAggregator, TrackingCodec, TrackingError, TrackingUrls,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{AppConfig, PushConfig, StorageBackend};
use crate::handlers;
use crate::redis_publisher::{RedisQueuePublisher, create_redis_pool};
use crate::transport::UnconfiguredTokenTransport;

/// How often expired stats buckets are purged.
const STATS_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Storage ports, usually all backed by the same storage.
#[derive(Clone)]
pub struct Stores {
    pub contacts: DynContactStore,
    pub messages: DynMessageStore,
    pub events: DynEventStore,
    pub stats: DynStatsStore,
}

impl Stores {
    pub fn shared<S>(storage: Arc<S>) -> Self
    where
        S: ContactStore + MessageStore + EventStore + StatsStore + 'static,
    {
        Self {
            contacts: storage.clone(),
            messages: storage.clone(),
            events: storage.clone(),
            stats: storage,
        }
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub push: Arc<dyn PushService>,
    pub recorder: EventRecorder,
    pub urls: Arc<TrackingUrls>,
}

impl AppState {
    /// Wires the pipeline from its collaborators.
    pub fn assemble(
        push: &PushConfig,
        public_base_url: &str,
        stores: Stores,
        publisher: Arc<dyn QueuePublisher>,
        transport: Arc<dyn PushTransport>,
        queue: Arc<dyn BackgroundQueue>,
    ) -> Result<Self, TrackingError> {
        let codec = TrackingCodec::from_encoded(&push.encryption_key, &push.encryption_iv)?;
        let urls = Arc::new(TrackingUrls::new(public_base_url, codec));
        let router = Arc::new(ProviderRouter::new(&push.push_endpoint_mappings));
        let source = Arc::new(
            PagedSubscriberSource::new(stores.contacts.clone())
                .with_page_size(push.cursor_batch_size),
        );

        let recorder = EventRecorder::new(
            stores.contacts.clone(),
            stores.messages.clone(),
            stores.events.clone(),
            StatsAggregator::new(stores.stats.clone()),
        );

        let dispatcher = Arc::new(BatchDispatcher::new(
            source,
            router.clone(),
            urls.clone(),
            publisher,
            transport,
            stores.contacts.clone(),
            recorder.clone(),
            DispatchSettings {
                process_batch_size: push.process_push_batch_size,
            },
        ));

        info!(
            queues = ?router.queue_names(),
            process_push_batch_size = push.process_push_batch_size,
            cursor_batch_size = push.cursor_batch_size,
            "Push pipeline assembled"
        );

        Ok(Self {
            push: Arc::new(QueuedPushService::new(
                stores.messages.clone(),
                dispatcher,
                queue,
            )),
            recorder,
            urls,
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/domains/{domain}/messages", post(handlers::send_to_domain))
        .route(
            "/domains/{domain}/visitors/{visitor_guid}/messages",
            post(handlers::send_to_visitor),
        )
        .route(
            "/{contact}/messages/{message}/{event}",
            post(handlers::record_callback),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct PushfanServer {
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Connects storage and Redis, then assembles the pipeline.
    ///
    /// Fails when a backend is unreachable or the encryption material is invalid.
    pub async fn build(self) -> anyhow::Result<PushfanServer> {
        let cfg = self.config;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let stores = match cfg.storage.backend {
            StorageBackend::Postgres => {
                let storage = Arc::new(
                    PostgresStorage::connect(&cfg.storage.postgres)
                        .await
                        .context("PostgreSQL storage initialization failed")?,
                );
                tasks.push(spawn_stats_purge(
                    storage.clone(),
                    cfg.storage.postgres.stats_retention(),
                    shutdown.clone(),
                ));
                Stores::shared(storage)
            }
            StorageBackend::Memory => {
                warn!("Using in-memory storage, data is lost on restart");
                Stores::shared(pushfan_db_memory::create_storage())
            }
        };

        let redis = create_redis_pool(&cfg.redis).await?;
        let (queue, consumer) =
            BackgroundWorkQueue::start(cfg.push.work_queue_capacity, shutdown.clone());
        tasks.push(consumer);

        let state = AppState::assemble(
            &cfg.push,
            &cfg.public_base_url(),
            stores,
            Arc::new(RedisQueuePublisher::new(redis)),
            Arc::new(UnconfiguredTokenTransport),
            Arc::new(queue),
        )
        .context("Invalid push encryption material")?;

        Ok(PushfanServer {
            addr: cfg.addr(),
            app: build_app(state),
            shutdown,
            tasks,
        })
    }
}

impl PushfanServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("listening on {}", self.addr);

        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal(self.shutdown.clone()))
            .await;

        // Stop background work even if serving failed.
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        served?;
        info!("shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("shutdown signal received");
    shutdown.cancel();
}

fn spawn_stats_purge(
    storage: Arc<PostgresStorage>,
    retention: time::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = storage.purge_expired_stats(retention).await {
                        warn!(error = %e, "Failed to purge expired message stats");
                    }
                }
            }
        }
    })
}
