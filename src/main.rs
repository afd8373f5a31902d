use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::info;

use transaction_queue_service::api::{self, AppState};
use transaction_queue_service::chains::ChainRegistry;
use transaction_queue_service::config::Config;
use transaction_queue_service::events::EventBus;
use transaction_queue_service::metrics::ServiceMetrics;
use transaction_queue_service::nonce::NonceAllocator;
use transaction_queue_service::queue::TransactionQueue;
use transaction_queue_service::signer::{SignerConfig, SignerRegistry};
use transaction_queue_service::store::{memory::MemoryStore, postgres::PgStore, LedgerStore};
use transaction_queue_service::wallets::WalletRegistry;
use transaction_queue_service::worker::{self, BroadcastWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!("Starting Transaction Queue Service v{}", env!("CARGO_PKG_VERSION"));

    let chains = Arc::new(match &config.chains_config {
        Some(path) => ChainRegistry::from_config(path)?,
        None => ChainRegistry::with_defaults(),
    });

    let (store, events): (Arc<dyn LedgerStore>, EventBus) =
        if config.store_backend == "memory" {
            info!("Using in-memory store (development mode)");
            let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
            (store, EventBus::disabled())
        } else {
            let store: Arc<dyn LedgerStore> =
                Arc::new(PgStore::connect(&config.database_url).await?);
            let redis_client = redis::Client::open(config.redis_url.clone())?;
            let redis_conn = ConnectionManager::new(redis_client).await?;
            info!("Connected to Redis");
            (store, EventBus::new(redis_conn))
        };

    let signers = Arc::new(SignerRegistry::new(SignerConfig::from_env(
        config.signer_timeout,
    )));
    let wallets = Arc::new(WalletRegistry::new(store.clone()));
    let allocator = Arc::new(NonceAllocator::new(store.clone(), chains.clone()));
    let metrics = Arc::new(ServiceMetrics::new());

    let queue = Arc::new(TransactionQueue::new(
        store.clone(),
        chains.clone(),
        wallets.clone(),
        allocator.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let broadcast_worker = BroadcastWorker::new(
        store.clone(),
        chains.clone(),
        signers.clone(),
        allocator.clone(),
        events.clone(),
        metrics.clone(),
        WorkerConfig::from_config(&config),
    );
    tokio::spawn(broadcast_worker.run(shutdown_rx.clone()));

    if !config.nonce_sync_interval.is_zero() {
        tokio::spawn(worker::nonce_sync_task(
            allocator.clone(),
            config.nonce_sync_interval,
            shutdown_rx.clone(),
        ));
    }

    let app = api::router(AppState {
        queue,
        wallets,
        signers,
        allocator,
        chains,
        store,
        metrics,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Transaction Queue Service running on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
