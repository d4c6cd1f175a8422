//! spike_gate service binary
//!
//! Wiring order matters: config -> logging -> Postgres -> Redis ->
//! AMQP (topology) -> consumers -> gateway. The gateway serves until
//! SIGINT; consumer workers die with the process, and unacked
//! deliveries are redelivered to the next instance.

use std::sync::Arc;

use spike_gate::auth::JwtVerifier;
use spike_gate::config::AppConfig;
use spike_gate::db::Database;
use spike_gate::gateway::{self, state::AppState};
use spike_gate::kv::Kv;
use spike_gate::logging;
use spike_gate::mq::{ConsumerPool, MqConnection, Producer, topology};
use spike_gate::spike::{
    NotificationHandler, OrderQueueHandler, SpikeService, StockRestoreHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::from_env(),
    };

    let _log_guard = logging::init_logging(&config.logging);
    tracing::info!("spike_gate starting");

    // Storage handles.
    let db = Arc::new(Database::connect(&config.database).await?);
    let pool = Arc::new(db.pool().clone());
    let kv = Kv::connect(&config.redis).await?;

    // Broker: connection + topology, then the confirming producer.
    let mq = MqConnection::connect(&config.mq).await?;
    let producer = Producer::new(Arc::clone(&mq), config.mq.clone());

    // Reconciliation consumers.
    let consumers = ConsumerPool::new(Arc::clone(&mq), config.mq.clone());
    consumers.start(
        topology::ORDER_QUEUE,
        OrderQueueHandler::new(
            Arc::clone(&pool),
            kv.clone(),
            Arc::clone(&producer),
            config.spike.clone(),
        ),
    );
    consumers.start(
        topology::STOCK_RESTORE_QUEUE,
        StockRestoreHandler::new(Arc::clone(&pool), kv.clone(), config.spike.clone()),
    );
    consumers.start(topology::NOTIFICATION_QUEUE, NotificationHandler::new());

    // Coordinator + gateway.
    let service = Arc::new(SpikeService::new(
        Arc::clone(&pool),
        kv.clone(),
        producer,
        &config.limiter,
        config.spike.clone(),
    ));
    let verifier = Arc::new(JwtVerifier::new(&config.auth.jwt_secret));
    let state = AppState::new(service, db, kv, verifier);

    gateway::serve(state, &config.server.host, config.server.port).await?;

    tracing::info!("spike_gate stopped");
    Ok(())
}
