//! End-to-end spike flow scenarios
//!
//! These tests require live Redis, PostgreSQL and RabbitMQ:
//!   docker-compose up -d postgres redis rabbitmq
//! then: cargo test --test spike_flow -- --ignored --test-threads=1
//!
//! Connection URLs come from DATABASE_URL / REDIS_URL / AMQP_URL.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use spike_gate::config::AppConfig;
use spike_gate::core_types::{EventId, ProductId, UserId};
use spike_gate::kv::Kv;
use spike_gate::models::SpikeOrderStatus;
use spike_gate::mq::{ConsumerPool, Message, MessageKind, MqConnection, OrderCreated, Producer, topology};
use spike_gate::repository::{SpikeEventRepository, SpikeOrderRepository};
use spike_gate::spike::{
    NotificationHandler, OrderQueueHandler, ParticipateCommand, SpikeService, StockRestoreHandler,
};

struct Stack {
    pool: Arc<PgPool>,
    service: Arc<SpikeService>,
    producer: Arc<Producer>,
}

async fn start_stack(config: AppConfig) -> Stack {
    let db = spike_gate::db::Database::connect(&config.database)
        .await
        .expect("postgres must be running");
    let pool = Arc::new(db.pool().clone());
    ensure_schema(&pool).await;

    let kv = Kv::connect(&config.redis).await.expect("redis must be running");

    let mq = MqConnection::connect(&config.mq)
        .await
        .expect("rabbitmq must be running");
    let producer = Producer::new(Arc::clone(&mq), config.mq.clone());

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

    let service = Arc::new(SpikeService::new(
        Arc::clone(&pool),
        kv.clone(),
        Arc::clone(&producer),
        &config.limiter,
        config.spike.clone(),
    ));

    Stack {
        pool,
        service,
        producer,
    }
}

/// Minimal schema for a scratch database; harmless when already there.
async fn ensure_schema(pool: &PgPool) {
    for ddl in [
        "CREATE TABLE IF NOT EXISTS products (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT NOT NULL UNIQUE,
            price NUMERIC NOT NULL,
            status SMALLINT NOT NULL DEFAULT 1
        )",
        "CREATE TABLE IF NOT EXISTS inventory (
            id BIGSERIAL PRIMARY KEY,
            product_id BIGINT NOT NULL UNIQUE,
            stock BIGINT NOT NULL,
            reserved_stock BIGINT NOT NULL DEFAULT 0,
            sold_stock BIGINT NOT NULL DEFAULT 0,
            reorder_point BIGINT NOT NULL DEFAULT 0,
            max_stock BIGINT NOT NULL DEFAULT 0,
            version BIGINT NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS spike_events (
            id BIGSERIAL PRIMARY KEY,
            product_id BIGINT NOT NULL,
            spike_price NUMERIC NOT NULL,
            original_price NUMERIC NOT NULL,
            spike_stock BIGINT NOT NULL,
            sold_count BIGINT NOT NULL DEFAULT 0,
            start_at TIMESTAMPTZ NOT NULL,
            end_at TIMESTAMPTZ NOT NULL,
            status SMALLINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        "CREATE TABLE IF NOT EXISTS spike_orders (
            id BIGSERIAL PRIMARY KEY,
            spike_event_id BIGINT NOT NULL,
            user_id BIGINT NOT NULL,
            order_id BIGINT,
            quantity BIGINT NOT NULL,
            spike_price NUMERIC NOT NULL,
            total_amount NUMERIC NOT NULL,
            status SMALLINT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            expire_at TIMESTAMPTZ NOT NULL,
            paid_at TIMESTAMPTZ,
            cancelled_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        "CREATE INDEX IF NOT EXISTS idx_spike_orders_user ON spike_orders (user_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_spike_orders_event ON spike_orders (spike_event_id)",
        "CREATE INDEX IF NOT EXISTS idx_spike_orders_expiry ON spike_orders (status, expire_at)",
    ] {
        sqlx::query(ddl).execute(pool).await.expect("schema setup");
    }
}

/// Insert product + inventory + active event; returns (event, product).
async fn seed_event(pool: &PgPool, stock: i64) -> (EventId, ProductId) {
    let sku = format!("SKU-{}", uuid::Uuid::new_v4());
    let product_id: i64 = sqlx::query_scalar(
        "INSERT INTO products (name, sku, price) VALUES ($1, $2, 99) RETURNING id",
    )
    .bind(format!("product {}", sku))
    .bind(&sku)
    .fetch_one(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO inventory (product_id, stock, max_stock) VALUES ($1, $2, $2)",
    )
    .bind(product_id)
    .bind(stock * 10)
    .execute(pool)
    .await
    .unwrap();

    let event_id: i64 = sqlx::query_scalar(
        "INSERT INTO spike_events
            (product_id, spike_price, original_price, spike_stock, start_at, end_at, status)
         VALUES ($1, 49, 99, $2, NOW() - INTERVAL '1 minute', NOW() + INTERVAL '1 hour', 1)
         RETURNING id",
    )
    .bind(product_id)
    .bind(stock)
    .fetch_one(pool)
    .await
    .unwrap();

    (event_id, product_id)
}

fn cmd(event_id: EventId, quantity: i64, key: &str) -> ParticipateCommand {
    ParticipateCommand {
        spike_event_id: event_id,
        quantity,
        idempotency_key: key.to_string(),
    }
}

fn key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Poll until the order with `key` exists or the deadline passes.
async fn wait_for_order(
    pool: &PgPool,
    idempotency_key: &str,
    deadline: Duration,
) -> Option<spike_gate::models::SpikeOrder> {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(Some(order)) =
            SpikeOrderRepository::get_by_idempotency_key(pool, idempotency_key).await
        {
            return Some(order);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

async fn wait_for_status(
    pool: &PgPool,
    idempotency_key: &str,
    status: SpikeOrderStatus,
    deadline: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(Some(order)) =
            SpikeOrderRepository::get_by_idempotency_key(pool, idempotency_key).await
        {
            if order.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::from_env();
    // Keep admission wide open unless a scenario narrows it.
    config.limiter.global.rate = 100_000;
    config.limiter.per_user.rate = 1_000;
    config
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn successful_sale_reconciles_order() {
    let stack = start_stack(test_config()).await;
    let (event_id, _product) = seed_event(&stack.pool, 10).await;
    stack.service.warmup(event_id).await.unwrap();

    let idem = key();
    let reply = stack
        .service
        .participate(1, cmd(event_id, 1, &idem), "trace-s1")
        .await
        .unwrap();
    assert!(reply.success, "unexpected rejection: {}", reply.message);

    let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
    assert_eq!(info.remaining, 9);

    let order = wait_for_order(&stack.pool, &idem, Duration::from_secs(10))
        .await
        .expect("order should be reconciled");
    assert_eq!(order.status, SpikeOrderStatus::Pending);
    assert_eq!(order.quantity, 1);

    let event = SpikeEventRepository::get(&stack.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sold_count, 1);
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn hundred_buyers_one_item() {
    let stack = start_stack(test_config()).await;
    let (event_id, _product) = seed_event(&stack.pool, 1).await;
    stack.service.warmup(event_id).await.unwrap();

    let mut handles = Vec::new();
    for user in 1..=100_i64 {
        let service = Arc::clone(&stack.service);
        let idem = key();
        handles.push(tokio::spawn(async move {
            service
                .participate(user as UserId, cmd(event_id, 1, &idem), "trace-s2")
                .await
        }));
    }

    let mut wins = 0;
    let mut sold_out_messages = 0;
    for handle in handles {
        let reply = handle.await.unwrap().unwrap();
        if reply.success {
            wins += 1;
        } else if reply.message.contains("sold") || reply.message.contains("insufficient") {
            sold_out_messages += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(sold_out_messages, 99);

    let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
    assert_eq!(info.remaining, 0);
    assert!(info.sold_out);

    // The one win reconciles to exactly one sold unit.
    let start = std::time::Instant::now();
    loop {
        let event = SpikeEventRepository::get(&stack.pool, event_id)
            .await
            .unwrap()
            .unwrap();
        if event.sold_count == 1 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "sold_count never reached 1"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn duplicate_user_is_rejected() {
    let stack = start_stack(test_config()).await;
    let (event_id, _product) = seed_event(&stack.pool, 5).await;
    stack.service.warmup(event_id).await.unwrap();

    let first = stack
        .service
        .participate(7, cmd(event_id, 1, &key()), "trace-s3")
        .await
        .unwrap();
    assert!(first.success);

    let second = stack
        .service
        .participate(7, cmd(event_id, 1, &key()), "trace-s3")
        .await
        .unwrap();
    assert!(!second.success);
    assert!(second.message.contains("already participated"));

    let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
    assert_eq!(info.remaining, 4);
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running; drops the delay queue
async fn expiry_restores_both_counters() {
    let mut config = test_config();
    // Short payment window so the broker TTL fires fast.
    config.spike.order_ttl_secs = 1;
    config.mq.delay_queue_ttl_ms = 500;

    // The delay queue may exist with a different TTL; recreate it.
    {
        let mq = MqConnection::connect(&AppConfig::from_env().mq).await.unwrap();
        let channel = mq.create_channel().await.unwrap();
        let _ = channel
            .queue_delete(
                topology::ORDER_DELAY_QUEUE,
                lapin::options::QueueDeleteOptions::default(),
            )
            .await;
    }

    let stack = start_stack(config).await;
    let (event_id, _product) = seed_event(&stack.pool, 3).await;
    stack.service.warmup(event_id).await.unwrap();

    let idem = key();
    let reply = stack
        .service
        .participate(9, cmd(event_id, 1, &idem), "trace-s4")
        .await
        .unwrap();
    assert!(reply.success);

    let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
    assert_eq!(info.remaining, 2);

    // No payment: after the TTL round-trip the order expires and both
    // counters return.
    assert!(
        wait_for_status(&stack.pool, &idem, SpikeOrderStatus::Expired, Duration::from_secs(15))
            .await,
        "order never expired"
    );

    let start = std::time::Instant::now();
    loop {
        let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
        let event = SpikeEventRepository::get(&stack.pool, event_id)
            .await
            .unwrap()
            .unwrap();
        if info.remaining == 3 && event.sold_count == 0 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "counters not restored: fast={} sold={}",
            info.remaining,
            event.sold_count
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn cancellation_restores_and_checks_owner() {
    let stack = start_stack(test_config()).await;
    let (event_id, _product) = seed_event(&stack.pool, 5).await;
    stack.service.warmup(event_id).await.unwrap();

    let idem = key();
    let owner: UserId = 21;
    let reply = stack
        .service
        .participate(owner, cmd(event_id, 2, &idem), "trace-s5")
        .await
        .unwrap();
    assert!(reply.success);

    let order = wait_for_order(&stack.pool, &idem, Duration::from_secs(10))
        .await
        .expect("order should exist");

    // A non-owner is refused outright.
    let stranger = stack
        .service
        .cancel_order(9999, order.id, "not mine", "trace-s5")
        .await;
    assert!(matches!(
        stranger,
        Err(spike_gate::SpikeError::Forbidden)
    ));

    stack
        .service
        .cancel_order(owner, order.id, "changed my mind", "trace-s5")
        .await
        .unwrap();

    assert!(
        wait_for_status(&stack.pool, &idem, SpikeOrderStatus::Cancelled, Duration::from_secs(10))
            .await,
        "order never cancelled"
    );

    let start = std::time::Instant::now();
    loop {
        let info = stack.service.stock_store().get_stock_info(event_id).await.unwrap();
        if info.remaining == 5 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "fast counter not restored: {}",
            info.remaining
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn global_rate_limit_caps_burst() {
    let mut config = test_config();
    config.limiter.global.rate = 2;
    config.limiter.global.burst = 0;
    config.limiter.global.window_secs = 1;

    let stack = start_stack(config).await;
    let (event_id, _product) = seed_event(&stack.pool, 100).await;
    stack.service.warmup(event_id).await.unwrap();

    let mut allowed = 0;
    let mut limited_with_hint = 0;
    for user in 1..=5_i64 {
        let reply = stack
            .service
            .participate(user, cmd(event_id, 1, &key()), "trace-s6")
            .await
            .unwrap();
        if reply.success {
            allowed += 1;
        } else if reply.retry_after_secs.is_some() {
            limited_with_hint += 1;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(allowed, 2);
    assert_eq!(limited_with_hint, 3);
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn batched_publisher_confirms_every_message() {
    let stack = start_stack(test_config()).await;
    let batch = stack.producer.start_batcher();

    let mut handles = Vec::new();
    for i in 0..200_i64 {
        let batch = batch.clone();
        handles.push(tokio::spawn(async move {
            let msg = Message::new(
                MessageKind::NotificationSend,
                "trace-batch",
                spike_gate::mq::NotificationSend {
                    user_id: i,
                    subject: "batch test".to_string(),
                    body: format!("message {}", i),
                },
            );
            batch.publish(&msg).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().expect("every batched publish confirms");
    }
}

#[tokio::test]
#[ignore] // Requires Redis + PostgreSQL + RabbitMQ running
async fn duplicate_delivery_creates_one_order() {
    let stack = start_stack(test_config()).await;
    let (event_id, product_id) = seed_event(&stack.pool, 10).await;
    stack.service.warmup(event_id).await.unwrap();

    let idem = key();
    let payload = OrderCreated {
        spike_event_id: event_id,
        user_id: 31,
        product_id,
        quantity: 1,
        spike_price: rust_decimal::Decimal::from(49),
        total_amount: rust_decimal::Decimal::from(49),
        idempotency_key: idem.clone(),
        expire_at: chrono::Utc::now() + chrono::Duration::minutes(15),
    };
    let msg = Message::new(MessageKind::OrderCreated, "trace-s7", payload);

    // The broker promises at-least-once; simulate the worst case.
    stack.producer.publish(&msg).await.unwrap();
    stack.producer.publish(&msg).await.unwrap();

    wait_for_order(&stack.pool, &idem, Duration::from_secs(10))
        .await
        .expect("order should be created");
    // Give the duplicate delivery time to be (idempotently) absorbed.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM spike_orders WHERE idempotency_key = $1",
    )
    .bind(&idem)
    .fetch_one(&*stack.pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    let event = SpikeEventRepository::get(&stack.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sold_count, 1);
}
