//! PostgreSQL integration tests for the order and outbox repositories.
//!
//! These tests use a shared PostgreSQL container for efficiency. Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use common::{Money, OrderId, UserId};
use saga::{
    DomainEvent, Order, OrderStore, OutboxRecord, OutboxStatus, OutboxStore, PostgresOrderStore,
    PostgresOutboxStore,
};
use serial_test::serial;
use sqlx::PgPool;
use store::StoreError;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_commerce_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_pool() -> PgPool {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE outbox, orders CASCADE")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

fn sample_event() -> DomainEvent {
    DomainEvent::PaymentCreated {
        order_id: OrderId::new(),
        user_id: UserId::new(),
        amount: Money::from_dollars(25),
    }
}

#[tokio::test]
#[serial]
async fn order_save_and_find_roundtrip() {
    let store = PostgresOrderStore::new(get_pool().await);
    let order = Order::new(UserId::new(), Money::from_dollars(42));
    store.save(&order).await.unwrap();

    let found = store.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(found.id, order.id);
    assert_eq!(found.user_id, order.user_id);
    assert_eq!(found.status, order.status);
    assert_eq!(found.total, Money::from_dollars(42));
    assert_eq!(found.version, order.version.next());
}

#[tokio::test]
#[serial]
async fn stale_order_save_conflicts() {
    let store = PostgresOrderStore::new(get_pool().await);
    let order = Order::new(UserId::new(), Money::from_dollars(42));
    store.save(&order).await.unwrap();

    // Saving the original (stale) snapshot again must lose.
    let err = store.save(&order).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { .. }));

    // The fresh snapshot wins.
    let mut fresh = store.find_by_id(order.id).await.unwrap().unwrap();
    fresh.mark_payment_eligible().unwrap();
    store.save(&fresh).await.unwrap();

    let stored = store.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, saga::OrderStatus::AwaitingPayment);
}

#[tokio::test]
#[serial]
async fn pending_records_come_back_in_creation_order() {
    let store = PostgresOutboxStore::new(get_pool().await);

    let first = OutboxRecord::new(&sample_event()).unwrap();
    let second = OutboxRecord::new(&sample_event()).unwrap();
    let third = OutboxRecord::new(&sample_event()).unwrap();
    for record in [&first, &second, &third] {
        store.append(record).await.unwrap();
    }

    let pending = store.find_pending(10).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].event_id, first.event_id);
    assert_eq!(pending[2].event_id, third.event_id);
    assert_eq!(pending[0].decode().unwrap().order_id(), first.aggregate_id);

    // The limit caps the batch from the front.
    let capped = store.find_pending(2).await.unwrap();
    assert_eq!(capped.len(), 2);
    assert_eq!(capped[1].event_id, second.event_id);
}

#[tokio::test]
#[serial]
async fn duplicate_event_id_is_rejected_by_the_database() {
    let store = PostgresOutboxStore::new(get_pool().await);
    let record = OutboxRecord::new(&sample_event()).unwrap();

    store.append(&record).await.unwrap();
    let err = store.append(&record).await.unwrap_err();
    assert!(matches!(err, StoreError::UniqueViolation { .. }));
}

#[tokio::test]
#[serial]
async fn publish_and_dead_letter_transitions() {
    let store = PostgresOutboxStore::new(get_pool().await);

    let published = OutboxRecord::new(&sample_event()).unwrap();
    let failing = OutboxRecord::new(&sample_event()).unwrap();
    store.append(&published).await.unwrap();
    store.append(&failing).await.unwrap();

    store.mark_published(published.event_id).await.unwrap();

    assert_eq!(store.record_failure(failing.event_id, "first").await.unwrap(), 1);
    assert_eq!(
        store.record_failure(failing.event_id, "second").await.unwrap(),
        2
    );
    // Failures alone keep the record pending.
    let pending = store.find_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, failing.event_id);
    assert_eq!(pending[0].retry_count, 2);
    assert_eq!(pending[0].error_message.as_deref(), Some("second"));
    assert_eq!(pending[0].status, OutboxStatus::Pending);

    store.mark_failed(failing.event_id, "gave up").await.unwrap();
    assert!(store.find_pending(10).await.unwrap().is_empty());
}
