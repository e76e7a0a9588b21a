//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-log --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use common::SagaId;
use saga_log::{PostgresSagaLog, SagaLog, SagaLogError, SagaLogRecord, Sequence};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
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
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_log.sql"))
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

/// Get a fresh log with its own pool and a cleared table
async fn get_test_log() -> PostgresSagaLog {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_log")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaLog::new(pool)
}

fn record(saga_id: SagaId, sequence: i64, status: &str) -> SagaLogRecord {
    SagaLogRecord::new(saga_id, Sequence::new(sequence), status, json!({ "type": status }))
}

#[tokio::test]
#[serial]
async fn append_and_read_back() {
    let log = get_test_log().await;
    let saga_id = SagaId::new();

    log.append(record(saga_id, 1, "SagaStarted"), Sequence::initial())
        .await
        .unwrap();
    log.append(record(saga_id, 2, "StepStarted").with_step(0), Sequence::first())
        .await
        .unwrap();

    let records = log.records_for(saga_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, "SagaStarted");
    assert_eq!(records[1].step_index, Some(0));
    assert_eq!(records[1].payload, json!({ "type": "StepStarted" }));
    assert_eq!(log.current_sequence(saga_id).await.unwrap(), Some(Sequence::new(2)));
}

#[tokio::test]
#[serial]
async fn stale_sequence_conflicts() {
    let log = get_test_log().await;
    let saga_id = SagaId::new();

    log.append(record(saga_id, 1, "SagaStarted"), Sequence::initial())
        .await
        .unwrap();
    log.append(record(saga_id, 2, "StepStarted"), Sequence::first())
        .await
        .unwrap();

    let err = log
        .append(record(saga_id, 2, "CancelRequested"), Sequence::first())
        .await
        .unwrap_err();
    assert!(matches!(err, SagaLogError::SequenceConflict { .. }));
    assert_eq!(log.records_for(saga_id).await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn lists_every_saga_once() {
    let log = get_test_log().await;
    let first = SagaId::new();
    let second = SagaId::new();

    log.append(record(first, 1, "SagaStarted"), Sequence::initial())
        .await
        .unwrap();
    log.append(record(second, 1, "SagaStarted"), Sequence::initial())
        .await
        .unwrap();
    log.append(record(first, 2, "SagaCompleted"), Sequence::first())
        .await
        .unwrap();

    let ids = log.saga_ids().await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first));
    assert!(ids.contains(&second));
}

#[tokio::test]
#[serial]
async fn unknown_saga_has_no_records() {
    let log = get_test_log().await;
    let saga_id = SagaId::new();

    assert!(log.records_for(saga_id).await.unwrap().is_empty());
    assert_eq!(log.current_sequence(saga_id).await.unwrap(), None);
}

#[tokio::test]
#[serial]
async fn filters_sagas_by_recorded_status() {
    let log = get_test_log().await;
    let archived = SagaId::new();
    let open = SagaId::new();
    let failed = SagaId::new();

    for id in [archived, open, failed] {
        log.append(record(id, 1, "SagaStarted"), Sequence::initial())
            .await
            .unwrap();
    }
    log.append(record(archived, 2, "OutcomePublished"), Sequence::first())
        .await
        .unwrap();
    log.append(record(failed, 2, "SagaFailed"), Sequence::first())
        .await
        .unwrap();
    log.append(record(failed, 3, "OutcomePublished"), Sequence::new(2))
        .await
        .unwrap();

    assert_eq!(
        log.saga_ids_without_status("OutcomePublished").await.unwrap(),
        vec![open]
    );
    assert_eq!(
        log.saga_ids_with_status("SagaFailed").await.unwrap(),
        vec![failed]
    );
}
