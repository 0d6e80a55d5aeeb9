//! Unit tests for the schema migration runner.

use agent_relay::persistence::{db, migrations};

#[test]
fn steps_are_strictly_ordered() {
    let versions: Vec<i64> = migrations::STEPS.iter().map(|s| s.version).collect();
    assert!(!versions.is_empty());
    assert!(
        versions.windows(2).all(|pair| pair[0] < pair[1]),
        "step versions must strictly increase: {versions:?}"
    );
}

#[tokio::test]
async fn fresh_database_reaches_the_latest_version() {
    let pool = db::connect_memory().await.expect("db connect");

    let latest: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .expect("version query");
    let expected = migrations::STEPS.last().expect("steps exist").version;
    assert_eq!(latest, expected);
}

#[tokio::test]
async fn all_core_tables_exist_and_start_empty() {
    let pool = db::connect_memory().await.expect("db connect");

    for table in ["session", "outbox", "listener"] {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(count, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn rerunning_migrations_is_idempotent() {
    let pool = db::connect_memory().await.expect("db connect");

    // connect_memory already ran the steps once; run them again.
    migrations::run(&pool).await.expect("second run");
    migrations::run(&pool).await.expect("third run");

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&pool)
        .await
        .expect("version count");
    let steps = i64::try_from(migrations::STEPS.len()).expect("step count fits");
    assert_eq!(rows, steps, "each step is recorded exactly once");
}

#[tokio::test]
async fn timestamp_columns_from_later_steps_are_present() {
    let pool = db::connect_memory().await.expect("db connect");

    for column in ["last_tool_use_at", "last_checkpoint_at", "last_output_at"] {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('session') WHERE name = ?1")
                .bind(column)
                .fetch_one(&pool)
                .await
                .expect("pragma query");
        assert_eq!(count, 1, "column '{column}' should exist on session");
    }
}
