//! Replace semantics against a live Postgres.
//! Run with: DATABASE_URL=... cargo test -p matchday-storage --test pg_store -- --ignored
//! Each test works in its own schema, dropped at the end.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{Duration, TimeZone, Utc};
use matchday_core::PersistedFixture;
use matchday_storage::{FixtureStore, PgFixtureStore, StorageError};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("../../../migrations/0001_create_fixtures.sql");

fn fixture(identity: &str, minutes: i64) -> PersistedFixture {
    PersistedFixture {
        identity: identity.to_string(),
        event_id: identity.to_string(),
        title: format!("Event {identity}"),
        sport: Some("Football".into()),
        league: None,
        thumbnail: None,
        start_at: Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().unwrap()
            + Duration::minutes(minutes),
        channel: "Sky Sports".into(),
        channel_link: "/channels/sky-sports".into(),
        country: Some("England".into()),
        broadcast_country: "United Kingdom".into(),
    }
}

fn batch(prefix: &str, n: usize) -> Vec<PersistedFixture> {
    (0..n).map(|i| fixture(&format!("{prefix}-{i}"), i as i64)).collect()
}

async fn identities(pool: &PgPool) -> HashSet<String> {
    sqlx::query_scalar::<_, String>("SELECT identity FROM fixtures")
        .fetch_all(pool)
        .await
        .unwrap()
        .into_iter()
        .collect()
}

fn ids(fixtures: &[PersistedFixture]) -> HashSet<String> {
    fixtures.iter().map(|f| f.identity.clone()).collect()
}

struct Scratch {
    admin: PgPool,
    schema: String,
    store: PgFixtureStore,
}

impl Scratch {
    async fn open() -> Self {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("connect");
        let schema = format!("matchday_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("create schema");

        let options = PgConnectOptions::from_str(&url)
            .expect("parse url")
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .expect("connect scratch");
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .expect("apply schema");

        Self {
            admin,
            schema,
            store: PgFixtureStore::new(pool),
        }
    }

    async fn close(self) {
        self.store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("drop schema");
    }
}

#[tokio::test]
#[ignore = "needs a Postgres DATABASE_URL"]
async fn replace_all_swaps_the_whole_collection() {
    let scratch = Scratch::open().await;
    let store = &scratch.store;
    let pool = store.pool();

    let first = batch("first", 3);
    assert_eq!(store.replace_all(&first).await.unwrap(), 3);
    assert_eq!(identities(pool).await, ids(&first));

    let second = batch("second", 2);
    assert_eq!(store.replace_all(&second).await.unwrap(), 2);
    assert_eq!(identities(pool).await, ids(&second));

    let listed = store.list_upcoming(10).await.unwrap();
    assert_eq!(listed, second);

    assert_eq!(store.replace_all(&[]).await.unwrap(), 0);
    assert!(identities(pool).await.is_empty());
    assert!(store.list_upcoming(10).await.unwrap().is_empty());

    scratch.close().await;
}

#[tokio::test]
#[ignore = "needs a Postgres DATABASE_URL"]
async fn replace_all_inserts_more_rows_than_one_statement_carries() {
    let scratch = Scratch::open().await;
    let store = &scratch.store;

    let many = batch("bulk", 2_501);
    assert_eq!(store.replace_all(&many).await.unwrap(), 2_501);
    assert_eq!(identities(store.pool()).await, ids(&many));

    let listed = store.list_upcoming(5_000).await.unwrap();
    assert_eq!(listed.len(), 2_501);
    assert_eq!(listed.first().map(|f| f.identity.as_str()), Some("bulk-0"));
    assert_eq!(listed.last().map(|f| f.identity.as_str()), Some("bulk-2500"));

    scratch.close().await;
}

#[tokio::test]
#[ignore = "needs a Postgres DATABASE_URL"]
async fn failed_replace_keeps_the_previous_collection() {
    let scratch = Scratch::open().await;
    let store = &scratch.store;

    let previous = batch("kept", 4);
    store.replace_all(&previous).await.unwrap();

    // The repeat lands in the second insert chunk, after the first chunk succeeded.
    let mut broken = batch("new", 1_200);
    broken.push(fixture("new-0", 0));
    let err = store.replace_all(&broken).await.expect_err("duplicate identity");
    assert!(matches!(err, StorageError::Database(_)));

    assert_eq!(identities(store.pool()).await, ids(&previous));

    scratch.close().await;
}

#[tokio::test]
#[ignore = "needs a Postgres DATABASE_URL"]
async fn concurrent_replaces_leave_exactly_one_collection() {
    let scratch = Scratch::open().await;
    let store = &scratch.store;

    let left = batch("left", 1_500);
    let right = batch("right", 700);
    let (a, b) = tokio::join!(store.replace_all(&left), store.replace_all(&right));
    assert_eq!(a.unwrap(), 1_500);
    assert_eq!(b.unwrap(), 700);

    let stored = identities(store.pool()).await;
    assert!(stored == ids(&left) || stored == ids(&right));

    scratch.close().await;
}
