//! HTTP fetch, raw payload archive and fixture persistence for Matchday.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchday_core::PersistedFixture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw upstream bodies, kept for replaying bad days.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source)
            .join(format!("{content_hash}.json"))
    }

    /// Write `bytes` once per content hash, via temp file + rename.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Header name and value sent with every request, e.g. `X-API-KEY`.
    pub api_key_header: Option<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_key_header: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot GET client: one attempt per call, bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some((name, value)) = &config.api_key_header {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::Config(format!("header name {name:?}: {e}")))?;
            let mut value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::Config(format!("api key header value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client })
    }

    /// Body of a successful response; any non-2xx status is an error.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("fixture store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted fixture collection with replace-the-world semantics.
#[async_trait]
pub trait FixtureStore: Send + Sync {
    /// Delete every stored fixture and insert `fixtures` as one unit of work.
    async fn replace_all(&self, fixtures: &[PersistedFixture]) -> Result<usize, StorageError>;

    /// Read path for downstream consumers, ascending by start.
    async fn list_upcoming(&self, limit: usize) -> Result<Vec<PersistedFixture>, StorageError>;
}

/// Serializes replaces across processes sharing one database.
const REPLACE_LOCK_KEY: i64 = 0x6d61_7463_6864_6179;

// 11 bind parameters per row keeps each statement well under the 65535 limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgFixtureStore {
    pool: PgPool,
}

impl PgFixtureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool without touching the network; connections open on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn delete_all(conn: &mut PgConnection) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM fixtures").execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn bulk_insert(
        conn: &mut PgConnection,
        fixtures: &[PersistedFixture],
    ) -> Result<usize, StorageError> {
        let mut inserted = 0usize;
        for chunk in fixtures.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fixtures (identity, event_id, title, sport, league, thumbnail, \
                 start_at, channel, channel_link, country, broadcast_country) ",
            );
            builder.push_values(chunk, |mut row, f| {
                row.push_bind(&f.identity)
                    .push_bind(&f.event_id)
                    .push_bind(&f.title)
                    .push_bind(&f.sport)
                    .push_bind(&f.league)
                    .push_bind(&f.thumbnail)
                    .push_bind(f.start_at)
                    .push_bind(&f.channel)
                    .push_bind(&f.channel_link)
                    .push_bind(&f.country)
                    .push_bind(&f.broadcast_country);
            });
            let result = builder.build().execute(&mut *conn).await?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl FixtureStore for PgFixtureStore {
    async fn replace_all(&self, fixtures: &[PersistedFixture]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(REPLACE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let deleted = Self::delete_all(&mut *tx).await?;
        let inserted = Self::bulk_insert(&mut *tx, fixtures).await?;
        tx.commit().await?;

        debug!(deleted, inserted, "replaced fixture collection");
        Ok(inserted)
    }

    async fn list_upcoming(&self, limit: usize) -> Result<Vec<PersistedFixture>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT identity, event_id, title, sport, league, thumbnail,
                   start_at, channel, channel_link, country, broadcast_country
              FROM fixtures
             ORDER BY start_at ASC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PersistedFixture {
                identity: row.try_get("identity")?,
                event_id: row.try_get("event_id")?,
                title: row.try_get("title")?,
                sport: row.try_get("sport")?,
                league: row.try_get("league")?,
                thumbnail: row.try_get("thumbnail")?,
                start_at: row.try_get("start_at")?,
                channel: row.try_get("channel")?,
                channel_link: row.try_get("channel_link")?,
                country: row.try_get("country")?,
                broadcast_country: row.try_get("broadcast_country")?,
            });
        }
        Ok(out)
    }
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryFixtureStore {
    fixtures: RwLock<Vec<PersistedFixture>>,
}

impl InMemoryFixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixtures(fixtures: Vec<PersistedFixture>) -> Self {
        Self {
            fixtures: RwLock::new(fixtures),
        }
    }

    pub async fn snapshot(&self) -> Vec<PersistedFixture> {
        self.fixtures.read().await.clone()
    }
}

#[async_trait]
impl FixtureStore for InMemoryFixtureStore {
    async fn replace_all(&self, fixtures: &[PersistedFixture]) -> Result<usize, StorageError> {
        let mut guard = self.fixtures.write().await;
        *guard = fixtures.to_vec();
        Ok(guard.len())
    }

    async fn list_upcoming(&self, limit: usize) -> Result<Vec<PersistedFixture>, StorageError> {
        let mut fixtures = self.fixtures.read().await.clone();
        fixtures.sort_by_key(|f| f.start_at);
        fixtures.truncate(limit);
        Ok(fixtures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fixture(identity: &str, hour: u32) -> PersistedFixture {
        PersistedFixture {
            identity: identity.to_string(),
            event_id: identity.to_string(),
            title: format!("Event {identity}"),
            sport: Some("Football".into()),
            league: None,
            thumbnail: None,
            start_at: Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).single().unwrap(),
            channel: "Sky Sports".into(),
            channel_link: "/channels/sky-sports".into(),
            country: Some("England".into()),
            broadcast_country: "United Kingdom".into(),
        }
    }

    #[test]
    fn payload_hashing_is_stable() {
        let hash = PayloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_bodies() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-14T05:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(fetched_at, "tv-day-2026-03-14", br#"{"filter":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive(fetched_at, "tv-day-2026-03-14", br#"{"filter":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn api_key_header_must_be_valid() {
        let err = HttpFetcher::new(HttpClientConfig {
            api_key_header: Some(("X-API-KEY".into(), "bad\nkey".into())),
            ..Default::default()
        })
        .expect_err("newline is not a valid header value");
        assert!(matches!(err, FetchError::Config(_)));
    }

    #[tokio::test]
    async fn in_memory_replace_drops_previous_run() {
        let store = InMemoryFixtureStore::with_fixtures(vec![fixture("stale", 9)]);
        let written = store
            .replace_all(&[fixture("b", 18), fixture("a", 12)])
            .await
            .expect("replace");
        assert_eq!(written, 2);

        let listed = store.list_upcoming(10).await.expect("list");
        let ids: Vec<_> = listed.iter().map(|f| f.identity.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        store.replace_all(&[]).await.expect("empty replace");
        assert!(store.snapshot().await.is_empty());
    }
}
