//! Upstream schedule source contracts + live and fixture-directory implementations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use matchday_core::{EventLookup, RawBroadcastEntry};
use matchday_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.thesportsdb.com/api/v2/json";
pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One day's listing plus the body it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDay {
    pub day: NaiveDate,
    pub entries: Vec<RawBroadcastEntry>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FailureReason {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("empty response body")]
    EmptyBody,
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("reading {path}: {message}")]
    Io { path: String, message: String },
}

/// A skipped day. Recoverable: the run continues with the remaining days.
#[derive(Debug, Error)]
#[error("day {day} failed: {reason}")]
pub struct DayFetchFailure {
    pub day: NaiveDate,
    #[source]
    pub reason: FailureReason,
}

/// A failed enrichment lookup. Recoverable: the event keeps its base values.
#[derive(Debug, Error)]
#[error("lookup for event {event_id} failed: {reason}")]
pub struct LookupFailure {
    pub event_id: String,
    #[source]
    pub reason: FailureReason,
}

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_day(
        &self,
        ctx: &SourceContext,
        day: NaiveDate,
    ) -> Result<FetchedDay, DayFetchFailure>;

    /// `Ok(None)` when the upstream has no record for `event_id`.
    async fn lookup_event(
        &self,
        ctx: &SourceContext,
        event_id: &str,
    ) -> Result<Option<EventLookup>, LookupFailure>;
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Upstream ids arrive as strings or bare numbers depending on the endpoint.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => text_or_none(&s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct TvDayResponse {
    filter: Option<Vec<TvListing>>,
}

#[derive(Debug, Deserialize)]
struct TvListing {
    #[serde(rename = "idEvent", default, deserialize_with = "lenient_string")]
    id_event: Option<String>,
    #[serde(rename = "strEvent", default, deserialize_with = "lenient_string")]
    event: Option<String>,
    #[serde(
        rename = "strEventThumb",
        alias = "strThumb",
        default,
        deserialize_with = "lenient_string"
    )]
    thumb: Option<String>,
    #[serde(
        rename = "strTimeStamp",
        alias = "strTimestamp",
        default,
        deserialize_with = "lenient_string"
    )]
    timestamp: Option<String>,
    #[serde(rename = "dateEvent", default, deserialize_with = "lenient_string")]
    date: Option<String>,
    #[serde(rename = "strTime", default, deserialize_with = "lenient_string")]
    time: Option<String>,
    #[serde(rename = "strChannel", default, deserialize_with = "lenient_string")]
    channel: Option<String>,
    #[serde(rename = "strCountry", default, deserialize_with = "lenient_string")]
    country: Option<String>,
    #[serde(rename = "strSport", default, deserialize_with = "lenient_string")]
    sport: Option<String>,
    #[serde(rename = "strLeague", default, deserialize_with = "lenient_string")]
    league: Option<String>,
}

impl From<TvListing> for RawBroadcastEntry {
    fn from(listing: TvListing) -> Self {
        Self {
            event_id: listing.id_event,
            title: listing.event,
            thumbnail: listing.thumb,
            timestamp: listing.timestamp,
            date: listing.date,
            time: listing.time,
            channel: listing.channel,
            country: listing.country,
            sport: listing.sport,
            league: listing.league,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    lookup: Option<Vec<LookupRecord>>,
}

#[derive(Debug, Deserialize)]
struct LookupRecord {
    #[serde(rename = "strLeague", default, deserialize_with = "lenient_string")]
    league: Option<String>,
    #[serde(rename = "strSport", default, deserialize_with = "lenient_string")]
    sport: Option<String>,
    #[serde(rename = "strCountry", default, deserialize_with = "lenient_string")]
    country: Option<String>,
}

/// Parse a `{ "filter": [...] }` day body. A null or missing `filter` is malformed.
pub fn parse_day_body(body: &[u8]) -> Result<Vec<RawBroadcastEntry>, FailureReason> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FailureReason::EmptyBody);
    }
    let parsed: TvDayResponse =
        serde_json::from_slice(body).map_err(|e| FailureReason::Malformed(e.to_string()))?;
    let listings = parsed
        .filter
        .ok_or_else(|| FailureReason::Malformed("missing `filter` array".to_string()))?;
    Ok(listings.into_iter().map(RawBroadcastEntry::from).collect())
}

/// Parse a `{ "lookup": [...] }` body, keeping only the first record.
pub fn parse_lookup_body(body: &[u8]) -> Result<Option<EventLookup>, FailureReason> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FailureReason::EmptyBody);
    }
    let parsed: LookupResponse =
        serde_json::from_slice(body).map_err(|e| FailureReason::Malformed(e.to_string()))?;
    Ok(parsed
        .lookup
        .and_then(|records| records.into_iter().next())
        .map(|record| EventLookup {
            league: record.league,
            sport: record.sport,
            country: record.country,
        }))
}

#[derive(Clone)]
pub struct SportsDbConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl fmt::Debug for SportsDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SportsDbConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Live client for the schedule and lookup endpoints.
#[derive(Debug, Clone)]
pub struct SportsDbClient {
    http: HttpFetcher,
    base_url: String,
}

impl SportsDbClient {
    pub fn new(config: SportsDbConfig) -> Result<Self, FetchError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent,
            api_key_header: Some((API_KEY_HEADER.to_string(), config.api_key)),
        })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn day_url(&self, day: NaiveDate) -> String {
        format!("{}/filter/tv/day/{}", self.base_url, day.format("%Y-%m-%d"))
    }

    pub fn lookup_url(&self, event_id: &str) -> String {
        format!("{}/lookup/event/{}", self.base_url, event_id)
    }
}

#[async_trait]
impl ScheduleSource for SportsDbClient {
    fn source_id(&self) -> &'static str {
        "sportsdb"
    }

    async fn fetch_day(
        &self,
        ctx: &SourceContext,
        day: NaiveDate,
    ) -> Result<FetchedDay, DayFetchFailure> {
        let fail = |reason: FailureReason| DayFetchFailure { day, reason };
        let body = self
            .http
            .fetch_bytes(ctx.run_id, &self.day_url(day))
            .await
            .map_err(|e| fail(e.into()))?;
        let entries = parse_day_body(&body).map_err(fail)?;
        Ok(FetchedDay { day, entries, body })
    }

    async fn lookup_event(
        &self,
        ctx: &SourceContext,
        event_id: &str,
    ) -> Result<Option<EventLookup>, LookupFailure> {
        let fail = |reason: FailureReason| LookupFailure {
            event_id: event_id.to_string(),
            reason,
        };
        let body = self
            .http
            .fetch_bytes(ctx.run_id, &self.lookup_url(event_id))
            .await
            .map_err(|e| fail(e.into()))?;
        parse_lookup_body(&body).map_err(fail)
    }
}

/// Offline source reading `day/<YYYY-MM-DD>.json` and `lookup/<id>.json` under a root.
#[derive(Debug, Clone)]
pub struct FixtureDirSource {
    root: PathBuf,
}

impl FixtureDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.root
            .join("day")
            .join(format!("{}.json", day.format("%Y-%m-%d")))
    }

    /// `None` for ids that would resolve outside `lookup/`.
    pub fn lookup_path(&self, event_id: &str) -> Option<PathBuf> {
        let id = event_id.trim();
        if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\']) {
            return None;
        }
        Some(self.root.join("lookup").join(format!("{id}.json")))
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, FailureReason> {
    fs::read(path).await.map_err(|e| FailureReason::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ScheduleSource for FixtureDirSource {
    fn source_id(&self) -> &'static str {
        "fixture-dir"
    }

    async fn fetch_day(
        &self,
        _ctx: &SourceContext,
        day: NaiveDate,
    ) -> Result<FetchedDay, DayFetchFailure> {
        let fail = |reason: FailureReason| DayFetchFailure { day, reason };
        let body = read_file(&self.day_path(day)).await.map_err(fail)?;
        let entries = parse_day_body(&body).map_err(fail)?;
        Ok(FetchedDay { day, entries, body })
    }

    async fn lookup_event(
        &self,
        _ctx: &SourceContext,
        event_id: &str,
    ) -> Result<Option<EventLookup>, LookupFailure> {
        let fail = |reason: FailureReason| LookupFailure {
            event_id: event_id.to_string(),
            reason,
        };
        let path = self
            .lookup_path(event_id)
            .ok_or_else(|| fail(FailureReason::Malformed("event id is not a file name".into())))?;
        let exists = fs::try_exists(&path).await.map_err(|e| {
            fail(FailureReason::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })?;
        if !exists {
            return Ok(None);
        }
        let body = read_file(&path).await.map_err(fail)?;
        parse_lookup_body(&body).map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SourceContext {
        SourceContext {
            run_id: Uuid::nil(),
            fetched_at: DateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn day_body_maps_wire_fields() {
        let body = br#"{"filter":[{
            "idEvent": 2070001,
            "strEvent": "Arsenal vs Chelsea",
            "strEventThumb": "https://img.example/a.jpg",
            "strTimeStamp": "2026-03-14T17:30:00",
            "dateEvent": "2026-03-14",
            "strTime": "17:30:00",
            "strChannel": "Sky Sports Main Event",
            "strCountry": "United Kingdom",
            "strSport": "Soccer"
        }]}"#;
        let entries = parse_day_body(body).expect("parse");
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.event_id.as_deref(), Some("2070001"));
        assert_eq!(entry.title.as_deref(), Some("Arsenal vs Chelsea"));
        assert_eq!(entry.timestamp.as_deref(), Some("2026-03-14T17:30:00"));
        assert_eq!(entry.channel.as_deref(), Some("Sky Sports Main Event"));
        assert_eq!(entry.league, None);
    }

    #[test]
    fn blank_strings_become_none() {
        let body = br#"{"filter":[{"idEvent":"7","strChannel":"  ","strThumb":null}]}"#;
        let entries = parse_day_body(body).expect("parse");
        assert_eq!(entries[0].channel, None);
        assert_eq!(entries[0].thumbnail, None);
    }

    #[test]
    fn empty_and_malformed_day_bodies_are_failures() {
        assert!(matches!(parse_day_body(b""), Err(FailureReason::EmptyBody)));
        assert!(matches!(parse_day_body(b"  \n"), Err(FailureReason::EmptyBody)));
        assert!(matches!(
            parse_day_body(b"<html>busy</html>"),
            Err(FailureReason::Malformed(_))
        ));
        assert!(matches!(
            parse_day_body(br#"{"filter":null}"#),
            Err(FailureReason::Malformed(_))
        ));
        assert!(parse_day_body(br#"{"filter":[]}"#).expect("empty day").is_empty());
    }

    #[test]
    fn lookup_uses_first_record_only() {
        let body = br#"{"lookup":[
            {"strLeague":null,"strSport":"Football","strCountry":"England"},
            {"strLeague":"Ignored","strSport":"Ignored"}
        ]}"#;
        let lookup = parse_lookup_body(body).expect("parse").expect("record");
        assert_eq!(lookup.league, None);
        assert_eq!(lookup.sport.as_deref(), Some("Football"));
        assert_eq!(lookup.country.as_deref(), Some("England"));

        assert_eq!(parse_lookup_body(br#"{"lookup":[]}"#).expect("parse"), None);
        assert_eq!(parse_lookup_body(br#"{"lookup":null}"#).expect("parse"), None);
    }

    #[test]
    fn client_builds_endpoint_urls() {
        let client = SportsDbClient::new(SportsDbConfig {
            base_url: "https://api.example/v2/json/".into(),
            api_key: "k".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .expect("client");
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(
            client.day_url(day),
            "https://api.example/v2/json/filter/tv/day/2026-03-14"
        );
        assert_eq!(
            client.lookup_url("2070001"),
            "https://api.example/v2/json/lookup/event/2070001"
        );
    }

    #[tokio::test]
    async fn fixture_dir_reads_days_and_lookups() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("day")).unwrap();
        std::fs::create_dir_all(dir.path().join("lookup")).unwrap();
        std::fs::write(
            dir.path().join("day/2026-03-14.json"),
            br#"{"filter":[{"idEvent":"1","strChannel":"BBC One","strCountry":"United Kingdom"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("lookup/1.json"),
            br#"{"lookup":[{"strLeague":"Six Nations"}]}"#,
        )
        .unwrap();

        let source = FixtureDirSource::new(dir.path());
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let fetched = source.fetch_day(&ctx(), day).await.expect("day");
        assert_eq!(fetched.entries.len(), 1);

        let missing_day = day.succ_opt().unwrap();
        let failure = source.fetch_day(&ctx(), missing_day).await.expect_err("missing");
        assert_eq!(failure.day, missing_day);
        assert!(matches!(failure.reason, FailureReason::Io { .. }));

        let lookup = source.lookup_event(&ctx(), "1").await.expect("lookup");
        assert_eq!(lookup.and_then(|l| l.league).as_deref(), Some("Six Nations"));
        assert_eq!(source.lookup_event(&ctx(), "2").await.expect("none"), None);
    }

    #[tokio::test]
    async fn fixture_dir_rejects_ids_outside_lookup_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("lookup")).unwrap();
        std::fs::write(dir.path().join("secret.json"), br#"{"lookup":[{"strLeague":"x"}]}"#)
            .unwrap();
        let source = FixtureDirSource::new(dir.path());

        assert_eq!(source.lookup_path("../secret"), None);
        assert_eq!(source.lookup_path(".."), None);
        assert_eq!(source.lookup_path("a..b"), None);
        assert_eq!(source.lookup_path("  "), None);
        assert_eq!(source.lookup_path(r"a\b"), None);
        assert!(source.lookup_path("2070001").is_some());

        let failure = source
            .lookup_event(&ctx(), "../secret")
            .await
            .expect_err("traversal");
        assert_eq!(failure.event_id, "../secret");
        assert!(matches!(failure.reason, FailureReason::Malformed(_)));
    }
}
