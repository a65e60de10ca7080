//! Fixture sync pipeline: fetch, filter, enrich, rank, replace.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use matchday_adapters::{
    FixtureDirSource, ScheduleSource, SourceContext, SportsDbClient, SportsDbConfig,
    DEFAULT_BASE_URL,
};
use matchday_core::{
    is_synthetic_event_id, CanonicalChannel, ChannelClassifier, CompositeIdentity,
    EnrichedFixture, EventLookup, FixtureCandidate, PersistedFixture, RawBroadcastEntry,
    DEFAULT_FREE_TO_AIR_KEYWORDS,
};
use matchday_storage::{
    FixtureStore, InMemoryFixtureStore, PayloadArchive, PgFixtureStore, StorageError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-sync";

pub const DEFAULT_ALLOWED_COUNTRIES: &[&str] = &[
    "United Kingdom",
    "UK",
    "England",
    "Scotland",
    "Wales",
    "Northern Ireland",
];

pub const DEFAULT_ALLOWED_CHANNELS: &[&str] =
    &["Sky Sports", "TNT Sports", "Amazon Prime Video", "Terrestrial TV"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("policy file {path}: {message}")]
    Policy { path: String, message: String },
    #[error("building upstream client: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub database_url: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub policy_path: PathBuf,
    pub day_window: u32,
    pub max_fixtures: usize,
    pub day_delay: Duration,
    /// Leading days of the window that are followed by `day_delay`.
    pub polite_days: u32,
    pub lookup_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            database_url: None,
            source_dir: None,
            artifacts_dir: None,
            reports_dir: None,
            policy_path: PathBuf::from("policy.yaml"),
            day_window: 14,
            max_fixtures: 250,
            day_delay: Duration::from_millis(1000),
            polite_days: 5,
            lookup_delay: Duration::from_millis(250),
            http_timeout_secs: 20,
            user_agent: "matchday-bot/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 5 * * *".to_string(),
            web_port: 8000,
        }
    }
}

fn parse_setting<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(name).filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected true or false".to_string(),
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Ok(Self {
            api_key: text("SPORTSDB_API_KEY"),
            base_url: text("SPORTSDB_BASE_URL").unwrap_or(defaults.base_url),
            database_url: text("DATABASE_URL"),
            source_dir: text("MATCHDAY_SOURCE_DIR").map(PathBuf::from),
            artifacts_dir: text("ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: text("REPORTS_DIR").map(PathBuf::from),
            policy_path: text("MATCHDAY_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_path),
            day_window: parse_setting(&lookup, "MATCHDAY_DAY_WINDOW", defaults.day_window)?,
            max_fixtures: parse_setting(&lookup, "MATCHDAY_MAX_FIXTURES", defaults.max_fixtures)?,
            day_delay: Duration::from_millis(parse_setting(
                &lookup,
                "MATCHDAY_DAY_DELAY_MS",
                defaults.day_delay.as_millis() as u64,
            )?),
            polite_days: parse_setting(&lookup, "MATCHDAY_POLITE_DAYS", defaults.polite_days)?,
            lookup_delay: Duration::from_millis(parse_setting(
                &lookup,
                "MATCHDAY_LOOKUP_DELAY_MS",
                defaults.lookup_delay.as_millis() as u64,
            )?),
            http_timeout_secs: parse_setting(
                &lookup,
                "MATCHDAY_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            )?,
            user_agent: text("MATCHDAY_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: parse_flag(
                &lookup,
                "MATCHDAY_SCHEDULER_ENABLED",
                defaults.scheduler_enabled,
            )?,
            sync_cron: text("SYNC_CRON").unwrap_or(defaults.sync_cron),
            web_port: parse_setting(&lookup, "MATCHDAY_WEB_PORT", defaults.web_port)?,
        })
    }

    /// Pre-flight checks; nothing here touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_dir.is_none() && self.api_key.is_none() {
            return Err(ConfigError::Missing("SPORTSDB_API_KEY"));
        }
        if self.day_window == 0 {
            return Err(ConfigError::Invalid {
                name: "MATCHDAY_DAY_WINDOW",
                value: "0".into(),
                reason: "window must cover at least one day".into(),
            });
        }
        if self.max_fixtures == 0 {
            return Err(ConfigError::Invalid {
                name: "MATCHDAY_MAX_FIXTURES",
                value: "0".into(),
                reason: "maximum must be positive".into(),
            });
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "MATCHDAY_HTTP_TIMEOUT_SECS",
                value: "0".into(),
                reason: "requests must be bounded by a timeout".into(),
            });
        }
        Ok(())
    }

    pub fn build_source(&self) -> Result<Arc<dyn ScheduleSource>, ConfigError> {
        if let Some(dir) = &self.source_dir {
            return Ok(Arc::new(FixtureDirSource::new(dir.clone())));
        }
        let api_key = self
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("SPORTSDB_API_KEY"))?;
        let client = SportsDbClient::new(SportsDbConfig {
            base_url: self.base_url.clone(),
            api_key,
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
        .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Arc::new(client))
    }
}

/// Country, channel and keyword policy, loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub allowed_countries: Vec<String>,
    pub allowed_channels: Vec<String>,
    #[serde(default = "default_keywords")]
    pub free_to_air_keywords: Vec<String>,
}

fn default_keywords() -> Vec<String> {
    DEFAULT_FREE_TO_AIR_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            allowed_countries: DEFAULT_ALLOWED_COUNTRIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            allowed_channels: DEFAULT_ALLOWED_CHANNELS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            free_to_air_keywords: default_keywords(),
        }
    }
}

fn label_matches(candidate: &str, allowed: &[String]) -> bool {
    let candidate = candidate.trim();
    !candidate.is_empty()
        && allowed
            .iter()
            .any(|a| a.trim().eq_ignore_ascii_case(candidate))
}

impl SyncPolicy {
    /// A missing file yields the built-in defaults; a malformed one is an error.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let policy_err = |message: String| ConfigError::Policy {
            path: path.display().to_string(),
            message,
        };
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "policy file not found; using built-in policy");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .map_err(|e| policy_err(e.to_string()))?;
        Self::from_yaml(&text).map_err(policy_err)
    }

    pub fn from_yaml(text: &str) -> Result<Self, String> {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn allows_country(&self, country: &str) -> bool {
        label_matches(country, &self.allowed_countries)
    }

    pub fn allows_channel(&self, channel: &CanonicalChannel) -> bool {
        label_matches(channel.display_name(), &self.allowed_channels)
    }

    pub fn classifier(&self) -> ChannelClassifier {
        ChannelClassifier::new(self.free_to_air_keywords.iter().cloned())
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
}

/// Start instant by priority: combined timestamp, date + time, bare date.
/// Naive values are read as UTC.
pub fn parse_start_instant(entry: &RawBroadcastEntry) -> Option<DateTime<Utc>> {
    if let Some(dt) = entry.timestamp.as_deref().and_then(parse_timestamp) {
        return Some(dt);
    }
    let date = entry.date.as_deref();
    if let (Some(date), Some(time)) = (date, entry.time.as_deref()) {
        // Times sometimes carry an offset suffix, e.g. "15:00:00+00:00".
        if let Some(dt) = parse_timestamp(&format!("{}T{}", date.trim(), time.trim())) {
            return Some(dt);
        }
        if let (Some(d), Some(t)) = (parse_date(date), parse_time(time)) {
            return Some(d.and_time(t).and_utc());
        }
    }
    date.and_then(parse_date)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Counters for one filter pass; logged at the end of every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub seen: usize,
    pub wrong_country: usize,
    pub fallback_start: usize,
    pub duplicate: usize,
    pub past: usize,
    pub disallowed_channel: usize,
    pub kept: usize,
}

/// Identity + policy filter. Holds the run's seen-identity set, so build one per run.
#[derive(Debug)]
pub struct FilterEngine<'a> {
    policy: &'a SyncPolicy,
    classifier: ChannelClassifier,
    now: DateTime<Utc>,
    seen: HashSet<CompositeIdentity>,
    stats: FilterStats,
}

impl<'a> FilterEngine<'a> {
    pub fn new(policy: &'a SyncPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            classifier: policy.classifier(),
            now,
            seen: HashSet::new(),
            stats: FilterStats::default(),
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    pub fn accept(&mut self, entry: RawBroadcastEntry) -> Option<FixtureCandidate> {
        self.stats.seen += 1;

        let country = entry.country_label().trim().to_string();
        if !self.policy.allows_country(&country) {
            self.stats.wrong_country += 1;
            return None;
        }

        let (start_at, start_is_fallback) = match parse_start_instant(&entry) {
            Some(dt) => (dt, false),
            None => {
                self.stats.fallback_start += 1;
                debug!(event_id = ?entry.event_id, "no parseable start; using epoch fallback");
                (DateTime::UNIX_EPOCH, true)
            }
        };

        let identity = CompositeIdentity::for_entry(&entry);
        if !self.seen.insert(identity.clone()) {
            self.stats.duplicate += 1;
            return None;
        }

        if start_at < self.now {
            self.stats.past += 1;
            return None;
        }

        let title = entry.title.clone().unwrap_or_default();
        let channel = self.classifier.classify(entry.channel_label(), &title);
        if !self.policy.allows_channel(&channel) {
            self.stats.disallowed_channel += 1;
            return None;
        }

        self.stats.kept += 1;
        Some(FixtureCandidate {
            event_id: identity.event_id.clone(),
            identity,
            title,
            thumbnail: entry.thumbnail,
            start_at,
            start_is_fallback,
            channel_link: channel.deep_link(),
            channel,
            broadcast_country: country,
            sport: entry.sport,
            league: entry.league,
        })
    }

    pub fn filter(
        &mut self,
        entries: impl IntoIterator<Item = RawBroadcastEntry>,
    ) -> Vec<FixtureCandidate> {
        entries
            .into_iter()
            .filter_map(|entry| self.accept(entry))
            .collect()
    }
}

/// One-shot filter with a fresh identity set.
pub fn filter_entries(
    entries: impl IntoIterator<Item = RawBroadcastEntry>,
    now: DateTime<Utc>,
    policy: &SyncPolicy,
) -> (Vec<FixtureCandidate>, FilterStats) {
    let mut engine = FilterEngine::new(policy, now);
    let candidates = engine.filter(entries);
    (candidates, engine.stats())
}

/// Distinct lookup-able event ids in first-seen order.
pub fn distinct_event_ids(candidates: &[FixtureCandidate]) -> Vec<String> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .map(|c| c.event_id.as_str())
        .filter(|id| !is_synthetic_event_id(id))
        .filter(|id| seen.insert(*id))
        .map(ToString::to_string)
        .collect()
}

/// Overlay lookups onto candidates. Pure, so repeated merges agree.
pub fn merge_lookups(
    candidates: Vec<FixtureCandidate>,
    lookups: &HashMap<String, EventLookup>,
) -> Vec<EnrichedFixture> {
    candidates
        .into_iter()
        .map(|candidate| {
            let lookup = lookups.get(&candidate.event_id);
            let mut fixture = EnrichedFixture::from(candidate);
            if let Some(lookup) = lookup {
                fixture.apply_lookup(lookup);
            }
            fixture
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentOutcome {
    pub fixtures: Vec<EnrichedFixture>,
    pub lookups_attempted: usize,
    pub lookups_failed: usize,
    pub lookups_empty: usize,
}

/// Sequential lookups with a fixed gap between calls to protect the shared quota.
pub struct Enricher<'a> {
    source: &'a dyn ScheduleSource,
    delay: Duration,
}

impl<'a> Enricher<'a> {
    pub fn new(source: &'a dyn ScheduleSource, delay: Duration) -> Self {
        Self { source, delay }
    }

    pub async fn enrich(
        &self,
        ctx: &SourceContext,
        candidates: Vec<FixtureCandidate>,
    ) -> EnrichmentOutcome {
        let event_ids = distinct_event_ids(&candidates);
        let mut lookups = HashMap::with_capacity(event_ids.len());
        let mut outcome = EnrichmentOutcome::default();

        for (index, event_id) in event_ids.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            outcome.lookups_attempted += 1;
            match self.source.lookup_event(ctx, event_id).await {
                Ok(Some(lookup)) => {
                    lookups.insert(event_id.clone(), lookup);
                }
                Ok(None) => {
                    outcome.lookups_empty += 1;
                    debug!(event_id = %event_id, "lookup returned no record");
                }
                Err(failure) => {
                    outcome.lookups_failed += 1;
                    warn!(
                        event_id = %failure.event_id,
                        error = %failure.reason,
                        "event lookup failed; keeping base values"
                    );
                }
            }
        }

        outcome.fixtures = merge_lookups(candidates, &lookups);
        outcome
    }
}

/// Ascending by start (stable, so ties keep insertion order), capped at `max_count`.
pub fn rank(mut fixtures: Vec<EnrichedFixture>, max_count: usize) -> Vec<EnrichedFixture> {
    fixtures.sort_by_key(EnrichedFixture::start_at);
    fixtures.truncate(max_count);
    fixtures
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching { day_index: u32 },
    Filtering,
    Enriching,
    Ranking,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Fetching { day_index } => write!(f, "fetching(day {day_index})"),
            Self::Filtering => f.write_str("filtering"),
            Self::Enriching => f.write_str("enriching"),
            Self::Ranking => f.write_str("ranking"),
            Self::Persisting => f.write_str("persisting"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub days_requested: u32,
    pub failed_days: Vec<NaiveDate>,
    pub raw_entries: usize,
    pub filter: FilterStats,
    pub lookups_attempted: usize,
    pub lookups_failed: usize,
    /// Lookups that succeeded but carried no event.
    pub lookups_empty: usize,
    pub persisted: usize,
}

#[derive(Serialize)]
struct RunReport<'a> {
    summary: &'a SyncRunSummary,
    fixtures: &'a [PersistedFixture],
}

pub struct SyncPipeline {
    config: SyncConfig,
    policy: SyncPolicy,
    source: Option<Arc<dyn ScheduleSource>>,
    store: Arc<dyn FixtureStore>,
    archive: Option<PayloadArchive>,
    run_gate: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, policy: SyncPolicy, store: Arc<dyn FixtureStore>) -> Self {
        let archive = config.artifacts_dir.clone().map(PayloadArchive::new);
        Self {
            config,
            policy,
            source: None,
            store,
            archive,
            run_gate: Mutex::new(()),
        }
    }

    /// Use `source` instead of building one from configuration on each run.
    pub fn with_source(mut self, source: Arc<dyn ScheduleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn FixtureStore> {
        Arc::clone(&self.store)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, RunError> {
        self.run_at(Utc::now()).await
    }

    /// Run the whole pipeline as of `now`. Overlapping calls fail fast.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, RunError> {
        let _gate = self
            .run_gate
            .try_lock()
            .map_err(|_| RunError::AlreadyRunning)?;

        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        let result = self.execute(run_id, now).instrument(span.clone()).await;
        span.in_scope(|| match &result {
            Ok(summary) => info!(
                phase = %RunPhase::Done,
                persisted = summary.persisted,
                failed_days = summary.failed_days.len(),
                lookups_failed = summary.lookups_failed,
                lookups_empty = summary.lookups_empty,
                "sync run finished"
            ),
            Err(err) => warn!(phase = %RunPhase::Failed, error = %err, "sync run failed"),
        });
        result
    }

    async fn execute(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<SyncRunSummary, RunError> {
        debug!(phase = %RunPhase::Idle, "pre-flight");
        self.config.validate()?;
        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => self.config.build_source()?,
        };

        let started_at = Utc::now();
        let ctx = SourceContext {
            run_id,
            fetched_at: started_at,
        };

        let (raw, failed_days) = self.fetch_window(source.as_ref(), &ctx, now).await;
        let raw_entries = raw.len();

        debug!(phase = %RunPhase::Filtering, raw_entries, "filtering");
        let (candidates, filter) = filter_entries(raw, now, &self.policy);
        info!(?filter, "filtered listings");

        debug!(phase = %RunPhase::Enriching, candidates = candidates.len(), "enriching");
        let enrichment = Enricher::new(source.as_ref(), self.config.lookup_delay)
            .enrich(&ctx, candidates)
            .await;

        debug!(phase = %RunPhase::Ranking, "ranking");
        let ranked = rank(enrichment.fixtures, self.config.max_fixtures);
        let persisted: Vec<PersistedFixture> = ranked.iter().map(PersistedFixture::from).collect();

        debug!(
            phase = %RunPhase::Persisting,
            fixtures = persisted.len(),
            "replacing fixture store"
        );
        let written = self.store.replace_all(&persisted).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            days_requested: self.config.day_window,
            failed_days,
            raw_entries,
            filter,
            lookups_attempted: enrichment.lookups_attempted,
            lookups_failed: enrichment.lookups_failed,
            lookups_empty: enrichment.lookups_empty,
            persisted: written,
        };

        if let Some(dir) = &self.config.reports_dir {
            if let Err(err) = write_run_report(dir, &summary, &persisted).await {
                warn!(error = %err, "writing run report failed");
            }
        }

        Ok(summary)
    }

    /// Fetch every day in the window; failed days are logged and skipped.
    async fn fetch_window(
        &self,
        source: &dyn ScheduleSource,
        ctx: &SourceContext,
        now: DateTime<Utc>,
    ) -> (Vec<RawBroadcastEntry>, Vec<NaiveDate>) {
        let today = now.date_naive();
        let window = self.config.day_window;
        let mut raw = Vec::new();
        let mut failed_days = Vec::new();

        for day_index in 0..window {
            let Some(day) = today.checked_add_days(Days::new(u64::from(day_index))) else {
                break;
            };
            debug!(phase = %RunPhase::Fetching { day_index }, %day, "fetching day");

            match source.fetch_day(ctx, day).await {
                Ok(fetched) => {
                    debug!(%day, entries = fetched.entries.len(), "fetched day");
                    self.archive_day(ctx, source.source_id(), day, &fetched.body)
                        .await;
                    raw.extend(fetched.entries);
                }
                Err(failure) => {
                    warn!(
                        day = %failure.day,
                        error = %failure.reason,
                        "day fetch failed; skipping"
                    );
                    failed_days.push(failure.day);
                }
            }

            let more_days = day_index + 1 < window;
            if more_days
                && day_index < self.config.polite_days
                && !self.config.day_delay.is_zero()
            {
                tokio::time::sleep(self.config.day_delay).await;
            }
        }

        (raw, failed_days)
    }

    async fn archive_day(
        &self,
        ctx: &SourceContext,
        source_id: &str,
        day: NaiveDate,
        body: &[u8],
    ) {
        let Some(archive) = &self.archive else {
            return;
        };
        let label = format!("{source_id}-{}", day.format("%Y-%m-%d"));
        match archive.archive(ctx.fetched_at, &label, body).await {
            Ok(stored) => debug!(
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "archived day payload"
            ),
            Err(err) => warn!(%day, error = %err, "archiving day payload failed"),
        }
    }
}

async fn write_run_report(
    reports_dir: &Path,
    summary: &SyncRunSummary,
    fixtures: &[PersistedFixture],
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let bytes = serde_json::to_vec_pretty(&RunReport { summary, fixtures })
        .context("serializing run report")?;
    let path = run_dir.join("run_report.json");
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Assemble a pipeline from configuration. `dry_run` keeps fixtures in memory.
pub async fn pipeline_from_config(
    config: SyncConfig,
    dry_run: bool,
) -> Result<SyncPipeline, RunError> {
    let policy = SyncPolicy::load(&config.policy_path).await?;
    let store: Arc<dyn FixtureStore> = if dry_run {
        Arc::new(InMemoryFixtureStore::new())
    } else {
        let url = config
            .database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        Arc::new(PgFixtureStore::connect_lazy(url)?)
    };
    Ok(SyncPipeline::new(config, policy, store))
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<SyncRunSummary, RunError> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(config, dry_run).await?;
    pipeline.run_once().await
}

/// Cron job that drives the same entry point as the HTTP trigger.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    persisted = summary.persisted,
                    "scheduled sync complete"
                ),
                Err(RunError::AlreadyRunning) => {
                    info!("scheduled sync skipped; a run is in progress")
                }
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
