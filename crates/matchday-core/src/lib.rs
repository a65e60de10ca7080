//! Core domain model and channel classification for Matchday.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchday-core";

/// Title keywords for tournaments that air free-to-air when no broadcaster is listed.
pub const DEFAULT_FREE_TO_AIR_KEYWORDS: &[&str] = &[
    "six nations",
    "wimbledon",
    "grand national",
    "the boat race",
    "fa cup",
];

/// One row of one day's upstream TV listing, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawBroadcastEntry {
    pub event_id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub timestamp: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub channel: Option<String>,
    pub country: Option<String>,
    pub sport: Option<String>,
    pub league: Option<String>,
}

impl RawBroadcastEntry {
    pub fn channel_label(&self) -> &str {
        self.channel.as_deref().unwrap_or_default()
    }

    pub fn country_label(&self) -> &str {
        self.country.as_deref().unwrap_or_default()
    }

    /// Upstream event id, or a stable synthetic id derived from the title and every start field.
    pub fn resolved_event_id(&self) -> String {
        match self.event_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => synthetic_event_id(
                self.title.as_deref().unwrap_or_default(),
                self.timestamp.as_deref().unwrap_or_default(),
                self.date.as_deref().unwrap_or_default(),
                self.time.as_deref().unwrap_or_default(),
            ),
        }
    }
}

const SYNTHETIC_ID_PREFIX: &str = "synthetic-";

/// Escape `\` and `|` so joined components cannot collide.
fn push_component(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == '\\' || c == '|' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn join_components(parts: &[&str]) -> String {
    let mut out = String::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            out.push('|');
        }
        push_component(&mut out, part);
    }
    out
}

pub fn synthetic_event_id(title: &str, timestamp: &str, date: &str, time: &str) -> String {
    let source = join_components(&[title.trim(), timestamp.trim(), date.trim(), time.trim()]);
    format!(
        "{SYNTHETIC_ID_PREFIX}{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
    )
}

/// Synthetic ids have no upstream record to look up.
pub fn is_synthetic_event_id(event_id: &str) -> bool {
    event_id.starts_with(SYNTHETIC_ID_PREFIX)
}

/// Closed set of broadcaster identities used for filtering and linking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label")]
pub enum CanonicalChannel {
    SkySports,
    TntSports,
    AmazonPrime,
    Terrestrial,
    Other(String),
}

impl CanonicalChannel {
    pub const OTHER_DISPLAY_NAME: &'static str = "Other";

    pub fn display_name(&self) -> &str {
        match self {
            Self::SkySports => "Sky Sports",
            Self::TntSports => "TNT Sports",
            Self::AmazonPrime => "Amazon Prime Video",
            Self::Terrestrial => "Terrestrial TV",
            Self::Other(label) => label,
        }
    }

    pub fn deep_link(&self) -> String {
        match self {
            Self::SkySports => "/channels/sky-sports".to_string(),
            Self::TntSports => "/channels/tnt-sports".to_string(),
            Self::AmazonPrime => "/amazon-prime-pubs".to_string(),
            Self::Terrestrial => "/free-to-air-pubs".to_string(),
            Self::Other(label) => {
                let encoded: String =
                    url::form_urlencoded::byte_serialize(label.as_bytes()).collect();
                format!("/pubs?feature={encoded}")
            }
        }
    }
}

impl fmt::Display for CanonicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Maps free-text broadcaster labels onto [`CanonicalChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClassifier {
    free_to_air_keywords: Vec<String>,
}

impl Default for ChannelClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_FREE_TO_AIR_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl ChannelClassifier {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            free_to_air_keywords: keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, raw_label: &str, event_title: &str) -> CanonicalChannel {
        let label = raw_label.trim();
        if label.is_empty() {
            let title = event_title.to_lowercase();
            if self
                .free_to_air_keywords
                .iter()
                .any(|keyword| title.contains(keyword.as_str()))
            {
                return CanonicalChannel::Terrestrial;
            }
            return CanonicalChannel::Other(CanonicalChannel::OTHER_DISPLAY_NAME.to_string());
        }

        let lower = label.to_lowercase();
        if lower.contains("sky") {
            CanonicalChannel::SkySports
        } else if lower.contains("tnt") || lower.contains("bt sport") {
            CanonicalChannel::TntSports
        } else if lower.contains("amazon") {
            CanonicalChannel::AmazonPrime
        } else if ["bbc", "itv", "channel 4", "terrestrial"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            CanonicalChannel::Terrestrial
        } else {
            CanonicalChannel::Other(label.to_string())
        }
    }
}

/// Classify with the built-in free-to-air keyword list.
pub fn classify_channel(raw_label: &str, event_title: &str) -> CanonicalChannel {
    ChannelClassifier::default().classify(raw_label, event_title)
}

/// Deduplication key: one event may air on several channels and country labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeIdentity {
    pub event_id: String,
    pub channel_label: String,
    pub country_label: String,
}

impl CompositeIdentity {
    pub fn for_entry(entry: &RawBroadcastEntry) -> Self {
        Self {
            event_id: entry.resolved_event_id(),
            channel_label: entry.channel_label().to_string(),
            country_label: entry.country_label().to_string(),
        }
    }
}

/// `event|channel|country`, with `|` and `\` escaped inside each component.
impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_components(&[
            self.event_id.as_str(),
            self.channel_label.as_str(),
            self.country_label.as_str(),
        ]))
    }
}

/// A listing that survived policy filtering, with a resolved start and channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureCandidate {
    pub identity: CompositeIdentity,
    pub event_id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub start_at: DateTime<Utc>,
    /// Set when no date field parsed and `start_at` is the epoch fallback.
    pub start_is_fallback: bool,
    pub channel: CanonicalChannel,
    pub channel_link: String,
    pub broadcast_country: String,
    pub sport: Option<String>,
    pub league: Option<String>,
}

/// Authoritative metadata for one event from the secondary lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventLookup {
    pub league: Option<String>,
    pub sport: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFixture {
    pub candidate: FixtureCandidate,
    pub league: Option<String>,
    pub sport: Option<String>,
    pub country: Option<String>,
}

impl From<FixtureCandidate> for EnrichedFixture {
    fn from(candidate: FixtureCandidate) -> Self {
        Self {
            league: candidate.league.clone(),
            sport: candidate.sport.clone(),
            country: Some(candidate.broadcast_country.clone()),
            candidate,
        }
    }
}

fn overwrite_if_present(field: &mut Option<String>, value: Option<&String>) {
    if let Some(value) = value {
        *field = Some(value.clone());
    }
}

impl EnrichedFixture {
    /// Overlay lookup values; `None` fields leave the current value untouched.
    pub fn apply_lookup(&mut self, lookup: &EventLookup) {
        overwrite_if_present(&mut self.league, lookup.league.as_ref());
        overwrite_if_present(&mut self.sport, lookup.sport.as_ref());
        overwrite_if_present(&mut self.country, lookup.country.as_ref());
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.candidate.start_at
    }
}

/// Storage-layer row; the whole collection is replaced on each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFixture {
    pub identity: String,
    pub event_id: String,
    pub title: String,
    pub sport: Option<String>,
    pub league: Option<String>,
    pub thumbnail: Option<String>,
    pub start_at: DateTime<Utc>,
    pub channel: String,
    pub channel_link: String,
    pub country: Option<String>,
    pub broadcast_country: String,
}

impl From<&EnrichedFixture> for PersistedFixture {
    fn from(fixture: &EnrichedFixture) -> Self {
        let candidate = &fixture.candidate;
        Self {
            identity: candidate.identity.to_string(),
            event_id: candidate.event_id.clone(),
            title: candidate.title.clone(),
            sport: fixture.sport.clone(),
            league: fixture.league.clone(),
            thumbnail: candidate.thumbnail.clone(),
            start_at: candidate.start_at,
            channel: candidate.channel.display_name().to_string(),
            channel_link: candidate.channel_link.clone(),
            country: fixture.country.clone(),
            broadcast_country: candidate.broadcast_country.clone(),
        }
    }
}
