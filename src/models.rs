//! Entities tracked by mediacheck, in the shape the remote API exchanges them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Point in time as epoch milliseconds.
///
/// Comparisons happen on the integer; the RFC 3339 text form only exists at
/// the API and store boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// A mutation timestamp strictly after `previous`, even if the wall clock
    /// has not moved (or went backwards).
    pub fn next_after(previous: Option<Timestamp>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if prev >= now => Timestamp(prev.0 + 1),
            _ => now,
        }
    }

    pub fn to_rfc3339(self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl FromStr for Timestamp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Timestamp(dt.timestamp_millis()));
        }
        // Naive forms are taken as UTC
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(Timestamp(naive.and_utc().timestamp_millis()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Timestamp(midnight.and_utc().timestamp_millis()));
            }
        }
        Err(format!("invalid timestamp: {s}"))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Cinema,
    Series,
    Manga,
    Music,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Cinema => write!(f, "cinema"),
            MediaType::Series => write!(f, "series"),
            MediaType::Manga => write!(f, "manga"),
            MediaType::Music => write!(f, "music"),
        }
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cinema" | "film" | "movie" => Ok(MediaType::Cinema),
            "series" | "tv" => Ok(MediaType::Series),
            "manga" => Ok(MediaType::Manga),
            "music" => Ok(MediaType::Music),
            _ => Err(anyhow::anyhow!("Unknown media type: {}", s)),
        }
    }
}

/// Personal consumption state. Encoded as 0..=3 on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConsumptionState {
    #[default]
    Check,
    Checked,
    Viewing,
    Done,
}

impl TryFrom<u8> for ConsumptionState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConsumptionState::Check),
            1 => Ok(ConsumptionState::Checked),
            2 => Ok(ConsumptionState::Viewing),
            3 => Ok(ConsumptionState::Done),
            other => Err(format!("invalid consumption state: {other}")),
        }
    }
}

impl From<ConsumptionState> for u8 {
    fn from(state: ConsumptionState) -> Self {
        match state {
            ConsumptionState::Check => 0,
            ConsumptionState::Checked => 1,
            ConsumptionState::Viewing => 2,
            ConsumptionState::Done => 3,
        }
    }
}

impl fmt::Display for ConsumptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumptionState::Check => write!(f, "CHECK"),
            ConsumptionState::Checked => write!(f, "CHECKED"),
            ConsumptionState::Viewing => write!(f, "VIEWING"),
            ConsumptionState::Done => write!(f, "DONE"),
        }
    }
}

impl FromStr for ConsumptionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "check" | "0" => Ok(ConsumptionState::Check),
            "checked" | "1" => Ok(ConsumptionState::Checked),
            "viewing" | "2" => Ok(ConsumptionState::Viewing),
            "done" | "3" => Ok(ConsumptionState::Done),
            _ => Err(anyhow::anyhow!("Unknown state: {}", s)),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    /// Server-assigned id; absent while the record is unsynced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Key in the local store. Never sent over the wire.
    #[serde(skip)]
    pub local_id: Option<u64>,
    pub title: String,
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub quotes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

impl Media {
    pub fn is_synced(&self) -> bool {
        self.id.is_some()
    }

    /// Same catalog content, ignoring identity.
    pub fn same_content(&self, other: &Media) -> bool {
        self.title == other.title
            && self.media_type == other.media_type
            && self.url == other.url
            && self.plot == other.plot
            && self.chapters == other.chapters
            && self.quotes == other.quotes
            && self.created_at == other.created_at
    }
}

/// Unvalidated media input, built up field by field before submission.
#[derive(Debug, Clone, Default)]
pub struct MediaDraft {
    title: Option<String>,
    media_type: Option<MediaType>,
    url: Option<String>,
    plot: Option<String>,
    chapters: Option<String>,
    quotes: Vec<String>,
}

impl MediaDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = Some(media_type);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn plot(mut self, plot: impl Into<String>) -> Self {
        self.plot = Some(plot.into());
        self
    }

    pub fn chapters(mut self, chapters: impl Into<String>) -> Self {
        self.chapters = Some(chapters.into());
        self
    }

    pub fn quote(mut self, quote: impl Into<String>) -> Self {
        self.quotes.push(quote.into());
        self
    }

    /// Check required fields and produce an unsynced [`Media`].
    pub fn validate(self) -> Result<Media> {
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(Error::InvalidDraft("title is required"))?;
        let media_type = self
            .media_type
            .ok_or(Error::InvalidDraft("media type is required"))?;
        let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        Ok(Media {
            id: None,
            local_id: None,
            title,
            media_type,
            url: non_empty(self.url),
            plot: non_empty(self.plot),
            chapters: non_empty(self.chapters),
            quotes: self.quotes,
            created_at: None,
        })
    }
}

/// Per-user consumption state and score for one media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMediaState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub media_id: i64,
    #[serde(default)]
    pub state: ConsumptionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl UserMediaState {
    /// Fresh state for a media item the user has not interacted with yet.
    pub fn new(media_id: i64) -> Self {
        let now = Timestamp::now();
        Self {
            id: None,
            media_id,
            state: ConsumptionState::Check,
            score: None,
            added_at: Some(now),
            updated_at: now,
        }
    }

    /// Apply a state change. Resetting to `Check` clears the score.
    pub fn set_state(&mut self, state: ConsumptionState) {
        self.state = state;
        if state == ConsumptionState::Check {
            self.score = None;
        }
        self.touch();
    }

    pub fn set_score(&mut self, score: Option<u8>) -> Result<()> {
        self.score = validate_score(score)?;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Timestamp::next_after(Some(self.updated_at));
    }
}

pub fn validate_score(score: Option<u8>) -> Result<Option<u8>> {
    match score {
        Some(s) if !(1..=10).contains(&s) => Err(Error::validation(
            "score",
            format!("score must be between 1 and 10, got {s}"),
        )),
        other => Ok(other),
    }
}

/// A locally known account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub token: String,
    /// Only set for accounts registered while offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub is_offline: bool,
    pub last_login: Timestamp,
}

/// Left join of [`Media`] with the current user's [`UserMediaState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaWithUserData {
    #[serde(flatten)]
    pub media: Media,
    #[serde(rename = "userState", skip_serializing_if = "Option::is_none")]
    pub user_state: Option<ConsumptionState>,
    #[serde(rename = "userScore", skip_serializing_if = "Option::is_none")]
    pub user_score: Option<u8>,
}
