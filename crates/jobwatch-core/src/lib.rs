//! Core domain model for jobwatch: subscribers, listings, scrape results and cycle outcomes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobwatch-core";

pub const DEFAULT_GUARD_THRESHOLD: u64 = 50;

pub const DEFAULT_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub i64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubscriberId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub display_name: String,
    #[serde(default)]
    pub job_terms: Vec<String>,
    #[serde(default)]
    pub stop_words: BTreeSet<String>,
}

impl Subscriber {
    pub fn search_query(&self) -> SearchQuery {
        SearchQuery::new(self.job_terms.clone(), self.stop_words.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub job_terms: Vec<String>,
    pub stop_words: BTreeSet<String>,
}

impl SearchQuery {
    pub fn new(
        job_terms: impl IntoIterator<Item = String>,
        stop_words: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let job_terms = job_terms
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
            .collect();
        let stop_words = stop_words
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            job_terms,
            stop_words,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.job_terms.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub subscriber_id: SubscriberId,
    pub url: String,
    pub title: String,
    pub first_seen_date: NaiveDate,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrapeResult {
    TooBroad { count: u64 },
    /// Title -> canonical URL.
    Listings { listings: BTreeMap<String, String> },
}

impl ScrapeResult {
    pub fn listings<I, T, U>(items: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        Self::Listings {
            listings: items
                .into_iter()
                .map(|(t, u)| (t.into(), u.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    Proceed,
    TooBroad { count: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("raw result count must not be negative, got {0}")]
    NegativeCount(i64),
}

/// Rejects searches whose raw result count is strictly above `threshold`.
pub fn guard(raw_count: i64, threshold: u64) -> Result<GuardDecision, GuardError> {
    let count = u64::try_from(raw_count).map_err(|_| GuardError::NegativeCount(raw_count))?;
    if count > threshold {
        Ok(GuardDecision::TooBroad { count })
    } else {
        Ok(GuardDecision::Proceed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CycleFailure {
    #[error("scraper error: {0}")]
    Scraper(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid result count: {0}")]
    InvalidCount(String),
    #[error("cycle timed out")]
    Timeout,
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    SkippedTooBroad { count: u64 },
    NoNewListings,
    Delivered { count: usize },
    Failed { reason: CycleFailure },
}

impl CycleOutcome {
    pub fn failed(reason: CycleFailure) -> Self {
        Self::Failed { reason }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Text for the subscriber's chat. `None` when the delivered listings speak for themselves.
    pub fn subscriber_message(&self) -> Option<String> {
        match self {
            Self::SkippedTooBroad { count } => Some(format!(
                "Your search matches {count} listings, which is too many to follow. \
                 Please narrow it down with more specific job titles or more stop words."
            )),
            Self::NoNewListings => Some("No new listings since the last check.".to_string()),
            Self::Delivered { .. } => None,
            Self::Failed { .. } => {
                Some("Something went wrong while checking listings. Please try again later.".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Guarding,
    Aborted,
    Ingesting,
    Delivering,
    Done,
}

impl CyclePhase {
    /// Legal forward transitions: Idle -> Guarding -> (Aborted | Ingesting) -> Delivering -> Done.
    /// Any phase may jump to Done on failure.
    pub fn can_advance_to(self, next: CyclePhase) -> bool {
        use CyclePhase::*;
        matches!(
            (self, next),
            (Idle, Guarding)
                | (Guarding, Aborted)
                | (Guarding, Ingesting)
                | (Ingesting, Delivering)
                | (Aborted, Done)
                | (Delivering, Done)
        ) || (next == Done && self != Done)
    }
}

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}
