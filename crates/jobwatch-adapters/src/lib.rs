//! Search and notification adapters: the scraper and notifier contracts plus concrete implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use jobwatch_core::{guard, GuardDecision, ScrapeResult, SearchQuery, SubscriberId};
use jobwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jobwatch-adapters";

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected markup: {0}")]
    Markup(String),
    #[error("invalid search url: {0}")]
    Url(#[from] url::ParseError),
    #[error("fixture {path}: {message}")]
    Fixture { path: PathBuf, message: String },
}

/// Result URLs must be stable across calls: they are the deduplication key.
#[async_trait]
pub trait JobSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery, threshold: u64) -> Result<ScrapeResult, ScraperError>;
}

/// Hands one listing to a subscriber. Expected failures return `false`, never panic.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subscriber_id: SubscriberId, title: &str, url: &str) -> bool;
}

pub fn canonical_listing_url(raw: &str) -> String {
    let cut = raw.find(['?', '#']).unwrap_or(raw.len());
    raw[..cut].to_string()
}

pub fn title_hits_stop_word(title: &str, query: &SearchQuery) -> bool {
    let title = title.to_lowercase();
    query
        .stop_words
        .iter()
        .any(|stop| title.contains(&stop.to_lowercase()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsPage {
    pub total_count: Option<u64>,
    pub listings: Vec<(String, String)>,
    pub next_page: Option<String>,
}

const COUNT_SELECTOR: &str = r#"[data-qa="vacancies-search-header"] > h1"#;
const ITEM_SELECTOR: &str = r#"[data-qa="serp-item__title"]"#;
const NEXT_SELECTOR: &str = r#"[data-qa="pager-next"]"#;

fn selector(css: &str) -> Result<Selector, ScraperError> {
    Selector::parse(css).map_err(|e| ScraperError::Markup(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_href<'a>(el: &ElementRef<'a>) -> Option<&'a str> {
    el.value().attr("href")
}

/// All digit groups glued together: "Найдено 1 234 вакансии" -> 1234.
fn parse_count(text: &str) -> Option<u64> {
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

pub fn parse_results_page(html: &str, page_url: &Url) -> Result<ResultsPage, ScraperError> {
    let document = Html::parse_document(html);

    let total_count = document
        .select(&selector(COUNT_SELECTOR)?)
        .next()
        .and_then(|n| parse_count(&n.text().collect::<String>()));

    let mut listings = Vec::new();
    for item in document.select(&selector(ITEM_SELECTOR)?) {
        let Some(title) = text_or_none(item.text().collect::<String>()) else {
            continue;
        };
        let Some(href) = element_href(&item) else {
            debug!(%title, "listing without href skipped");
            continue;
        };
        let absolute = page_url
            .join(href)
            .map_err(|e| ScraperError::Markup(format!("bad listing href {href}: {e}")))?;
        listings.push((title, canonical_listing_url(absolute.as_str())));
    }

    let next_page = document
        .select(&selector(NEXT_SELECTOR)?)
        .next()
        .and_then(|n| element_href(&n))
        .and_then(|href| page_url.join(href).ok())
        .map(|u| u.to_string());

    Ok(ResultsPage {
        total_count,
        listings,
        next_page,
    })
}

#[derive(Debug, Clone)]
pub struct HhSearchClient {
    http: HttpFetcher,
    base_url: Url,
    max_pages: usize,
}

impl HhSearchClient {
    pub fn new(http: HttpFetcher, base_url: &str) -> Result<Self, ScraperError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            max_pages: 20,
        })
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn search_url(&self, query: &SearchQuery) -> Result<Url, ScraperError> {
        let text = query
            .job_terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        let excluded = query
            .stop_words
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let mut url = self.base_url.join("/search/vacancy")?;
        url.query_pairs_mut()
            .append_pair("text", &text)
            .append_pair("excluded_text", &excluded);
        Ok(url)
    }
}

#[async_trait]
impl JobSearch for HhSearchClient {
    async fn search(&self, query: &SearchQuery, threshold: u64) -> Result<ScrapeResult, ScraperError> {
        let mut page_url = self.search_url(query)?;
        let mut listings = BTreeMap::new();

        for page_no in 0..self.max_pages {
            let response = self.http.get(page_url.as_str()).await?;
            let base = Url::parse(&response.final_url).unwrap_or_else(|_| page_url.clone());
            let page = parse_results_page(&response.text(), &base)?;

            if page_no == 0 {
                let count = page.total_count.unwrap_or(page.listings.len() as u64);
                // Counts come from digits only, so they always fit.
                let raw = i64::try_from(count).unwrap_or(i64::MAX);
                if let Ok(GuardDecision::TooBroad { count }) = guard(raw, threshold) {
                    info!(count, threshold, "search too broad, not paging");
                    return Ok(ScrapeResult::TooBroad { count });
                }
            }

            for (title, url) in page.listings {
                listings.insert(title, url);
            }

            match page.next_page {
                Some(next) => page_url = Url::parse(&next)?,
                None => break,
            }
        }

        debug!(found = listings.len(), "search finished");
        Ok(ScrapeResult::Listings { listings })
    }
}

/// Serves a `ScrapeResult` from a JSON file, re-read on every call.
#[derive(Debug, Clone)]
pub struct FixtureSearch {
    path: PathBuf,
}

impl FixtureSearch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl JobSearch for FixtureSearch {
    async fn search(&self, query: &SearchQuery, threshold: u64) -> Result<ScrapeResult, ScraperError> {
        let fixture_error = |message: String| ScraperError::Fixture {
            path: self.path.clone(),
            message,
        };
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| fixture_error(e.to_string()))?;
        let result: ScrapeResult =
            serde_json::from_str(&text).map_err(|e| fixture_error(e.to_string()))?;

        let listings = match result {
            ScrapeResult::TooBroad { count } => return Ok(ScrapeResult::TooBroad { count }),
            ScrapeResult::Listings { listings } => listings
                .into_iter()
                .filter(|(title, _)| !title_hits_stop_word(title, query))
                .map(|(title, url)| (title, canonical_listing_url(&url)))
                .collect::<BTreeMap<_, _>>(),
        };
        if listings.len() as u64 > threshold {
            return Ok(ScrapeResult::TooBroad {
                count: listings.len() as u64,
            });
        }
        Ok(ScrapeResult::Listings { listings })
    }
}

#[derive(Debug, Serialize)]
struct SendMessage {
    chat_id: i64,
    text: String,
    disable_web_page_preview: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: HttpFetcher,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(http: HttpFetcher, bot_token: &str) -> Self {
        Self::with_api_base(http, "https://api.telegram.org", bot_token)
    }

    pub fn with_api_base(http: HttpFetcher, api_base: &str, bot_token: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
        }
    }

    pub fn message_text(title: &str, url: &str) -> String {
        format!("{title}\n{url}")
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, subscriber_id: SubscriberId, title: &str, url: &str) -> bool {
        let body = SendMessage {
            chat_id: subscriber_id.0,
            text: Self::message_text(title, url),
            disable_web_page_preview: false,
        };
        match self.http.post_json(&self.endpoint, &body).await {
            Ok(_) => true,
            Err(err) => {
                warn!(%subscriber_id, url, error = %err, "telegram send failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subscriber_id: SubscriberId, title: &str, url: &str) -> bool {
        info!(%subscriber_id, title, url, "listing delivered (log notifier)");
        true
    }
}
