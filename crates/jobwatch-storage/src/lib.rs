//! Listing store, subscriber directory and HTTP fetch utilities for jobwatch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobwatch_core::{Listing, Subscriber, SubscriberId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jobwatch-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("subscriber file {path}: {message}")]
    SubscriberFile { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyKnown,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Inserts `(subscriber_id, url)` with `delivered = false` unless the pair already exists.
    async fn insert_if_absent(
        &self,
        subscriber_id: SubscriberId,
        url: &str,
        title: &str,
        first_seen_date: NaiveDate,
    ) -> Result<InsertOutcome, StoreError>;

    async fn pending(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError>;

    /// Flips `delivered` to true. Returns false when the row is gone or already delivered.
    async fn mark_delivered(
        &self,
        subscriber_id: SubscriberId,
        listing_id: i64,
    ) -> Result<bool, StoreError>;

    /// Deletes rows of every subscriber first seen strictly before `cutoff`.
    async fn delete_seen_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError>;

    async fn listings(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError>;

    async fn clear_subscriber(&self, subscriber_id: SubscriberId) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn all(&self) -> Result<Vec<Subscriber>, StoreError>;
    async fn get(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn database_connect() -> Self {
        Self {
            max_retries: 9,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub async fn connect_pool_with_retry(
    database_url: &str,
    max_connections: u32,
    backoff: BackoffPolicy,
) -> Result<PgPool, StoreError> {
    let mut attempt = 0usize;
    loop {
        info!(attempt = attempt + 1, total = backoff.max_retries + 1, "connecting to database");
        match PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("database connection established");
                return Ok(pool);
            }
            Err(err) if attempt < backoff.max_retries => {
                warn!(error = %err, attempt = attempt + 1, "database connection attempt failed");
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(StoreError::Database(err)),
        }
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    id: i64,
    subscriber_id: i64,
    url: String,
    title: String,
    first_seen_date: NaiveDate,
    delivered: bool,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            subscriber_id: SubscriberId(row.subscriber_id),
            url: row.url,
            title: row.title,
            first_seen_date: row.first_seen_date,
            delivered: row.delivered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn insert_if_absent(
        &self,
        subscriber_id: SubscriberId,
        url: &str,
        title: &str,
        first_seen_date: NaiveDate,
    ) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO listings (subscriber_id, url, title, first_seen_date, delivered)
            VALUES ($1, $2, $3, $4, FALSE)
            ON CONFLICT (subscriber_id, url) DO NOTHING
            "#,
        )
        .bind(subscriber_id.0)
        .bind(url)
        .bind(title)
        .bind(first_seen_date)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyKnown
        })
    }

    async fn pending(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT id, subscriber_id, url, title, first_seen_date, delivered
              FROM listings
             WHERE subscriber_id = $1
               AND delivered = FALSE
             ORDER BY first_seen_date ASC, id ASC
            "#,
        )
        .bind(subscriber_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    async fn mark_delivered(
        &self,
        subscriber_id: SubscriberId,
        listing_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET delivered = TRUE
             WHERE id = $1
               AND subscriber_id = $2
               AND delivered = FALSE
            "#,
        )
        .bind(listing_id)
        .bind(subscriber_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_seen_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM listings WHERE first_seen_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn listings(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT id, subscriber_id, url, title, first_seen_date, delivered
              FROM listings
             WHERE subscriber_id = $1
             ORDER BY first_seen_date ASC, id ASC
            "#,
        )
        .bind(subscriber_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    async fn clear_subscriber(&self, subscriber_id: SubscriberId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM listings WHERE subscriber_id = $1")
            .bind(subscriber_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriberRow {
    id: i64,
    display_name: String,
    job_terms: Vec<String>,
    stop_words: Vec<String>,
}

impl From<SubscriberRow> for Subscriber {
    fn from(row: SubscriberRow) -> Self {
        Subscriber {
            id: SubscriberId(row.id),
            display_name: row.display_name,
            job_terms: row.job_terms,
            stop_words: row.stop_words.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSubscriberDirectory {
    pool: PgPool,
}

impl PgSubscriberDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberDirectory for PgSubscriberDirectory {
    async fn all(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            "SELECT id, display_name, job_terms, stop_words FROM subscribers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscriber::from).collect())
    }

    async fn get(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        let row = sqlx::query_as::<_, SubscriberRow>(
            "SELECT id, display_name, job_terms, stop_words FROM subscribers WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscriber::from))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<(SubscriberId, String), Listing>,
}

#[derive(Debug, Default)]
pub struct InMemoryListingStore {
    state: Mutex<MemoryState>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn select(&self, subscriber_id: SubscriberId, pending_only: bool) -> Vec<Listing> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .values()
            .filter(|l| l.subscriber_id == subscriber_id && !(pending_only && l.delivered))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|l| (l.first_seen_date, l.id));
        rows
    }
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn insert_if_absent(
        &self,
        subscriber_id: SubscriberId,
        url: &str,
        title: &str,
        first_seen_date: NaiveDate,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (subscriber_id, url.to_string());
        if state.rows.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyKnown);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            key,
            Listing {
                id,
                subscriber_id,
                url: url.to_string(),
                title: title.to_string(),
                first_seen_date,
                delivered: false,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn pending(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError> {
        Ok(self.select(subscriber_id, true).await)
    }

    async fn mark_delivered(
        &self,
        subscriber_id: SubscriberId,
        listing_id: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .values_mut()
            .find(|l| l.id == listing_id && l.subscriber_id == subscriber_id && !l.delivered);
        Ok(match row {
            Some(row) => {
                row.delivered = true;
                true
            }
            None => false,
        })
    }

    async fn delete_seen_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|_, l| l.first_seen_date >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }

    async fn listings(&self, subscriber_id: SubscriberId) -> Result<Vec<Listing>, StoreError> {
        Ok(self.select(subscriber_id, false).await)
    }

    async fn clear_subscriber(&self, subscriber_id: SubscriberId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|(owner, _), _| *owner != subscriber_id);
        Ok((before - state.rows.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubscriberDirectory {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
}

impl InMemorySubscriberDirectory {
    pub fn new(subscribers: impl IntoIterator<Item = Subscriber>) -> Self {
        Self {
            subscribers: subscribers.into_iter().map(|s| (s.id, s)).collect(),
        }
    }
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn all(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self.subscribers.values().cloned().collect())
    }

    async fn get(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.subscribers.get(&id).cloned())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SubscribersYaml {
    subscribers: Vec<Subscriber>,
}

#[derive(Debug, Clone)]
pub struct YamlSubscriberDirectory {
    path: PathBuf,
}

impl YamlSubscriberDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<Subscriber>, StoreError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::SubscriberFile {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        let parsed: SubscribersYaml =
            serde_yaml::from_str(&text).map_err(|e| StoreError::SubscriberFile {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(parsed.subscribers)
    }
}

#[async_trait]
impl SubscriberDirectory for YamlSubscriberDirectory {
    async fn all(&self) -> Result<Vec<Subscriber>, StoreError> {
        self.load().await
    }

    async fn get(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.load().await?.into_iter().find(|s| s.id == id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("http client is shutting down")]
    Closed,
}

pub fn redacted_endpoint(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}://{host}:{port}", parsed.scheme()),
            (Some(host), None) => format!("{}://{host}", parsed.scheme()),
            _ => "<redacted>".to_string(),
        },
        Err(_) => "<redacted>".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(url, || self.client.get(url))
            .instrument(info_span!("http_get", url))
            .await
    }

    /// Only scheme and host of `url` reach logs and errors; the path may hold credentials.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let endpoint = redacted_endpoint(url);
        self.send_with_retry(&endpoint, || self.client.post(url).json(body))
            .instrument(info_span!("http_post", endpoint = %endpoint))
            .await
    }

    async fn send_with_retry<F>(&self, endpoint: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let final_url = resp.url().to_string();
                        let body = resp.bytes().await.map_err(reqwest::Error::without_url)?.to_vec();
                        return Ok(FetchedResponse { final_url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, endpoint, attempt = attempt + 1, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
