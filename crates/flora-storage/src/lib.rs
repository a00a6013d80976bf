//! HTTP fetch utilities, response caching and raw page archiving for FLORA.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use flora_core::{ProviderId, ProviderRecord, SpeciesSummary};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flora-storage";

pub const TREFLE_SEARCH_CACHE: &str = "trefle-search";
pub const TREFLE_DETAIL_CACHE: &str = "trefle-detail";
pub const PERENUAL_SEARCH_CACHE: &str = "perenual-search";
pub const PERENUAL_DETAIL_CACHE: &str = "perenual-detail";
pub const TREFLE_LIST_CACHE: &str = "trefle-list";
pub const PERENUAL_LIST_CACHE: &str = "perenual-list";

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// never observe a partial file. An existing file is replaced.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw scraped HTML.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(&self, source_id: &str, slug: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(source_id)
            .join(slug)
            .join(format!("{content_hash}.html"))
    }

    /// Store a page once per distinct body. Identical bodies for the same
    /// slug resolve to the same file.
    pub async fn store_page(
        &self,
        source_id: &str,
        slug: &str,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(source_id, slug, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
            debug!(source_id, slug, %fetched_at, hash = %content_hash, "archived page");
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Time source for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Expiry measured from the write, not the last read.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tick: u64,
    stats: CacheStats,
}

/// Bounded LRU cache with write-time expiry.
#[derive(Debug)]
pub struct ResponseCache<V> {
    name: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: std::sync::Mutex<CacheInner<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: std::sync::Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let Some(entry) = inner.entries.get_mut(key) else {
            inner.stats.misses += 1;
            return None;
        };
        if now.saturating_duration_since(entry.inserted_at) >= self.config.ttl {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!(cache = %self.name, key, "cache entry expired");
            return None;
        }
        entry.last_used = tick;
        inner.stats.hits += 1;
        Some(entry.value.clone())
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        if self.config.capacity == 0 {
            return;
        }
        let key = key.into();
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.capacity {
            let ttl = self.config.ttl;
            let before = inner.entries.len();
            inner
                .entries
                .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
            let expired = (before - inner.entries.len()) as u64;
            if expired > 0 {
                inner.stats.expirations += expired;
                debug!(cache = %self.name, expired, "purged expired entries");
            }

            if inner.entries.len() >= self.config.capacity {
                let victim = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    inner.entries.remove(&victim);
                    inner.stats.evictions += 1;
                    debug!(cache = %self.name, key = %victim, "evicted least recently used entry");
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_used: tick,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Entry count, including expired entries not yet read.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

/// Search, detail and listing caches for one structured provider.
#[derive(Debug, Clone)]
pub struct ProviderCaches {
    pub search: Arc<ResponseCache<Vec<SpeciesSummary>>>,
    pub detail: Arc<ResponseCache<ProviderRecord>>,
    pub list: Arc<ResponseCache<Vec<SpeciesSummary>>>,
}

impl ProviderCaches {
    fn new(names: [&str; 3], config: CacheConfig, clock: &Arc<dyn Clock>) -> Self {
        let [search, detail, list] = names;
        Self {
            search: Arc::new(ResponseCache::with_clock(search, config, clock.clone())),
            detail: Arc::new(ResponseCache::with_clock(detail, config, clock.clone())),
            list: Arc::new(ResponseCache::with_clock(list, config, clock.clone())),
        }
    }
}

/// The named caches, one per (provider, operation) pair.
#[derive(Debug, Clone)]
pub struct CacheRegistry {
    trefle: ProviderCaches,
    perenual: ProviderCaches,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            trefle: ProviderCaches::new(
                [TREFLE_SEARCH_CACHE, TREFLE_DETAIL_CACHE, TREFLE_LIST_CACHE],
                config,
                &clock,
            ),
            perenual: ProviderCaches::new(
                [PERENUAL_SEARCH_CACHE, PERENUAL_DETAIL_CACHE, PERENUAL_LIST_CACHE],
                config,
                &clock,
            ),
        }
    }

    /// Scraped sources are not cached.
    pub fn for_provider(&self, provider: &ProviderId) -> Option<ProviderCaches> {
        match provider {
            ProviderId::Trefle => Some(self.trefle.clone()),
            ProviderId::Perenual => Some(self.perenual.clone()),
            ProviderId::Scraped(_) => None,
        }
    }

    pub fn stats(&self) -> Vec<(String, CacheStats)> {
        [&self.trefle, &self.perenual]
            .into_iter()
            .flat_map(|c| {
                [
                    (c.search.name().to_string(), c.search.stats()),
                    (c.detail.name().to_string(), c.detail.stats()),
                    (c.list.name().to_string(), c.list.stats()),
                ]
            })
            .collect()
    }

    pub fn clear_all(&self) {
        for caches in [&self.trefle, &self.perenual] {
            caches.search.clear();
            caches.detail.clear();
            caches.list.clear();
        }
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    /// A zero `refill_every` disables pacing.
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Whole refill periods in `elapsed`, saturating at `u32::MAX`.
    fn refills_in(&self, elapsed: Duration) -> u32 {
        let period = self.refill_every.as_nanos();
        if period == 0 {
            return 0;
        }
        u32::try_from(elapsed.as_nanos() / period).unwrap_or(u32::MAX)
    }

    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let refills = self.refills_in(state.last_refill.elapsed());
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    // Keep the partial period so sub-period remainders are not lost.
                    state.last_refill = self
                        .refill_every
                        .checked_mul(refills)
                        .and_then(|spent| state.last_refill.checked_add(spent))
                        .unwrap_or_else(Instant::now);
                }

                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Minimum spacing between requests to the same domain. Callers reserve a
/// slot under the lock and sleep outside it, so concurrent callers queue up.
#[derive(Debug)]
pub struct DomainThrottle {
    spacing: Duration,
    next_slot: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl DomainThrottle {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub async fn wait(&self, domain: &str) {
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = tokio::time::Instant::now();
            let slot = slots
                .get(domain)
                .copied()
                .filter(|s| *s > now)
                .unwrap_or(now);
            slots.insert(domain.to_string(), slot + self.spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    api_calls: Arc<ApiCallTracker>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// Strip the query string so credentials passed as parameters stay out of logs.
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Requests sent to one source during one UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallStats {
    pub calls: u64,
    pub failures: u64,
    pub last_call_at: Option<DateTime<Utc>>,
}

/// Daily request counts per source, the numbers provider quotas are written in.
/// Every attempt counts, retries included.
#[derive(Debug, Default)]
pub struct ApiCallTracker {
    days: std::sync::Mutex<BTreeMap<(NaiveDate, String), ApiCallStats>>,
}

impl ApiCallTracker {
    pub fn record(&self, source_id: &str, success: bool) {
        self.record_at(source_id, success, Utc::now());
    }

    pub fn record_at(&self, source_id: &str, success: bool, at: DateTime<Utc>) {
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = days
            .entry((at.date_naive(), source_id.to_string()))
            .or_default();
        stats.calls += 1;
        if !success {
            stats.failures += 1;
        }
        stats.last_call_at = Some(at);
    }

    pub fn stats_for(&self, source_id: &str, date: NaiveDate) -> Option<ApiCallStats> {
        let days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        days.get(&(date, source_id.to_string())).copied()
    }

    /// Every source seen on `date`, keyed by source id.
    pub fn day(&self, date: NaiveDate) -> BTreeMap<String, ApiCallStats> {
        let days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        days.range((date, String::new())..)
            .take_while(|((day, _), _)| *day == date)
            .map(|((_, source), stats)| (source.clone(), *stats))
            .collect()
    }

    /// Forget days before `date`.
    pub fn prune_before(&self, date: NaiveDate) {
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        *days = days.split_off(&(date, String::new()));
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
            api_calls: Arc::new(ApiCallTracker::default()),
        })
    }

    /// Shared handle on the per-source daily request counts.
    pub fn api_calls(&self) -> Arc<ApiCallTracker> {
        self.api_calls.clone()
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = redact_url(url));
        self.fetch_with_retries(source_id, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut attempt = 0;
        loop {
            let retry = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    self.api_calls.record(source_id, status.is_success());

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|e| FetchError::Request(e.without_url()))?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: redact_url(&final_url).to_string(),
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    self.api_calls.record(source_id, false);
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err.without_url()));
                    }
                    err.without_url().to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, reason = %retry, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
