//! Periodic sync: read the species worklist, fetch every configured provider,
//! reconcile, and hand canonical records to a [`PlantStore`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flora_adapters::{
    resolve, AdapterError, CachedAdapter, PageScraper, PerenualAdapter, ProviderAdapter,
    SectionRules, TrefleAdapter,
};
use flora_core::{slugify, ConflictResolutionStrategy, MergeResult, ProviderId, ProviderRecord};
use flora_reconcile::ReconciliationEngine;
use flora_storage::{
    write_atomic, ApiCallStats, ApiCallTracker, CacheConfig, CacheRegistry, CacheStats,
    DomainThrottle, HttpClientConfig, HttpFetcher, PageArchive, TokenBucketConfig,
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flora-sync";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Worklist {
    pub species: Vec<WorklistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorklistEntry {
    /// Derived from the scientific name when omitted.
    #[serde(default)]
    pub slug: String,
    pub scientific_name: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub trefle_id: Option<String>,
    #[serde(default, deserialize_with = "optional_id")]
    pub perenual_id: Option<String>,
    #[serde(default)]
    pub scrape_sources: Vec<String>,
}

impl WorklistEntry {
    pub fn new(scientific_name: impl Into<String>) -> Self {
        let scientific_name = scientific_name.into();
        Self {
            slug: slugify(&scientific_name),
            scientific_name,
            trefle_id: None,
            perenual_id: None,
            scrape_sources: Vec::new(),
        }
    }

    /// Provider id pinned in the worklist, skipping the search step.
    pub fn provider_ref(&self, provider: &ProviderId) -> Option<&str> {
        match provider {
            ProviderId::Trefle => self.trefle_id.as_deref(),
            ProviderId::Perenual => self.perenual_id.as_deref(),
            ProviderId::Scraped(_) => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(|raw| match raw {
            RawId::Text(text) => text.trim().to_string(),
            RawId::Number(n) => n.to_string(),
        })
        .filter(|id| !id.is_empty()))
}

impl Worklist {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut worklist: Worklist = serde_yaml::from_str(text).context("parsing worklist yaml")?;
        for (index, entry) in worklist.species.iter_mut().enumerate() {
            if entry.scientific_name.trim().is_empty() {
                bail!("worklist entry {index} has no scientific_name");
            }
            let source = if entry.slug.trim().is_empty() {
                &entry.scientific_name
            } else {
                &entry.slug
            };
            entry.slug = slugify(source);
        }
        Ok(worklist)
    }
}

pub async fn load_worklist(path: &Path) -> Result<Vec<WorklistEntry>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading worklist {}", path.display()))?;
    let worklist = Worklist::from_yaml_str(&text)
        .with_context(|| format!("loading worklist {}", path.display()))?;
    Ok(worklist.species)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub worklist_path: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub sync_interval: Duration,
    pub fetch_timeout: Duration,
    pub max_concurrency: usize,
    pub conflict_strategy: ConflictResolutionStrategy,
    pub cache: CacheConfig,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Outbound request budget shared by every provider and site.
    pub requests_per_minute: Option<u32>,
    pub scrape_delay: Duration,
    pub section_rules: Option<PathBuf>,
    pub trefle_api_key: String,
    pub trefle_base_url: String,
    pub perenual_api_key: String,
    pub perenual_base_url: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str, default: u64| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let optional_path = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        };

        let conflict_strategy = match lookup("FLORA_CONFLICT_STRATEGY") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(error = %err, "falling back to PREFER_TREFLE");
                ConflictResolutionStrategy::default()
            }),
            None => ConflictResolutionStrategy::default(),
        };

        Self {
            worklist_path: optional_path("FLORA_WORKLIST")
                .unwrap_or_else(|| PathBuf::from("./species.yaml")),
            output_dir: optional_path("FLORA_OUTPUT_DIR")
                .unwrap_or_else(|| PathBuf::from("./canonical")),
            reports_dir: optional_path("FLORA_REPORTS_DIR")
                .unwrap_or_else(|| PathBuf::from("./reports")),
            archive_dir: optional_path("FLORA_ARCHIVE_DIR"),
            sync_interval: Duration::from_secs(number("FLORA_SYNC_INTERVAL_SECS", 3600).max(1)),
            fetch_timeout: Duration::from_secs(number("FLORA_FETCH_TIMEOUT_SECS", 30).max(1)),
            max_concurrency: number("FLORA_MAX_CONCURRENCY", 4).max(1) as usize,
            conflict_strategy,
            cache: CacheConfig {
                capacity: number("FLORA_CACHE_CAPACITY", 1000) as usize,
                ttl: Duration::from_secs(number("FLORA_CACHE_TTL_SECS", 3600)),
            },
            user_agent: lookup("FLORA_USER_AGENT").unwrap_or_else(|| "flora-bot/0.1".to_string()),
            http_timeout_secs: number("FLORA_HTTP_TIMEOUT_SECS", 20),
            requests_per_minute: lookup("FLORA_REQUESTS_PER_MINUTE")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|rpm| *rpm > 0),
            scrape_delay: Duration::from_millis(number("FLORA_SCRAPE_DELAY_MS", 3000)),
            section_rules: optional_path("FLORA_SECTION_RULES"),
            trefle_api_key: lookup("TREFLE_API_KEY").unwrap_or_default().trim().to_string(),
            trefle_base_url: lookup("TREFLE_BASE_URL")
                .unwrap_or_else(|| TrefleAdapter::DEFAULT_BASE_URL.to_string()),
            perenual_api_key: lookup("PERENUAL_API_KEY").unwrap_or_default().trim().to_string(),
            perenual_base_url: lookup("PERENUAL_BASE_URL")
                .unwrap_or_else(|| PerenualAdapter::DEFAULT_BASE_URL.to_string()),
        }
    }
}

impl SyncConfig {
    pub fn http_fetcher(&self) -> Result<Arc<HttpFetcher>> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self.requests_per_minute.map(|rpm| TokenBucketConfig {
                capacity: rpm,
                refill_every: Duration::from_secs(60) / rpm,
            }),
            ..HttpClientConfig::default()
        })
        .context("building http client")?;
        Ok(Arc::new(http))
    }

    /// Uncached adapters for every structured provider with an API key.
    pub fn provider_adapters(&self, http: &Arc<HttpFetcher>) -> Vec<Arc<dyn ProviderAdapter>> {
        let structured: [(Arc<dyn ProviderAdapter>, &str, &str); 2] = [
            (
                Arc::new(TrefleAdapter::new(
                    http.clone(),
                    self.trefle_base_url.clone(),
                    self.trefle_api_key.clone(),
                )),
                self.trefle_api_key.as_str(),
                "TREFLE_API_KEY",
            ),
            (
                Arc::new(PerenualAdapter::new(
                    http.clone(),
                    self.perenual_base_url.clone(),
                    self.perenual_api_key.clone(),
                )),
                self.perenual_api_key.as_str(),
                "PERENUAL_API_KEY",
            ),
        ];
        structured
            .into_iter()
            .filter_map(|(adapter, key, variable)| {
                if key.is_empty() {
                    info!(provider = %adapter.provider(), "{variable} not set; provider disabled");
                    None
                } else {
                    Some(adapter)
                }
            })
            .collect()
    }

    /// Scraper with the configured section rules, politeness delay and
    /// optional page archive.
    pub fn page_scraper(&self, http: Arc<HttpFetcher>) -> Result<PageScraper> {
        let rules = match &self.section_rules {
            Some(path) => SectionRules::from_yaml_file(path)?,
            None => SectionRules::default(),
        };
        let mut scraper = PageScraper::new(http, DomainThrottle::new(self.scrape_delay)).with_rules(rules);
        if let Some(dir) = &self.archive_dir {
            scraper = scraper.with_archive(PageArchive::new(dir));
        }
        Ok(scraper)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Why one species was skipped. Recorded in the run summary, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SpeciesFailure {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("persist failed: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSpecies {
    pub slug: String,
    pub reason: SpeciesFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: ConflictResolutionStrategy,
    pub attempted: usize,
    pub persisted: usize,
    pub failures: Vec<FailedSpecies>,
    pub conflicts: usize,
    pub pending_conflicts: usize,
    #[serde(default)]
    pub cache: BTreeMap<String, CacheStats>,
    /// Requests per source so far on the UTC day the run finished.
    #[serde(default)]
    pub api_calls: BTreeMap<String, ApiCallStats>,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn failure_for(&self, slug: &str) -> Option<&SpeciesFailure> {
        self.failures
            .iter()
            .find(|f| f.slug == slug)
            .map(|f| &f.reason)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SpeciesOutcome {
    conflicts: usize,
    pending: usize,
}

/// Destination for canonical records. A save replaces any prior record for
/// the same slug.
#[async_trait]
pub trait PlantStore: Send + Sync {
    async fn save(&self, result: &MergeResult) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPlantStore {
    records: Mutex<BTreeMap<String, MergeResult>>,
}

impl MemoryPlantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, slug: &str) -> Option<MergeResult> {
        self.records.lock().await.get(slug).cloned()
    }

    pub async fn slugs(&self) -> Vec<String> {
        self.records.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl PlantStore for MemoryPlantStore {
    async fn save(&self, result: &MergeResult) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(result.plant.slug.clone(), result.clone());
        Ok(())
    }
}

/// One pretty-printed `<slug>.json` per species under `root`.
#[derive(Debug, Clone)]
pub struct JsonDirPlantStore {
    root: PathBuf,
}

impl JsonDirPlantStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, slug: &str) -> PathBuf {
        self.root.join(format!("{slug}.json"))
    }

    pub async fn load(&self, slug: &str) -> Result<Option<MergeResult>> {
        let path = self.path_for(slug);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let result = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(result))
    }
}

#[async_trait]
impl PlantStore for JsonDirPlantStore {
    async fn save(&self, result: &MergeResult) -> Result<()> {
        let slug = &result.plant.slug;
        if slug.is_empty() || slug.contains(['/', '\\']) || slug.starts_with('.') {
            bail!("refusing to persist record with slug {slug:?}");
        }
        let bytes = serde_json::to_vec_pretty(result).context("serializing canonical record")?;
        let path = self.path_for(slug);
        write_atomic(&path, &bytes)
            .await
            .with_context(|| format!("persisting {}", path.display()))
    }
}

/// Everything one species task needs; cloned into each spawned task.
#[derive(Clone)]
struct SpeciesJob {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    scraper: Option<Arc<PageScraper>>,
    engine: ReconciliationEngine,
    store: Arc<dyn PlantStore>,
    strategy: ConflictResolutionStrategy,
    fetch_timeout: Duration,
}

impl SpeciesJob {
    async fn process(&self, entry: &WorklistEntry) -> Result<SpeciesOutcome, SpeciesFailure> {
        let records = tokio::time::timeout(self.fetch_timeout, self.gather(entry))
            .await
            .map_err(|_| SpeciesFailure::Timeout {
                after_ms: u64::try_from(self.fetch_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        let result = self
            .engine
            .merge_for_slug(&entry.slug, &records, self.strategy)
            .map_err(|err| SpeciesFailure::Merge(err.to_string()))?;

        self.store
            .save(&result)
            .await
            .map_err(|err| SpeciesFailure::Persist(format!("{err:#}")))?;

        let outcome = SpeciesOutcome {
            conflicts: result.conflicts.len(),
            pending: result.pending_conflicts().count(),
        };
        info!(
            contributors = result.plant.contributors.len(),
            conflicts = outcome.conflicts,
            pending = outcome.pending,
            "species persisted"
        );
        Ok(outcome)
    }

    /// Structured records first; scraped pages only once at least one
    /// structured provider answered.
    async fn gather(&self, entry: &WorklistEntry) -> Result<Vec<ProviderRecord>, SpeciesFailure> {
        let mut records = Vec::new();
        let mut problems = Vec::new();

        for adapter in &self.adapters {
            let provider = adapter.provider();
            match fetch_structured(adapter.as_ref(), entry).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {
                    warn!(%provider, "no matching species");
                    problems.push(format!("{provider}: no matching species"));
                }
                Err(err) => {
                    warn!(%provider, error = %err, "provider fetch failed");
                    problems.push(format!("{provider}: {err}"));
                }
            }
        }

        if records.is_empty() {
            let reason = if problems.is_empty() {
                "no structured provider configured".to_string()
            } else {
                problems.join("; ")
            };
            return Err(SpeciesFailure::Fetch(reason));
        }

        if let Some(scraper) = &self.scraper {
            // Scraped pages carry no taxonomy; they adopt the structured providers' spelling.
            let scientific_name = records
                .iter()
                .find(|r| r.provider == ProviderId::Trefle)
                .unwrap_or(&records[0])
                .scientific_name
                .clone();
            for source in &entry.scrape_sources {
                let page = scraper.scrape(&entry.slug, source).await;
                match page.to_provider_record(&scientific_name) {
                    Some(record) => records.push(record),
                    None => debug!(source, "scrape contributed nothing"),
                }
            }
        }

        Ok(records)
    }
}

async fn fetch_structured(
    adapter: &dyn ProviderAdapter,
    entry: &WorklistEntry,
) -> Result<Option<ProviderRecord>, AdapterError> {
    let provider_ref = match entry.provider_ref(&adapter.provider()) {
        Some(id) => id.to_string(),
        None => match resolve(adapter, &entry.scientific_name).await? {
            Some(hit) => hit.provider_ref,
            None => return Ok(None),
        },
    };
    adapter.detail(&provider_ref).await.map(Some)
}

/// Runs one batch over a worklist with bounded concurrency. Holds no state
/// between runs apart from the shared response caches and call counts.
#[derive(Clone)]
pub struct SyncScheduler {
    job: Arc<SpeciesJob>,
    caches: Option<CacheRegistry>,
    api_calls: Option<Arc<ApiCallTracker>>,
    max_concurrency: usize,
    reports_dir: Option<PathBuf>,
}

impl SyncScheduler {
    pub fn new(store: Arc<dyn PlantStore>) -> Self {
        Self {
            job: Arc::new(SpeciesJob {
                adapters: Vec::new(),
                scraper: None,
                engine: ReconciliationEngine::default(),
                store,
                strategy: ConflictResolutionStrategy::default(),
                fetch_timeout: Duration::from_secs(30),
            }),
            caches: None,
            api_calls: None,
            max_concurrency: 4,
            reports_dir: None,
        }
    }

    /// Wire adapters, caches and the scraper from configuration. Providers
    /// without an API key are left out of every run.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn PlantStore>) -> Result<Self> {
        let http = config.http_fetcher()?;
        let caches = CacheRegistry::new(config.cache);

        let mut scheduler = Self::new(store)
            .with_strategy(config.conflict_strategy)
            .with_fetch_timeout(config.fetch_timeout)
            .with_max_concurrency(config.max_concurrency)
            .with_reports_dir(&config.reports_dir)
            .with_cache_registry(caches.clone())
            .with_api_calls(http.api_calls());

        for adapter in config.provider_adapters(&http) {
            let adapter: Arc<dyn ProviderAdapter> = match caches.for_provider(&adapter.provider()) {
                Some(provider_caches) => Arc::new(CachedAdapter::new(adapter, provider_caches)),
                None => adapter,
            };
            scheduler = scheduler.with_adapter(adapter);
        }

        let scraper = config.page_scraper(http)?;
        Ok(scheduler.with_scraper(scraper))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Arc::make_mut(&mut self.job).adapters.push(adapter);
        self
    }

    pub fn with_scraper(mut self, scraper: PageScraper) -> Self {
        Arc::make_mut(&mut self.job).scraper = Some(Arc::new(scraper));
        self
    }

    pub fn with_engine(mut self, engine: ReconciliationEngine) -> Self {
        Arc::make_mut(&mut self.job).engine = engine;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictResolutionStrategy) -> Self {
        Arc::make_mut(&mut self.job).strategy = strategy;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        Arc::make_mut(&mut self.job).fetch_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_cache_registry(mut self, caches: CacheRegistry) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn with_api_calls(mut self, tracker: Arc<ApiCallTracker>) -> Self {
        self.api_calls = Some(tracker);
        self
    }

    pub fn provider_count(&self) -> usize {
        self.job.adapters.len()
    }

    /// One batch over `worklist`. Per-species failures are collected in the
    /// summary; the run itself always completes.
    pub async fn run_once(&self, worklist: &[WorklistEntry]) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, species = worklist.len(), strategy = ?self.job.strategy, "sync run started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut outstanding: HashMap<String, usize> = HashMap::new();
        let mut tasks = JoinSet::new();
        for entry in worklist.iter().cloned() {
            *outstanding.entry(entry.slug.clone()).or_default() += 1;
            let job = Arc::clone(&self.job);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let span = info_span!("species", %run_id, slug = %entry.slug);
                let outcome = async {
                    match semaphore.acquire_owned().await {
                        Ok(_permit) => job.process(&entry).await,
                        Err(_) => Err(SpeciesFailure::Fetch("run cancelled".to_string())),
                    }
                }
                .instrument(span)
                .await;
                (entry.slug, outcome)
            });
        }

        let mut persisted = 0;
        let mut conflicts = 0;
        let mut pending_conflicts = 0;
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slug, outcome)) => {
                    if let Some(count) = outstanding.get_mut(&slug) {
                        *count -= 1;
                    }
                    match outcome {
                        Ok(outcome) => {
                            persisted += 1;
                            conflicts += outcome.conflicts;
                            pending_conflicts += outcome.pending;
                        }
                        Err(reason) => {
                            warn!(%run_id, %slug, %reason, "species skipped");
                            failures.push(FailedSpecies { slug, reason });
                        }
                    }
                }
                Err(err) => error!(%run_id, error = %err, "species task aborted"),
            }
        }
        for (slug, count) in outstanding {
            for _ in 0..count {
                failures.push(FailedSpecies {
                    slug: slug.clone(),
                    reason: SpeciesFailure::Fetch("species task aborted".to_string()),
                });
            }
        }
        failures.sort_by(|a, b| a.slug.cmp(&b.slug));

        let finished_at = Utc::now();
        let api_calls = match &self.api_calls {
            Some(tracker) => {
                let today = finished_at.date_naive();
                tracker.prune_before(today);
                tracker.day(today)
            }
            None => BTreeMap::new(),
        };

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            strategy: self.job.strategy,
            attempted: worklist.len(),
            persisted,
            failures,
            conflicts,
            pending_conflicts,
            cache: self
                .caches
                .as_ref()
                .map(|c| c.stats().into_iter().collect())
                .unwrap_or_default(),
            api_calls,
            reports_dir: None,
        };

        if let Some(root) = &self.reports_dir {
            let dir = root.join(run_id.to_string());
            summary.reports_dir = Some(dir.display().to_string());
            if let Err(err) = write_reports(&dir, &summary).await {
                warn!(%run_id, error = %format!("{err:#}"), "could not write run reports");
                summary.reports_dir = None;
            }
        }

        info!(
            %run_id,
            attempted = summary.attempted,
            persisted = summary.persisted,
            failed = summary.failures.len(),
            conflicts = summary.conflicts,
            "sync run finished"
        );
        summary
    }
}

async fn write_reports(dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("sync_brief.md"), render_brief(summary))
        .await
        .context("writing sync_brief.md")?;
    Ok(())
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let failures = if summary.failures.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failures
            .iter()
            .map(|f| format!("- {}: {}", f.slug, f.reason))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let cache = if summary.cache.is_empty() {
        "- disabled".to_string()
    } else {
        summary
            .cache
            .iter()
            .map(|(name, s)| {
                format!(
                    "- {}: {} hits, {} misses, {} evictions, {} expirations",
                    name, s.hits, s.misses, s.evictions, s.expirations
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let api_calls = if summary.api_calls.is_empty() {
        "- none recorded".to_string()
    } else {
        summary
            .api_calls
            .iter()
            .map(|(source, s)| format!("- {}: {} calls, {} failed", source, s.calls, s.failures))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# FLORA Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Strategy: {:?}\n- Species attempted: {}\n- Persisted: {}\n- Failed: {}\n- Conflicts recorded: {} ({} pending review)\n\n## Failures\n{}\n\n## Cache\n{}\n\n## API calls today (UTC)\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.strategy,
        summary.attempted,
        summary.persisted,
        summary.failures.len(),
        summary.conflicts,
        summary.pending_conflicts,
        failures,
        cache,
        api_calls
    )
}

/// Re-reads the worklist and runs the scheduler on a fixed interval.
pub struct SyncWorker {
    scheduler: SyncScheduler,
    worklist_path: PathBuf,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(scheduler: SyncScheduler, worklist_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            scheduler,
            worklist_path: worklist_path.into(),
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `None` when the worklist cannot be loaded; the cycle is skipped.
    pub async fn run_cycle(&self) -> Option<SyncRunSummary> {
        match load_worklist(&self.worklist_path).await {
            Ok(entries) => Some(self.scheduler.run_once(&entries).await),
            Err(err) => {
                error!(error = %format!("{err:#}"), "skipping sync cycle");
                None
            }
        }
    }

    /// Run until Ctrl-C, until `shutdown` flips to `true`, or until its sender
    /// is dropped. A run in progress is finished first. Returns the number of
    /// completed runs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, worklist = %self.worklist_path.display(), "sync worker started");

        let mut completed = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.run_cycle().await.is_some() {
                        completed += 1;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, stopping sync worker");
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, stopping sync worker");
                        break;
                    }
                }
            }
        }
        info!(completed, "sync worker stopped");
        completed
    }

    /// Run exactly `cycles` ticks and return the summaries of the runs that
    /// happened.
    pub async fn run_cycles(&self, cycles: usize) -> Vec<SyncRunSummary> {
        let mut ticker = interval(self.interval);
        let mut summaries = Vec::with_capacity(cycles);
        for cycle in 0..cycles {
            ticker.tick().await;
            debug!(cycle = cycle + 1, cycles, "sync cycle");
            if let Some(summary) = self.run_cycle().await {
                summaries.push(summary);
            }
        }
        summaries
    }
}
