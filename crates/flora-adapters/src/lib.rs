//! Structured provider adapters (Trefle, Perenual), the cached adapter wrapper
//! and the heuristic page scraper.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use flora_core::{
    GrowthHabit, HardinessRange, MaturityWindow, PhRange, PlantCycle, ProseSection, ProviderId,
    ProviderRecord, RootDepth, ScrapedRecord, SectionType, SpeciesSummary, SunNeeds, ToxicityLevel,
    WaterNeeds,
};
use flora_storage::{DomainThrottle, FetchError, HttpFetcher, PageArchive, ProviderCaches};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "flora-adapters";

/// Search hits scoring below this similarity to the query are ignored.
pub const MIN_RESOLVE_SCORE: f64 = 0.85;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{provider} has no record `{reference}`")]
    NotFound {
        provider: ProviderId,
        reference: String,
    },
    #[error("decoding {provider} response: {source}")]
    Decode {
        provider: ProviderId,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    async fn search(&self, query: &str) -> Result<Vec<SpeciesSummary>, AdapterError>;

    async fn detail(&self, provider_ref: &str) -> Result<ProviderRecord, AdapterError>;

    /// One page of the provider's full catalogue. Pages start at 1.
    async fn list(&self, page: u32) -> Result<Vec<SpeciesSummary>, AdapterError>;
}

/// Pick the search hit whose scientific name best matches `query`.
pub async fn resolve(
    adapter: &dyn ProviderAdapter,
    query: &str,
) -> Result<Option<SpeciesSummary>, AdapterError> {
    let hits = adapter.search(query).await?;
    Ok(best_match(query, hits))
}

fn best_match(query: &str, hits: Vec<SpeciesSummary>) -> Option<SpeciesSummary> {
    let wanted = normalize_query(query);
    hits.into_iter()
        .map(|hit| (jaro_winkler(&wanted, &normalize_query(&hit.scientific_name)), hit))
        .filter(|(score, _)| *score >= MIN_RESOLVE_SCORE)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, hit)| hit)
}

fn normalize_query(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn endpoint(base_url: &str, path: &str, params: &[(&str, &str)]) -> Result<String, AdapterError> {
    let raw = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse_with_params(&raw, params)
        .map(String::from)
        .map_err(|e| AdapterError::Message(format!("invalid endpoint {raw}: {e}")))
}

async fn get_json<T: DeserializeOwned>(
    http: &HttpFetcher,
    provider: ProviderId,
    url: &str,
    reference: &str,
) -> Result<T, AdapterError> {
    let response = match http.fetch_bytes(&provider.key(), url).await {
        Ok(response) => response,
        Err(err) if err.is_not_found() => {
            return Err(AdapterError::NotFound {
                provider,
                reference: reference.to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&response.body).map_err(|source| AdapterError::Decode { provider, source })
}

/// Providers disagree on whether some fields are a string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Booleans sometimes arrive as 0/1 or as text.
fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Bool(b)) => Some(b),
        Some(Lenient::Int(i)) => Some(i != 0),
        Some(Lenient::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        None => None,
    })
}

pub fn cycle_from_text(value: &str) -> Option<PlantCycle> {
    let lower = value.to_ascii_lowercase();
    if lower.contains("biennial") {
        Some(PlantCycle::Biennial)
    } else if lower.contains("perennial") {
        Some(PlantCycle::Perennial)
    } else if lower.contains("annual") {
        Some(PlantCycle::Annual)
    } else {
        None
    }
}

pub fn growth_habit_from_text(value: &str) -> Option<GrowthHabit> {
    let lower = value.to_ascii_lowercase();
    if lower.contains("vine") {
        Some(GrowthHabit::Vine)
    } else if lower.contains("climb") {
        Some(GrowthHabit::Climber)
    } else if lower.contains("shrub") || lower.contains("bush") {
        Some(GrowthHabit::Bush)
    } else if text_or_none(&lower).is_some() {
        Some(GrowthHabit::Other)
    } else {
        None
    }
}

/// Trefle light is 0 (no light) to 10 (very intensive insolation).
pub fn sun_from_light(light: u8) -> SunNeeds {
    if light >= 7 {
        SunNeeds::FullSun
    } else if light >= 4 {
        SunNeeds::PartShade
    } else {
        SunNeeds::Shade
    }
}

pub fn sun_from_text(value: &str) -> Option<SunNeeds> {
    let lower = value.to_ascii_lowercase();
    if lower.contains("full sun") {
        Some(SunNeeds::FullSun)
    } else if lower.contains("part") {
        Some(SunNeeds::PartShade)
    } else if lower.contains("shade") {
        Some(SunNeeds::Shade)
    } else {
        None
    }
}

pub fn water_from_text(value: &str) -> Option<WaterNeeds> {
    match value.trim().to_ascii_lowercase().as_str() {
        "frequent" => Some(WaterNeeds::Frequent),
        "average" | "moderate" => Some(WaterNeeds::Moderate),
        "minimum" | "minimal" | "low" | "none" => Some(WaterNeeds::Low),
        "high" => Some(WaterNeeds::High),
        _ => None,
    }
}

pub fn toxicity_from_text(value: &str) -> Option<ToxicityLevel> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Some(ToxicityLevel::None),
        "slight" | "low" => Some(ToxicityLevel::Low),
        "medium" | "moderate" => Some(ToxicityLevel::Moderate),
        "severe" | "high" => Some(ToxicityLevel::High),
        _ => None,
    }
}

pub fn root_depth_from_cm(cm: f64) -> RootDepth {
    if cm < 30.0 {
        RootDepth::Shallow
    } else if cm < 60.0 {
        RootDepth::Medium
    } else {
        RootDepth::Deep
    }
}

#[derive(Debug, Deserialize)]
struct TrefleListResponse {
    #[serde(default)]
    data: Vec<TrefleListItem>,
}

#[derive(Debug, Deserialize)]
struct TrefleListItem {
    id: u64,
    common_name: Option<String>,
    scientific_name: Option<String>,
}

impl TrefleListResponse {
    fn summaries(self) -> Vec<SpeciesSummary> {
        self.data
            .into_iter()
            .filter_map(|item| {
                Some(SpeciesSummary {
                    provider: ProviderId::Trefle,
                    provider_ref: item.id.to_string(),
                    scientific_name: item.scientific_name.and_then(text_or_none)?,
                    common_name: item.common_name.and_then(text_or_none),
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct TrefleDetailResponse {
    data: TreflePlant,
}

#[derive(Debug, Deserialize)]
struct TreflePlant {
    id: u64,
    common_name: Option<String>,
    scientific_name: Option<String>,
    family: Option<String>,
    genus: Option<String>,
    main_species: Option<TrefleSpecies>,
}

#[derive(Debug, Default, Deserialize)]
struct TrefleSpecies {
    scientific_name: Option<String>,
    family: Option<String>,
    genus: Option<String>,
    duration: Option<OneOrMany>,
    edible_part: Option<OneOrMany>,
    #[serde(default, deserialize_with = "lenient_bool")]
    edible: Option<bool>,
    #[serde(default)]
    common_names: BTreeMap<String, Vec<String>>,
    specifications: Option<TrefleSpecifications>,
    growth: Option<TrefleGrowth>,
}

#[derive(Debug, Default, Deserialize)]
struct TrefleSpecifications {
    growth_habit: Option<String>,
    toxicity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrefleGrowth {
    description: Option<String>,
    sowing: Option<String>,
    days_to_harvest: Option<f64>,
    ph_minimum: Option<f64>,
    ph_maximum: Option<f64>,
    light: Option<u8>,
    minimum_root_depth: Option<TrefleMeasurement>,
}

#[derive(Debug, Default, Deserialize)]
struct TrefleMeasurement {
    cm: Option<f64>,
}

impl TreflePlant {
    fn into_record(self) -> ProviderRecord {
        let species = self.main_species.unwrap_or_default();
        let scientific_name = self
            .scientific_name
            .or(species.scientific_name)
            .unwrap_or_default();

        let mut record = ProviderRecord::new(ProviderId::Trefle, scientific_name);
        record.provider_ref = Some(self.id.to_string());
        record.common_name = self.common_name.and_then(text_or_none);
        record.other_names = species
            .common_names
            .get("en")
            .into_iter()
            .flatten()
            .filter_map(text_or_none)
            .collect();
        record.family = species.family.or(self.family).and_then(text_or_none);
        record.genus = species.genus.or(self.genus).and_then(text_or_none);

        let attrs = &mut record.attributes;
        attrs.cycle = species
            .duration
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .find_map(|d| cycle_from_text(d));
        attrs.edible = species.edible;
        attrs.edible_parts = species
            .edible_part
            .map(|p| {
                p.into_vec()
                    .iter()
                    .filter_map(text_or_none)
                    .map(|s| s.to_lowercase())
                    .collect::<Vec<_>>()
            })
            .filter(|parts| !parts.is_empty());

        if let Some(spec) = species.specifications {
            attrs.growth_habit = spec.growth_habit.as_deref().and_then(growth_habit_from_text);
            attrs.toxicity = spec.toxicity.as_deref().and_then(toxicity_from_text);
        }

        if let Some(growth) = species.growth {
            attrs.sun_needs = growth.light.map(sun_from_light);
            attrs.ph_range = match (growth.ph_minimum, growth.ph_maximum) {
                (Some(min), Some(max)) => Some(PhRange { min, max }),
                _ => None,
            };
            attrs.maturity = growth
                .days_to_harvest
                .filter(|d| *d > 0.0)
                .map(|d| MaturityWindow {
                    min_days: d.round() as u32,
                    max_days: d.round() as u32,
                });
            attrs.root_depth = growth
                .minimum_root_depth
                .and_then(|m| m.cm)
                .map(root_depth_from_cm);
            if let Some(text) = growth.description.and_then(text_or_none) {
                record.prose.insert(ProseSection::Description, text);
            }
            if let Some(text) = growth.sowing.and_then(text_or_none) {
                record.prose.insert(ProseSection::PlantingGuide, text);
            }
        }

        record
    }
}

#[derive(Debug, Clone)]
pub struct TrefleAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    token: String,
}

impl TrefleAdapter {
    pub const DEFAULT_BASE_URL: &'static str = "https://trefle.io/api/v1";

    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for TrefleAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Trefle
    }

    async fn search(&self, query: &str) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let url = endpoint(&self.base_url, "plants/search", &[("token", self.token.as_str()), ("q", query)])?;
        let response: TrefleListResponse = get_json(&self.http, ProviderId::Trefle, &url, query).await?;
        Ok(response.summaries())
    }

    async fn detail(&self, provider_ref: &str) -> Result<ProviderRecord, AdapterError> {
        let url = endpoint(
            &self.base_url,
            &format!("plants/{provider_ref}"),
            &[("token", self.token.as_str())],
        )?;
        let response: TrefleDetailResponse =
            get_json(&self.http, ProviderId::Trefle, &url, provider_ref).await?;
        Ok(response.data.into_record())
    }

    async fn list(&self, page: u32) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let page = page.max(1).to_string();
        let url = endpoint(&self.base_url, "plants", &[("token", self.token.as_str()), ("page", page.as_str())])?;
        let response: TrefleListResponse = get_json(&self.http, ProviderId::Trefle, &url, &page).await?;
        Ok(response.summaries())
    }
}

#[derive(Debug, Deserialize)]
struct PerenualListResponse {
    #[serde(default)]
    data: Vec<PerenualListItem>,
}

#[derive(Debug, Deserialize)]
struct PerenualListItem {
    id: u64,
    common_name: Option<String>,
    scientific_name: Option<OneOrMany>,
}

#[derive(Debug, Default, Deserialize)]
struct PerenualDetail {
    id: u64,
    common_name: Option<String>,
    scientific_name: Option<OneOrMany>,
    other_name: Option<Vec<String>>,
    family: Option<String>,
    genus: Option<String>,
    cycle: Option<String>,
    watering: Option<String>,
    sunlight: Option<OneOrMany>,
    hardiness: Option<PerenualHardiness>,
    #[serde(default, deserialize_with = "lenient_bool")]
    poisonous_to_humans: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    drought_tolerant: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    edible_fruit: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    edible_leaf: Option<bool>,
    #[serde(rename = "xWateringPhLevel")]
    ph_level: Option<PerenualPhLevel>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PerenualHardiness {
    min: Option<String>,
    max: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PerenualPhLevel {
    min: Option<f64>,
    max: Option<f64>,
}

fn first_scientific_name(value: Option<OneOrMany>) -> Option<String> {
    value?.into_vec().into_iter().find_map(text_or_none)
}

impl PerenualListResponse {
    fn summaries(self) -> Vec<SpeciesSummary> {
        self.data
            .into_iter()
            .filter_map(|item| {
                Some(SpeciesSummary {
                    provider: ProviderId::Perenual,
                    provider_ref: item.id.to_string(),
                    scientific_name: first_scientific_name(item.scientific_name)?,
                    common_name: item.common_name.and_then(text_or_none),
                })
            })
            .collect()
    }
}

impl PerenualDetail {
    fn into_record(self) -> ProviderRecord {
        let scientific_name = first_scientific_name(self.scientific_name).unwrap_or_default();
        let mut record = ProviderRecord::new(ProviderId::Perenual, scientific_name);
        record.provider_ref = Some(self.id.to_string());
        record.common_name = self.common_name.and_then(text_or_none);
        record.other_names = self
            .other_name
            .unwrap_or_default()
            .into_iter()
            .filter_map(text_or_none)
            .collect();
        record.family = self.family.and_then(text_or_none);
        record.genus = self.genus.and_then(text_or_none);

        let attrs = &mut record.attributes;
        attrs.cycle = self.cycle.as_deref().and_then(cycle_from_text);
        attrs.water_needs = self.watering.as_deref().and_then(water_from_text);
        attrs.sun_needs = self
            .sunlight
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .find_map(|s| sun_from_text(s));
        attrs.hardiness = self.hardiness.and_then(|h| {
            Some(HardinessRange {
                min_zone: h.min.and_then(text_or_none)?,
                max_zone: h.max.and_then(text_or_none)?,
            })
        });
        attrs.toxicity = self.poisonous_to_humans.map(|poisonous| {
            if poisonous {
                ToxicityLevel::Moderate
            } else {
                ToxicityLevel::None
            }
        });
        attrs.drought_tolerant = self.drought_tolerant;
        attrs.ph_range = self.ph_level.and_then(|ph| {
            Some(PhRange {
                min: ph.min?,
                max: ph.max?,
            })
        });

        let mut parts = Vec::new();
        if self.edible_fruit == Some(true) {
            parts.push("fruit".to_string());
        }
        if self.edible_leaf == Some(true) {
            parts.push("leaf".to_string());
        }
        attrs.edible = match (self.edible_fruit, self.edible_leaf) {
            (None, None) => None,
            _ => Some(!parts.is_empty()),
        };
        attrs.edible_parts = Some(parts).filter(|p| !p.is_empty());

        if let Some(text) = self.description.and_then(text_or_none) {
            record.prose.insert(ProseSection::Description, text);
        }
        record
    }
}

#[derive(Debug, Clone)]
pub struct PerenualAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    key: String,
}

impl PerenualAdapter {
    pub const DEFAULT_BASE_URL: &'static str = "https://perenual.com/api";

    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for PerenualAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Perenual
    }

    async fn search(&self, query: &str) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let url = endpoint(&self.base_url, "species-list", &[("key", self.key.as_str()), ("q", query)])?;
        let response: PerenualListResponse =
            get_json(&self.http, ProviderId::Perenual, &url, query).await?;
        Ok(response.summaries())
    }

    async fn detail(&self, provider_ref: &str) -> Result<ProviderRecord, AdapterError> {
        let url = endpoint(
            &self.base_url,
            &format!("species/details/{provider_ref}"),
            &[("key", self.key.as_str())],
        )?;
        let detail: PerenualDetail = get_json(&self.http, ProviderId::Perenual, &url, provider_ref).await?;
        Ok(detail.into_record())
    }

    async fn list(&self, page: u32) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let page = page.max(1).to_string();
        let url = endpoint(&self.base_url, "species-list", &[("key", self.key.as_str()), ("page", page.as_str())])?;
        let response: PerenualListResponse =
            get_json(&self.http, ProviderId::Perenual, &url, &page).await?;
        Ok(response.summaries())
    }
}

/// Serves search, detail and list calls from the provider's caches. Failures pass
/// through uncached.
#[derive(Clone)]
pub struct CachedAdapter {
    inner: Arc<dyn ProviderAdapter>,
    caches: ProviderCaches,
}

impl CachedAdapter {
    pub fn new(inner: Arc<dyn ProviderAdapter>, caches: ProviderCaches) -> Self {
        Self { inner, caches }
    }
}

#[async_trait]
impl ProviderAdapter for CachedAdapter {
    fn provider(&self) -> ProviderId {
        self.inner.provider()
    }

    async fn search(&self, query: &str) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let key = normalize_query(query);
        if let Some(hits) = self.caches.search.get(&key) {
            debug!(cache = self.caches.search.name(), %key, "cache hit");
            return Ok(hits);
        }
        let hits = self.inner.search(query).await?;
        self.caches.search.put(key, hits.clone());
        Ok(hits)
    }

    async fn detail(&self, provider_ref: &str) -> Result<ProviderRecord, AdapterError> {
        if let Some(record) = self.caches.detail.get(provider_ref) {
            debug!(cache = self.caches.detail.name(), provider_ref, "cache hit");
            return Ok(record);
        }
        let record = self.inner.detail(provider_ref).await?;
        self.caches.detail.put(provider_ref, record.clone());
        Ok(record)
    }

    async fn list(&self, page: u32) -> Result<Vec<SpeciesSummary>, AdapterError> {
        let key = page.max(1).to_string();
        if let Some(hits) = self.caches.list.get(&key) {
            debug!(cache = self.caches.list.name(), page, "cache hit");
            return Ok(hits);
        }
        let hits = self.inner.list(page).await?;
        self.caches.list.put(key, hits.clone());
        Ok(hits)
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unknown scrape source `{0}`")]
    UnknownSource(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid page url `{0}`")]
    Url(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// How to locate a scraped site's pages and their fixed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub source_id: String,
    pub display_name: String,
    /// Page URL with a `{slug}` placeholder.
    pub url_template: String,
    pub title_selectors: Vec<String>,
    pub description_selectors: Vec<String>,
    /// Paragraphs scanned by keyword fallbacks.
    pub content_selectors: Vec<String>,
}

impl SiteProfile {
    pub fn almanac() -> Self {
        Self {
            source_id: "almanac.com".to_string(),
            display_name: "Almanac.com".to_string(),
            url_template: "https://www.almanac.com/plant/{slug}".to_string(),
            title_selectors: vec!["h1.page-title".to_string()],
            description_selectors: vec![
                ".field--name-body .field__item p".to_string(),
                "article .content p".to_string(),
            ],
            content_selectors: vec![
                "article .content p".to_string(),
                ".field--name-body p".to_string(),
            ],
        }
    }

    pub fn url_for(&self, slug: &str) -> String {
        self.url_template.replace("{slug}", slug)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRule {
    /// Case-insensitive fragments matched against `h2`/`h3` text.
    #[serde(default)]
    pub headings: Vec<String>,
    /// Paragraph keywords used when no heading matched.
    #[serde(default)]
    pub paragraph_fallback: Vec<String>,
    /// Take only the first matching heading, without a `###` title line.
    #[serde(default)]
    pub first_heading_only: bool,
}

impl SectionRule {
    fn new(headings: &[&str]) -> Self {
        Self {
            headings: headings.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// Heading keywords per prose section, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionRules {
    pub companions: SectionRule,
    pub planting_guide: SectionRule,
    pub care_instructions: SectionRule,
    pub harvest_info: SectionRule,
    pub pests_and_diseases: SectionRule,
}

impl Default for SectionRules {
    fn default() -> Self {
        Self {
            companions: SectionRule {
                headings: vec!["companion".into(), "plant with".into()],
                paragraph_fallback: vec![
                    "companion".into(),
                    "plant with".into(),
                    "grows well with".into(),
                    "avoid planting".into(),
                ],
                first_heading_only: true,
            },
            planting_guide: SectionRule::new(&["planting", "when to plant", "how to plant"]),
            care_instructions: SectionRule::new(&["care", "growing", "watering", "fertiliz"]),
            harvest_info: SectionRule::new(&["harvest", "when to harvest", "how to harvest"]),
            pests_and_diseases: SectionRule::new(&["pest", "disease", "problem"]),
        }
    }
}

impl SectionRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing section rules")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn rule(&self, section: SectionType) -> Option<&SectionRule> {
        match section {
            SectionType::Companions => Some(&self.companions),
            SectionType::PlantingGuide => Some(&self.planting_guide),
            SectionType::CareInstructions => Some(&self.care_instructions),
            SectionType::HarvestInfo => Some(&self.harvest_info),
            SectionType::PestsAndDiseases => Some(&self.pests_and_diseases),
            SectionType::CommonName | SectionType::Description => None,
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(document: &Html, selectors: &[String]) -> Result<Option<String>, ExtractionError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        if let Some(text) = document.select(&sel).find_map(|e| text_or_none(element_text(e))) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

/// Content between a heading and the next `h1`-`h4` sibling.
fn text_after_heading(heading: ElementRef<'_>, list_items: &Selector) -> String {
    let mut parts = Vec::new();
    for sibling in heading.next_siblings().filter_map(ElementRef::wrap) {
        match sibling.value().name() {
            "h1" | "h2" | "h3" | "h4" => break,
            "p" => parts.extend(text_or_none(element_text(sibling))),
            "ul" | "ol" => parts.extend(
                sibling
                    .select(list_items)
                    .map(|li| format!("- {}", element_text(li))),
            ),
            "div" => {
                let text = element_text(sibling);
                if text.chars().count() > 20 {
                    parts.push(text);
                }
            }
            _ => {}
        }
    }
    parts.join("\n").trim().to_string()
}

struct SectionExtractor<'a> {
    document: &'a Html,
    headings: Selector,
    list_items: Selector,
    paragraphs: Vec<Selector>,
}

impl<'a> SectionExtractor<'a> {
    fn new(document: &'a Html, profile: &SiteProfile) -> Result<Self, ExtractionError> {
        Ok(Self {
            document,
            headings: parse_selector("h2, h3")?,
            list_items: parse_selector("li")?,
            paragraphs: profile
                .content_selectors
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<_, _>>()?,
        })
    }

    fn section(&self, rule: &SectionRule) -> Option<String> {
        let matching = self
            .document
            .select(&self.headings)
            .filter(|h| contains_any(&element_text(*h), &rule.headings))
            .collect::<Vec<_>>();

        if let Some(first) = matching.first() {
            if rule.first_heading_only {
                return text_or_none(text_after_heading(*first, &self.list_items));
            }
            let joined = matching
                .iter()
                .map(|h| {
                    format!(
                        "### {}\n{}",
                        element_text(*h),
                        text_after_heading(*h, &self.list_items)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            return text_or_none(joined);
        }

        if rule.paragraph_fallback.is_empty() {
            return None;
        }
        let mut seen = Vec::new();
        for sel in &self.paragraphs {
            for p in self.document.select(sel) {
                let text = element_text(p);
                if contains_any(&text, &rule.paragraph_fallback) && !seen.contains(&text) {
                    seen.push(text);
                }
            }
        }
        text_or_none(seen.join("\n\n"))
    }
}

/// Parse a fetched page into a scraped record. Missing sections stay unset.
pub fn extract_page(
    profile: &SiteProfile,
    rules: &SectionRules,
    slug: &str,
    url: &str,
    html: &str,
) -> Result<ScrapedRecord, ExtractionError> {
    let document = Html::parse_document(html);
    let mut record = ScrapedRecord::empty(slug, &profile.source_id, url);

    let common_name = match first_text(&document, &profile.title_selectors)? {
        Some(name) => Some(name),
        None => first_text(&document, &["title".to_string()])?
            .and_then(|title| title.split('|').next().and_then(text_or_none)),
    };
    record.set_section(SectionType::CommonName, common_name);
    record.set_section(
        SectionType::Description,
        first_text(&document, &profile.description_selectors)?,
    );

    let extractor = SectionExtractor::new(&document, profile)?;
    for section in SectionType::ALL {
        if let Some(rule) = rules.rule(section) {
            record.set_section(section, extractor.section(rule));
        }
    }

    record.raw_html = html.to_string();
    Ok(record)
}

/// Fetches and classifies pages from known sites.
#[derive(Debug)]
pub struct PageScraper {
    http: Arc<HttpFetcher>,
    throttle: DomainThrottle,
    profiles: HashMap<String, SiteProfile>,
    rules: SectionRules,
    archive: Option<PageArchive>,
}

impl PageScraper {
    pub fn new(http: Arc<HttpFetcher>, throttle: DomainThrottle) -> Self {
        let almanac = SiteProfile::almanac();
        Self {
            http,
            throttle,
            profiles: HashMap::from([(almanac.source_id.clone(), almanac)]),
            rules: SectionRules::default(),
            archive: None,
        }
    }

    pub fn with_profile(mut self, profile: SiteProfile) -> Self {
        self.profiles.insert(profile.source_id.clone(), profile);
        self
    }

    pub fn with_rules(mut self, rules: SectionRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn profile(&self, source: &str) -> Option<&SiteProfile> {
        self.profiles.get(source)
    }

    /// Never fails: fetch and parse errors produce an unsuccessful record.
    pub async fn scrape(&self, slug: &str, source: &str) -> ScrapedRecord {
        let url = self.profile(source).map(|p| p.url_for(slug)).unwrap_or_default();
        match self.try_scrape(slug, source).await {
            Ok(record) => {
                let sections = SectionType::ALL
                    .iter()
                    .filter(|s| record.section(**s).is_some())
                    .count();
                info!(slug, source, sections, "scraped page");
                record
            }
            Err(err) => {
                warn!(slug, source, error = %err, "scrape failed");
                ScrapedRecord::failed(slug, source, url, err.to_string())
            }
        }
    }

    async fn try_scrape(&self, slug: &str, source: &str) -> Result<ScrapedRecord, ExtractionError> {
        let profile = self
            .profile(source)
            .ok_or_else(|| ExtractionError::UnknownSource(source.to_string()))?;
        let url = profile.url_for(slug);
        let domain = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| ExtractionError::Url(url.clone()))?;

        self.throttle.wait(&domain).await;
        let fetched = self.http.fetch_bytes(&profile.source_id, &url).await?;
        let html = String::from_utf8_lossy(&fetched.body);
        let record = extract_page(profile, &self.rules, slug, &url, &html)?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_page(&profile.source_id, slug, record.scraped_at, &record.raw_html)
                .await
            {
                warn!(slug, source, error = %err, "failed to archive page");
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flora_storage::{CacheConfig, CacheRegistry};

    const TOMATO_PAGE: &str = r#"
<html><head><title>Tomatoes | Planting, Growing, and Harvesting | The Old Farmer's Almanac</title></head>
<body><article><div class="content">
  <h1 class="page-title">Tomatoes</h1>
  <div class="field--name-body"><div class="field__item">
    <p>Tomatoes are the most popular garden vegetable.</p>
  </div></div>
  <h2>Planting</h2>
  <p>Plant after the last spring frost.</p>
  <ul><li>Full sun</li><li>Rich soil</li></ul>
  <h3>How to Plant Tomatoes</h3>
  <p>Set stakes at planting time.</p>
  <h2>Growing</h2>
  <p>Water deeply and regularly.</p>
  <div>short</div>
  <div>Mulch five weeks after transplanting to retain moisture.</div>
  <h2>Harvesting</h2>
  <p>Pick when firm and fully colored.</p>
  <p>Basil is a good companion for tomatoes.</p>
</div></article></body></html>
"#;

    #[test]
    fn extracts_headed_sections_and_keyword_companions() {
        let profile = SiteProfile::almanac();
        let record = extract_page(
            &profile,
            &SectionRules::default(),
            "tomatoes",
            &profile.url_for("tomatoes"),
            TOMATO_PAGE,
        )
        .unwrap();

        assert!(record.successful);
        assert_eq!(record.url, "https://www.almanac.com/plant/tomatoes");
        assert_eq!(record.common_name.as_deref(), Some("Tomatoes"));
        assert_eq!(
            record.description.as_deref(),
            Some("Tomatoes are the most popular garden vegetable.")
        );
        assert_eq!(
            record.planting_guide.as_deref(),
            Some(
                "### Planting\nPlant after the last spring frost.\n- Full sun\n- Rich soil\n\n\
                 ### How to Plant Tomatoes\nSet stakes at planting time."
            )
        );
        assert_eq!(
            record.care_instructions.as_deref(),
            Some("### Growing\nWater deeply and regularly.\nMulch five weeks after transplanting to retain moisture.")
        );
        assert!(record.harvest_info.as_deref().unwrap().starts_with("### Harvesting\nPick when firm"));
        assert_eq!(
            record.companion_section.as_deref(),
            Some("Basil is a good companion for tomatoes.")
        );
        assert_eq!(record.pests_and_diseases, None);
        assert!(!record.raw_html.is_empty());
    }

    #[test]
    fn title_tag_is_fallback_for_common_name() {
        let profile = SiteProfile::almanac();
        let html = "<html><head><title>Basil | Almanac</title></head><body><p>x</p></body></html>";
        let record = extract_page(&profile, &SectionRules::default(), "basil", "u", html).unwrap();
        assert_eq!(record.common_name.as_deref(), Some("Basil"));
        assert_eq!(record.description, None);
        assert_eq!(record.companion_section, None);
    }

    #[test]
    fn companion_heading_takes_first_match_only() {
        let profile = SiteProfile::almanac();
        let html = r#"<html><body>
            <h2>Companion Plants</h2><p>Carrots and basil.</p>
            <h3>Plant With Care</h3><p>Not this.</p>
        </body></html>"#;
        let record = extract_page(&profile, &SectionRules::default(), "x", "u", html).unwrap();
        assert_eq!(record.companion_section.as_deref(), Some("Carrots and basil."));
    }

    #[test]
    fn invalid_profile_selector_is_an_extraction_error() {
        let mut profile = SiteProfile::almanac();
        profile.title_selectors = vec!["h1[".to_string()];
        let err = extract_page(&profile, &SectionRules::default(), "x", "u", "<p></p>").unwrap_err();
        assert!(matches!(err, ExtractionError::Selector { .. }));
    }

    #[test]
    fn section_rules_load_from_yaml_with_defaults() {
        let rules = SectionRules::from_yaml_str(
            r#"
pests_and_diseases:
  headings: ["insects", "blight"]
"#,
        )
        .unwrap();
        assert_eq!(rules.pests_and_diseases.headings, vec!["insects", "blight"]);
        assert_eq!(rules.companions, SectionRules::default().companions);
        assert!(rules.rule(SectionType::CommonName).is_none());

        let bundled = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/sections.yaml");
        let from_file = SectionRules::from_yaml_file(bundled).unwrap();
        assert_eq!(from_file, SectionRules::default());
    }

    #[test]
    fn trefle_detail_maps_attributes() {
        let json = r#"{"data": {
            "id": 1, "common_name": "Garden tomato", "scientific_name": "Solanum lycopersicum",
            "main_species": {
                "family": "Solanaceae", "genus": "Solanum", "duration": ["annual"],
                "edible_part": ["Fruits"], "edible": true,
                "common_names": {"en": ["Tomato", " "]},
                "specifications": {"growth_habit": "Forb/herb", "toxicity": "low"},
                "growth": {"ph_minimum": 5.5, "ph_maximum": 7.5, "days_to_harvest": 70,
                           "light": 8, "minimum_root_depth": {"cm": 45},
                           "sowing": "Sow indoors 6 weeks before frost."}
            }}}"#;
        let response: TrefleDetailResponse = serde_json::from_str(json).unwrap();
        let record = response.data.into_record();

        assert_eq!(record.provider_ref.as_deref(), Some("1"));
        assert_eq!(record.family.as_deref(), Some("Solanaceae"));
        assert_eq!(record.other_names, vec!["Tomato".to_string()]);
        let a = &record.attributes;
        assert_eq!(a.cycle, Some(PlantCycle::Annual));
        assert_eq!(a.sun_needs, Some(SunNeeds::FullSun));
        assert_eq!(a.ph_range, Some(PhRange { min: 5.5, max: 7.5 }));
        assert_eq!(a.maturity, Some(MaturityWindow { min_days: 70, max_days: 70 }));
        assert_eq!(a.root_depth, Some(RootDepth::Medium));
        assert_eq!(a.toxicity, Some(ToxicityLevel::Low));
        assert_eq!(a.growth_habit, Some(GrowthHabit::Other));
        assert_eq!(a.edible_parts, Some(vec!["fruits".to_string()]));
        assert!(record.prose.contains_key(&ProseSection::PlantingGuide));
    }

    #[test]
    fn perenual_detail_accepts_numeric_booleans() {
        let json = r#"{
            "id": 7, "common_name": "tomato", "scientific_name": ["Solanum lycopersicum"],
            "other_name": ["Tomate"], "family": "Solanaceae", "cycle": "Annual",
            "watering": "Frequent", "sunlight": ["full sun"],
            "hardiness": {"min": "10", "max": "11"},
            "poisonous_to_humans": 1, "drought_tolerant": false,
            "edible_fruit": true, "edible_leaf": 0, "description": "A fruit."
        }"#;
        let detail: PerenualDetail = serde_json::from_str(json).unwrap();
        let record = detail.into_record();

        assert_eq!(record.scientific_name, "Solanum lycopersicum");
        assert_eq!(record.other_names, vec!["Tomate".to_string()]);
        let a = &record.attributes;
        assert_eq!(a.water_needs, Some(WaterNeeds::Frequent));
        assert_eq!(a.toxicity, Some(ToxicityLevel::Moderate));
        assert_eq!(a.drought_tolerant, Some(false));
        assert_eq!(a.edible, Some(true));
        assert_eq!(a.edible_parts, Some(vec!["fruit".to_string()]));
        assert_eq!(
            a.hardiness,
            Some(HardinessRange { min_zone: "10".into(), max_zone: "11".into() })
        );
    }

    #[test]
    fn text_mappings_cover_provider_vocabularies() {
        assert_eq!(cycle_from_text("Herbaceous Perennial"), Some(PlantCycle::Perennial));
        assert_eq!(cycle_from_text("Biennial"), Some(PlantCycle::Biennial));
        assert_eq!(sun_from_light(5), SunNeeds::PartShade);
        assert_eq!(sun_from_light(2), SunNeeds::Shade);
        assert_eq!(sun_from_text("part shade"), Some(SunNeeds::PartShade));
        assert_eq!(water_from_text("Average"), Some(WaterNeeds::Moderate));
        assert_eq!(root_depth_from_cm(10.0), RootDepth::Shallow);
        assert_eq!(root_depth_from_cm(90.0), RootDepth::Deep);
        assert_eq!(growth_habit_from_text("Vine"), Some(GrowthHabit::Vine));
    }

    fn summary(name: &str, id: &str) -> SpeciesSummary {
        SpeciesSummary {
            provider: ProviderId::Trefle,
            provider_ref: id.to_string(),
            scientific_name: name.to_string(),
            common_name: None,
        }
    }

    #[test]
    fn best_match_prefers_closest_scientific_name() {
        let hits = vec![
            summary("Solanum tuberosum", "1"),
            summary("Solanum lycopersicum", "2"),
            summary("Lycopersicon esculentum", "3"),
        ];
        let best = best_match("solanum  lycopersicum", hits).unwrap();
        assert_eq!(best.provider_ref, "2");
        assert!(best_match("Ocimum basilicum", vec![summary("Zea mays", "9")]).is_none());
    }

    struct CountingAdapter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        fn provider(&self) -> ProviderId {
            ProviderId::Trefle
        }

        async fn search(&self, _query: &str) -> Result<Vec<SpeciesSummary>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterError::Message("provider down".into()));
            }
            Ok(vec![summary("Solanum lycopersicum", "2")])
        }

        async fn detail(&self, provider_ref: &str) -> Result<ProviderRecord, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterError::NotFound {
                    provider: ProviderId::Trefle,
                    reference: provider_ref.to_string(),
                });
            }
            Ok(ProviderRecord::new(ProviderId::Trefle, "Solanum lycopersicum"))
        }

        async fn list(&self, page: u32) -> Result<Vec<SpeciesSummary>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterError::Message("provider down".into()));
            }
            Ok(vec![summary("Solanum lycopersicum", &page.to_string())])
        }
    }

    #[tokio::test]
    async fn cached_adapter_serves_repeats_from_cache() {
        let registry = CacheRegistry::new(CacheConfig::default());
        let inner = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cached = CachedAdapter::new(inner.clone(), registry.for_provider(&ProviderId::Trefle).unwrap());

        cached.search("Solanum lycopersicum").await.unwrap();
        cached.search("  solanum lycopersicum ").await.unwrap();
        cached.detail("2").await.unwrap();
        cached.detail("2").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        let resolved = resolve(&cached, "Solanum lycopersicum").await.unwrap();
        assert_eq!(resolved.unwrap().provider_ref, "2");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_adapter_keys_list_pages_separately() {
        let registry = CacheRegistry::new(CacheConfig::default());
        let inner = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let caches = registry.for_provider(&ProviderId::Trefle).unwrap();
        let cached = CachedAdapter::new(inner.clone(), caches.clone());

        cached.list(1).await.unwrap();
        cached.list(1).await.unwrap();
        let second = cached.list(2).await.unwrap();
        assert_eq!(second[0].provider_ref, "2");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(caches.list.len(), 2);
        assert!(caches.search.is_empty());
    }

    #[tokio::test]
    async fn cached_adapter_never_caches_failures() {
        let registry = CacheRegistry::new(CacheConfig::default());
        let inner = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let caches = registry.for_provider(&ProviderId::Trefle).unwrap();
        let cached = CachedAdapter::new(inner.clone(), caches.clone());

        assert!(cached.detail("2").await.is_err());
        assert!(cached.detail("2").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(caches.detail.is_empty());
    }
}
