//! Core botanical data model and provenance types for FLORA.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flora-core";

/// Origin of a species record. `Trefle` and `Perenual` are structured APIs;
/// `Scraped` carries the site identifier of a scraped page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Trefle,
    Perenual,
    Scraped(String),
}

impl ProviderId {
    pub fn scraped(site: impl Into<String>) -> Self {
        Self::Scraped(site.into())
    }

    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::Scraped(_))
    }

    /// Stable key used in logs, cache names and persisted conflicts.
    pub fn key(&self) -> String {
        match self {
            Self::Trefle => "trefle".to_string(),
            Self::Perenual => "perenual".to_string(),
            Self::Scraped(site) => format!("scraped:{site}"),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized value `{value}` for {kind}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for ProviderId {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "trefle" => Ok(Self::Trefle),
            "perenual" => Ok(Self::Perenual),
            _ => match trimmed.split_once(':') {
                Some((prefix, site)) if prefix.eq_ignore_ascii_case("scraped") && !site.is_empty() => {
                    Ok(Self::Scraped(site.to_string()))
                }
                _ => Err(ParseEnumError {
                    kind: "provider id",
                    value: s.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Tie-break policy applied when structured providers disagree on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionStrategy {
    #[default]
    PreferTrefle,
    PreferPerenual,
    Manual,
}

impl ConflictResolutionStrategy {
    pub fn preferred_provider(self) -> Option<ProviderId> {
        match self {
            Self::PreferTrefle => Some(ProviderId::Trefle),
            Self::PreferPerenual => Some(ProviderId::Perenual),
            Self::Manual => None,
        }
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PREFER_TREFLE" => Ok(Self::PreferTrefle),
            "PREFER_PERENUAL" => Ok(Self::PreferPerenual),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(ParseEnumError {
                kind: "conflict resolution strategy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlantCycle {
    Annual,
    Biennial,
    Perennial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrowthHabit {
    Bush,
    Vine,
    Climber,
    Root,
    Leaf,
    Fruiting,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SunNeeds {
    FullSun,
    PartShade,
    Shade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaterNeeds {
    Low,
    Moderate,
    High,
    Frequent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToxicityLevel {
    None,
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootDepth {
    Shallow,
    Medium,
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhRange {
    pub min: f64,
    pub max: f64,
}

/// Days from sowing to first harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaturityWindow {
    pub min_days: u32,
    pub max_days: u32,
}

/// USDA hardiness zones, kept as text since providers report values like "5a".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardinessRange {
    pub min_zone: String,
    pub max_zone: String,
}

/// Optional attribute set a provider may report for a species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SpeciesAttributes {
    pub cycle: Option<PlantCycle>,
    pub growth_habit: Option<GrowthHabit>,
    pub sun_needs: Option<SunNeeds>,
    pub water_needs: Option<WaterNeeds>,
    pub ph_range: Option<PhRange>,
    pub maturity: Option<MaturityWindow>,
    pub toxicity: Option<ToxicityLevel>,
    pub edible: Option<bool>,
    pub edible_parts: Option<Vec<String>>,
    pub root_depth: Option<RootDepth>,
    pub hardiness: Option<HardinessRange>,
    pub drought_tolerant: Option<bool>,
}

/// Descriptive free-text sections. These are concatenated across providers
/// instead of being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProseSection {
    Description,
    Companions,
    PlantingGuide,
    CareInstructions,
    HarvestInfo,
    PestsAndDiseases,
}

impl ProseSection {
    pub const ALL: [ProseSection; 6] = [
        ProseSection::Description,
        ProseSection::Companions,
        ProseSection::PlantingGuide,
        ProseSection::CareInstructions,
        ProseSection::HarvestInfo,
        ProseSection::PestsAndDiseases,
    ];
}

/// One provider's normalized view of a species. Built once per fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider: ProviderId,
    pub provider_ref: Option<String>,
    pub scientific_name: String,
    pub common_name: Option<String>,
    #[serde(default)]
    pub other_names: Vec<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    #[serde(default)]
    pub attributes: SpeciesAttributes,
    #[serde(default)]
    pub prose: BTreeMap<ProseSection, String>,
    pub fetched_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn new(provider: ProviderId, scientific_name: impl Into<String>) -> Self {
        Self {
            provider,
            provider_ref: None,
            scientific_name: scientific_name.into(),
            common_name: None,
            other_names: Vec::new(),
            family: None,
            genus: None,
            attributes: SpeciesAttributes::default(),
            prose: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn has_identity(&self) -> bool {
        canonical_scientific_name(&self.scientific_name).is_some()
    }

    /// The common name this record contributes: the explicit one, else the
    /// first alternate name.
    pub fn contributed_common_name(&self) -> Option<&str> {
        self.common_name
            .as_deref()
            .and_then(non_blank)
            .or_else(|| self.other_names.iter().find_map(|n| non_blank(n)))
    }
}

/// A search hit from a structured provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesSummary {
    pub provider: ProviderId,
    pub provider_ref: String,
    pub scientific_name: String,
    pub common_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionType {
    CommonName,
    Description,
    Companions,
    PlantingGuide,
    CareInstructions,
    HarvestInfo,
    PestsAndDiseases,
}

impl SectionType {
    pub const ALL: [SectionType; 7] = [
        SectionType::CommonName,
        SectionType::Description,
        SectionType::Companions,
        SectionType::PlantingGuide,
        SectionType::CareInstructions,
        SectionType::HarvestInfo,
        SectionType::PestsAndDiseases,
    ];

    pub fn prose_section(self) -> Option<ProseSection> {
        match self {
            SectionType::CommonName => None,
            SectionType::Description => Some(ProseSection::Description),
            SectionType::Companions => Some(ProseSection::Companions),
            SectionType::PlantingGuide => Some(ProseSection::PlantingGuide),
            SectionType::CareInstructions => Some(ProseSection::CareInstructions),
            SectionType::HarvestInfo => Some(ProseSection::HarvestInfo),
            SectionType::PestsAndDiseases => Some(ProseSection::PestsAndDiseases),
        }
    }
}

/// Output of one page scrape. A failed scrape keeps every content field unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub slug: String,
    pub source: String,
    pub url: String,
    pub common_name: Option<String>,
    pub description: Option<String>,
    pub companion_section: Option<String>,
    pub planting_guide: Option<String>,
    pub care_instructions: Option<String>,
    pub harvest_info: Option<String>,
    pub pests_and_diseases: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub raw_html: String,
    pub scraped_at: DateTime<Utc>,
    pub successful: bool,
    pub error_message: Option<String>,
}

impl ScrapedRecord {
    pub fn empty(slug: impl Into<String>, source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            source: source.into(),
            url: url.into(),
            common_name: None,
            description: None,
            companion_section: None,
            planting_guide: None,
            care_instructions: None,
            harvest_info: None,
            pests_and_diseases: None,
            raw_html: String::new(),
            scraped_at: Utc::now(),
            successful: true,
            error_message: None,
        }
    }

    pub fn failed(
        slug: impl Into<String>,
        source: impl Into<String>,
        url: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            successful: false,
            error_message: Some(error.into()),
            ..Self::empty(slug, source, url)
        }
    }

    pub fn section(&self, section: SectionType) -> Option<&str> {
        match section {
            SectionType::CommonName => self.common_name.as_deref(),
            SectionType::Description => self.description.as_deref(),
            SectionType::Companions => self.companion_section.as_deref(),
            SectionType::PlantingGuide => self.planting_guide.as_deref(),
            SectionType::CareInstructions => self.care_instructions.as_deref(),
            SectionType::HarvestInfo => self.harvest_info.as_deref(),
            SectionType::PestsAndDiseases => self.pests_and_diseases.as_deref(),
        }
    }

    pub fn set_section(&mut self, section: SectionType, text: Option<String>) {
        let slot = match section {
            SectionType::CommonName => &mut self.common_name,
            SectionType::Description => &mut self.description,
            SectionType::Companions => &mut self.companion_section,
            SectionType::PlantingGuide => &mut self.planting_guide,
            SectionType::CareInstructions => &mut self.care_instructions,
            SectionType::HarvestInfo => &mut self.harvest_info,
            SectionType::PestsAndDiseases => &mut self.pests_and_diseases,
        };
        *slot = text.and_then(|t| non_blank(&t).map(ToString::to_string));
    }

    pub fn has_content(&self) -> bool {
        SectionType::ALL.iter().any(|s| self.section(*s).is_some())
    }

    /// Weak-confidence provider view of a successful scrape. Scraped pages
    /// carry no authoritative taxonomy, so the caller supplies the species.
    pub fn to_provider_record(&self, scientific_name: &str) -> Option<ProviderRecord> {
        if !self.successful {
            return None;
        }
        let mut record = ProviderRecord::new(ProviderId::scraped(self.source.clone()), scientific_name);
        record.provider_ref = Some(self.url.clone());
        record.common_name = self.common_name.clone();
        record.fetched_at = self.scraped_at;
        for section in SectionType::ALL {
            if let (Some(prose), Some(text)) = (section.prose_section(), self.section(section)) {
                record.prose.insert(prose, text.to_string());
            }
        }
        Some(record)
    }
}

/// Which provider a canonical value came from and how much it is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: ProviderId,
    pub confidence: ConfidenceLevel,
}

/// Canonical field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn resolved(value: T, provider: ProviderId, confidence: ConfidenceLevel) -> Self {
        Self {
            value: Some(value),
            provenance: Some(Provenance {
                provider,
                confidence,
            }),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn confidence(&self) -> Option<ConfidenceLevel> {
        self.provenance.as_ref().map(|p| p.confidence)
    }

    pub fn provider(&self) -> Option<&ProviderId> {
        self.provenance.as_ref().map(|p| &p.provider)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CanonicalAttributes {
    pub cycle: Field<PlantCycle>,
    pub growth_habit: Field<GrowthHabit>,
    pub sun_needs: Field<SunNeeds>,
    pub water_needs: Field<WaterNeeds>,
    pub ph_range: Field<PhRange>,
    pub maturity: Field<MaturityWindow>,
    pub toxicity: Field<ToxicityLevel>,
    pub edible: Field<bool>,
    pub edible_parts: Field<Vec<String>>,
    pub root_depth: Field<RootDepth>,
    pub hardiness: Field<HardinessRange>,
    pub drought_tolerant: Field<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedText {
    pub provider: ProviderId,
    pub text: String,
}

/// The reconciled record for one species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPlant {
    pub slug: String,
    pub scientific_name: Field<String>,
    pub common_name: Field<String>,
    pub family: Field<String>,
    pub genus: Field<String>,
    pub other_names: Vec<String>,
    pub attributes: CanonicalAttributes,
    pub prose: BTreeMap<ProseSection, Vec<AttributedText>>,
    pub contributors: Vec<ProviderId>,
    pub merged_at: DateTime<Utc>,
}

impl CanonicalPlant {
    /// Section text with each contribution prefixed by its source.
    pub fn prose_text(&self, section: ProseSection) -> Option<String> {
        let parts = self.prose.get(&section)?;
        if parts.is_empty() {
            return None;
        }
        Some(
            parts
                .iter()
                .map(|p| format!("[{}] {}", p.provider, p.text))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }
}

/// Reconciled fields that can carry a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    CommonName,
    Family,
    Genus,
    Cycle,
    GrowthHabit,
    SunNeeds,
    WaterNeeds,
    PhRange,
    Maturity,
    Toxicity,
    Edible,
    EdibleParts,
    RootDepth,
    Hardiness,
    DroughtTolerant,
}

impl FieldName {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::CommonName => "common_name",
            FieldName::Family => "family",
            FieldName::Genus => "genus",
            FieldName::Cycle => "cycle",
            FieldName::GrowthHabit => "growth_habit",
            FieldName::SunNeeds => "sun_needs",
            FieldName::WaterNeeds => "water_needs",
            FieldName::PhRange => "ph_range",
            FieldName::Maturity => "maturity",
            FieldName::Toxicity => "toxicity",
            FieldName::Edible => "edible",
            FieldName::EdibleParts => "edible_parts",
            FieldName::RootDepth => "root_depth",
            FieldName::Hardiness => "hardiness",
            FieldName::DroughtTolerant => "drought_tolerant",
        }
    }

    /// Taxonomy fields always follow Trefle regardless of the caller strategy.
    pub fn is_taxonomic(self) -> bool {
        matches!(self, FieldName::Family | FieldName::Genus)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingValue {
    pub provider: ProviderId,
    pub value: String,
}

/// Audit entry for a field where structured providers disagreed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: FieldName,
    pub values: Vec<ConflictingValue>,
    pub resolution_strategy: ConflictResolutionStrategy,
    pub chosen_value: Option<String>,
    pub chosen_provider: Option<ProviderId>,
    pub confidence: ConfidenceLevel,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FieldConflict {
    pub fn is_pending(&self) -> bool {
        self.chosen_value.is_none()
    }

    pub fn involves(&self, provider: &ProviderId) -> bool {
        self.values.iter().any(|v| &v.provider == provider)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub plant: CanonicalPlant,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeResult {
    pub fn pending_conflicts(&self) -> impl Iterator<Item = &FieldConflict> {
        self.conflicts.iter().filter(|c| c.is_pending())
    }

    pub fn conflict_for(&self, field: FieldName) -> Option<&FieldConflict> {
        self.conflicts.iter().find(|c| c.field == field)
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Lower-cased, whitespace-collapsed scientific name; `None` when blank.
pub fn canonical_scientific_name(name: &str) -> Option<String> {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.to_lowercase())
    }
}

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_collapses_whitespace_and_case() {
        assert_eq!(
            canonical_scientific_name("  Solanum   Lycopersicum "),
            Some("solanum lycopersicum".to_string())
        );
        assert_eq!(canonical_scientific_name("   "), None);
    }

    #[test]
    fn provider_ids_round_trip_through_keys() {
        for id in [
            ProviderId::Trefle,
            ProviderId::Perenual,
            ProviderId::scraped("almanac.com"),
        ] {
            assert_eq!(id.key().parse::<ProviderId>().unwrap(), id);
        }
        assert!("scraped:".parse::<ProviderId>().is_err());
        assert!(!ProviderId::scraped("almanac.com").is_structured());
    }

    #[test]
    fn strategy_parses_config_spellings() {
        assert_eq!(
            "prefer_perenual".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::PreferPerenual
        );
        assert_eq!(
            "MANUAL".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::Manual
        );
        assert!("coin-flip".parse::<ConflictResolutionStrategy>().is_err());
        let json = serde_json::to_string(&ConflictResolutionStrategy::PreferTrefle).unwrap();
        assert_eq!(json, "\"PREFER_TREFLE\"");
    }

    #[test]
    fn contributed_common_name_falls_back_to_other_names() {
        let mut record = ProviderRecord::new(ProviderId::Perenual, "Solanum lycopersicum");
        record.other_names = vec!["  ".into(), "Tomate".into()];
        assert_eq!(record.contributed_common_name(), Some("Tomate"));
        record.common_name = Some("Tomato".into());
        assert_eq!(record.contributed_common_name(), Some("Tomato"));
    }

    #[test]
    fn failed_scrape_yields_no_provider_record() {
        let failed = ScrapedRecord::failed("kale", "almanac.com", "https://x/kale", "boom");
        assert!(!failed.successful);
        assert!(!failed.has_content());
        assert!(failed.to_provider_record("Brassica oleracea").is_none());
    }

    #[test]
    fn scraped_sections_become_prose() {
        let mut scraped = ScrapedRecord::empty("basil", "almanac.com", "https://x/basil");
        scraped.set_section(SectionType::CommonName, Some("Basil".into()));
        scraped.set_section(SectionType::Companions, Some("Plant near tomatoes.".into()));
        scraped.set_section(SectionType::HarvestInfo, Some("   ".into()));

        let record = scraped.to_provider_record("Ocimum basilicum").unwrap();
        assert_eq!(record.provider, ProviderId::scraped("almanac.com"));
        assert_eq!(record.common_name.as_deref(), Some("Basil"));
        assert_eq!(
            record.prose.get(&ProseSection::Companions).map(String::as_str),
            Some("Plant near tomatoes.")
        );
        assert!(!record.prose.contains_key(&ProseSection::HarvestInfo));
    }

    #[test]
    fn slugify_matches_worklist_conventions() {
        assert_eq!(slugify("Solanum lycopersicum"), "solanum-lycopersicum");
        assert_eq!(slugify("  Sweet -- Corn! "), "sweet-corn");
    }
}
