//! Field-level reconciliation of provider records into one canonical plant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use flora_core::{
    canonical_scientific_name, slugify, AttributedText, CanonicalAttributes, CanonicalPlant,
    ConfidenceLevel, ConflictResolutionStrategy, ConflictingValue, Field, FieldConflict, FieldName,
    GrowthHabit, HardinessRange, MaturityWindow, MergeResult, PhRange, PlantCycle, ProseSection,
    ProviderId, ProviderRecord, RootDepth, SunNeeds, ToxicityLevel, WaterNeeds,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "flora-reconcile";

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("invalid merge input: {0}")]
    InvalidInput(String),
    #[error("scientific name mismatch: expected `{expected}`, {provider} reported `{found}`")]
    RecordMismatch {
        expected: String,
        found: String,
        provider: ProviderId,
    },
    #[error("no conflict recorded for field `{0}`")]
    UnknownConflict(FieldName),
}

/// Value comparison and audit rendering for reconciled field types.
pub trait Reconcilable: Clone {
    fn agrees_with(&self, other: &Self, tolerance: f64) -> bool;
    fn render(&self) -> String;
}

impl Reconcilable for String {
    fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
        self.trim().to_lowercase() == other.trim().to_lowercase()
    }

    fn render(&self) -> String {
        self.trim().to_string()
    }
}

impl Reconcilable for bool {
    fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
        self == other
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

impl Reconcilable for Vec<String> {
    fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
        normalized_set(self) == normalized_set(other)
    }

    fn render(&self) -> String {
        self.join(", ")
    }
}

impl Reconcilable for PhRange {
    fn agrees_with(&self, other: &Self, tolerance: f64) -> bool {
        (self.min - other.min).abs() <= tolerance && (self.max - other.max).abs() <= tolerance
    }

    fn render(&self) -> String {
        format!("{:.1}-{:.1}", self.min, self.max)
    }
}

impl Reconcilable for MaturityWindow {
    fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
        self == other
    }

    fn render(&self) -> String {
        format!("{}-{} days", self.min_days, self.max_days)
    }
}

impl Reconcilable for HardinessRange {
    fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
        self.min_zone.eq_ignore_ascii_case(&other.min_zone)
            && self.max_zone.eq_ignore_ascii_case(&other.max_zone)
    }

    fn render(&self) -> String {
        format!("zones {}-{}", self.min_zone, self.max_zone)
    }
}

macro_rules! reconcilable_enum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reconcilable for $ty {
                fn agrees_with(&self, other: &Self, _tolerance: f64) -> bool {
                    self == other
                }

                fn render(&self) -> String {
                    format!("{self:?}")
                }
            }
        )*
    };
}

reconcilable_enum!(PlantCycle, GrowthHabit, SunNeeds, WaterNeeds, ToxicityLevel, RootDepth);

fn normalized_set(values: &[String]) -> Vec<String> {
    let mut out = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub numeric_tolerance: f64,
    /// Confidence given to a field filled only from scraped pages.
    pub scraped_confidence: ConfidenceLevel,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            numeric_tolerance: 1e-6,
            scraped_confidence: ConfidenceLevel::Low,
        }
    }
}

#[derive(Debug, Clone)]
struct Contribution<T> {
    provider: ProviderId,
    value: T,
    position: usize,
}

fn precedence(provider: &ProviderId) -> u8 {
    match provider {
        ProviderId::Trefle => 0,
        ProviderId::Perenual => 1,
        ProviderId::Scraped(_) => 2,
    }
}

fn text(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn collect<T>(
    records: &[&ProviderRecord],
    pick: impl Fn(&ProviderRecord) -> Option<T>,
) -> Vec<Contribution<T>> {
    records
        .iter()
        .enumerate()
        .filter_map(|(position, record)| {
            pick(record).map(|value| Contribution {
                provider: record.provider.clone(),
                value,
                position,
            })
        })
        .collect()
}

struct FieldResolver<'a> {
    config: MergeConfig,
    strategy: ConflictResolutionStrategy,
    now: DateTime<Utc>,
    conflicts: &'a mut Vec<FieldConflict>,
}

impl FieldResolver<'_> {
    fn resolve<T: Reconcilable>(&mut self, field: FieldName, contributions: Vec<Contribution<T>>) -> Field<T> {
        let strategy = if field.is_taxonomic() {
            ConflictResolutionStrategy::PreferTrefle
        } else {
            self.strategy
        };
        let tolerance = self.config.numeric_tolerance;

        let (mut structured, scraped): (Vec<_>, Vec<_>) = contributions
            .into_iter()
            .partition(|c| c.provider.is_structured());

        if structured.is_empty() {
            return match scraped.into_iter().next() {
                Some(first) => Field::resolved(first.value, first.provider, self.config.scraped_confidence),
                None => Field::empty(),
            };
        }

        structured.sort_by_key(|c| (precedence(&c.provider), c.position));
        for weak in &scraped {
            if !weak.value.agrees_with(&structured[0].value, tolerance) {
                debug!(%field, provider = %weak.provider, "discarding scraped value that disagrees with structured providers");
            }
        }

        let unanimous = structured
            .iter()
            .all(|c| c.value.agrees_with(&structured[0].value, tolerance));
        if unanimous {
            let head = structured.swap_remove(0);
            return Field::resolved(head.value, head.provider, ConfidenceLevel::High);
        }

        let mut values = structured
            .iter()
            .map(|c| {
                (
                    c.position,
                    ConflictingValue {
                        provider: c.provider.clone(),
                        value: c.value.render(),
                    },
                )
            })
            .collect::<Vec<_>>();
        values.sort_by_key(|(position, _)| *position);
        let values = values.into_iter().map(|(_, v)| v).collect::<Vec<_>>();

        let winner = strategy.preferred_provider().map(|preferred| {
            structured
                .iter()
                .position(|c| c.provider == preferred)
                .unwrap_or(0)
        });

        match winner {
            None => {
                info!(%field, contributors = values.len(), "conflict left for manual resolution");
                self.conflicts.push(FieldConflict {
                    field,
                    values,
                    resolution_strategy: strategy,
                    chosen_value: None,
                    chosen_provider: None,
                    confidence: ConfidenceLevel::Low,
                    created_at: self.now,
                    resolved_at: None,
                });
                Field::empty()
            }
            Some(index) => {
                let chosen = structured.swap_remove(index);
                info!(%field, provider = %chosen.provider, ?strategy, "conflict resolved automatically");
                self.conflicts.push(FieldConflict {
                    field,
                    values,
                    resolution_strategy: strategy,
                    chosen_value: Some(chosen.value.render()),
                    chosen_provider: Some(chosen.provider.clone()),
                    confidence: ConfidenceLevel::Medium,
                    created_at: self.now,
                    resolved_at: Some(self.now),
                });
                Field::resolved(chosen.value, chosen.provider, ConfidenceLevel::Medium)
            }
        }
    }
}

/// Pure, in-memory merge of provider records. Never blocks.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    config: MergeConfig,
}

impl ReconciliationEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Merge records for one species; the slug is derived from the scientific name.
    pub fn merge(
        &self,
        records: &[ProviderRecord],
        strategy: ConflictResolutionStrategy,
    ) -> Result<MergeResult, MergeError> {
        self.merge_inner(None, records, strategy)
    }

    pub fn merge_for_slug(
        &self,
        slug: &str,
        records: &[ProviderRecord],
        strategy: ConflictResolutionStrategy,
    ) -> Result<MergeResult, MergeError> {
        self.merge_inner(Some(slug), records, strategy)
    }

    fn merge_inner(
        &self,
        slug: Option<&str>,
        records: &[ProviderRecord],
        strategy: ConflictResolutionStrategy,
    ) -> Result<MergeResult, MergeError> {
        let usable = validate(records)?;
        let now = Utc::now();
        let scientific_name = scientific_name_field(&usable);
        let slug = slug
            .map(ToString::to_string)
            .or_else(|| scientific_name.value.as_deref().map(slugify))
            .unwrap_or_default();

        let mut conflicts = Vec::new();
        let mut resolver = FieldResolver {
            config: self.config,
            strategy,
            now,
            conflicts: &mut conflicts,
        };

        let common_name = resolver.resolve(
            FieldName::CommonName,
            collect(&usable, |r| r.contributed_common_name().map(ToString::to_string)),
        );
        let family = resolver.resolve(FieldName::Family, collect(&usable, |r| text(&r.family)));
        let genus = resolver.resolve(FieldName::Genus, collect(&usable, |r| text(&r.genus)));

        let attributes = CanonicalAttributes {
            cycle: resolver.resolve(FieldName::Cycle, collect(&usable, |r| r.attributes.cycle)),
            growth_habit: resolver.resolve(
                FieldName::GrowthHabit,
                collect(&usable, |r| r.attributes.growth_habit),
            ),
            sun_needs: resolver.resolve(FieldName::SunNeeds, collect(&usable, |r| r.attributes.sun_needs)),
            water_needs: resolver.resolve(
                FieldName::WaterNeeds,
                collect(&usable, |r| r.attributes.water_needs),
            ),
            ph_range: resolver.resolve(FieldName::PhRange, collect(&usable, |r| r.attributes.ph_range)),
            maturity: resolver.resolve(FieldName::Maturity, collect(&usable, |r| r.attributes.maturity)),
            toxicity: resolver.resolve(FieldName::Toxicity, collect(&usable, |r| r.attributes.toxicity)),
            edible: resolver.resolve(FieldName::Edible, collect(&usable, |r| r.attributes.edible)),
            edible_parts: resolver.resolve(
                FieldName::EdibleParts,
                collect(&usable, |r| {
                    r.attributes
                        .edible_parts
                        .clone()
                        .filter(|parts| !normalized_set(parts).is_empty())
                }),
            ),
            root_depth: resolver.resolve(
                FieldName::RootDepth,
                collect(&usable, |r| r.attributes.root_depth),
            ),
            hardiness: resolver.resolve(
                FieldName::Hardiness,
                collect(&usable, |r| r.attributes.hardiness.clone()),
            ),
            drought_tolerant: resolver.resolve(
                FieldName::DroughtTolerant,
                collect(&usable, |r| r.attributes.drought_tolerant),
            ),
        };

        let mut contributors: Vec<ProviderId> = Vec::new();
        for record in &usable {
            if !contributors.contains(&record.provider) {
                contributors.push(record.provider.clone());
            }
        }

        let plant = CanonicalPlant {
            slug,
            scientific_name,
            common_name,
            family,
            genus,
            other_names: merge_other_names(&usable),
            attributes,
            prose: merge_prose(&usable),
            contributors,
            merged_at: now,
        };

        Ok(MergeResult { plant, conflicts })
    }

    /// Apply a human decision to a pending (or automatically resolved)
    /// conflict, copying the chosen provider's value into the canonical record.
    pub fn resolve_conflict(
        &self,
        result: &mut MergeResult,
        records: &[ProviderRecord],
        field: FieldName,
        provider: &ProviderId,
    ) -> Result<(), MergeError> {
        let index = result
            .conflicts
            .iter()
            .rposition(|c| c.field == field)
            .ok_or(MergeError::UnknownConflict(field))?;
        if !result.conflicts[index].involves(provider) {
            return Err(MergeError::InvalidInput(format!(
                "{provider} is not a party to the `{field}` conflict"
            )));
        }

        let record = records
            .iter()
            .find(|r| &r.provider == provider)
            .ok_or_else(|| MergeError::InvalidInput(format!("no record supplied for {provider}")))?;
        let expected = result
            .plant
            .scientific_name
            .value
            .as_deref()
            .and_then(canonical_scientific_name)
            .unwrap_or_default();
        let found = canonical_scientific_name(&record.scientific_name).unwrap_or_default();
        if expected != found {
            return Err(MergeError::RecordMismatch {
                expected,
                found,
                provider: provider.clone(),
            });
        }

        let rendered = apply_value(&mut result.plant, record, field).ok_or_else(|| {
            MergeError::InvalidInput(format!("{provider} did not report `{field}`"))
        })?;

        let conflict = &mut result.conflicts[index];
        conflict.chosen_value = Some(rendered);
        conflict.chosen_provider = Some(provider.clone());
        conflict.confidence = ConfidenceLevel::Medium;
        conflict.resolved_at = Some(Utc::now());
        Ok(())
    }
}

fn validate(records: &[ProviderRecord]) -> Result<Vec<&ProviderRecord>, MergeError> {
    if records.is_empty() {
        return Err(MergeError::InvalidInput(
            "at least one provider record is required".to_string(),
        ));
    }

    let mut expected: Option<String> = None;
    let mut usable = Vec::with_capacity(records.len());
    for record in records {
        let Some(canonical) = canonical_scientific_name(&record.scientific_name) else {
            warn!(provider = %record.provider, "excluding record without a scientific name");
            continue;
        };
        match &expected {
            None => expected = Some(canonical),
            Some(name) if *name != canonical => {
                return Err(MergeError::RecordMismatch {
                    expected: name.clone(),
                    found: canonical,
                    provider: record.provider.clone(),
                });
            }
            Some(_) => {}
        }
        usable.push(record);
    }

    if usable.is_empty() {
        return Err(MergeError::InvalidInput(
            "no provider record carries a scientific name".to_string(),
        ));
    }
    Ok(usable)
}

fn scientific_name_field(records: &[&ProviderRecord]) -> Field<String> {
    let source = records
        .iter()
        .find(|r| r.provider == ProviderId::Trefle)
        .or_else(|| records.first());
    match source {
        Some(record) => Field::resolved(
            record.scientific_name.split_whitespace().collect::<Vec<_>>().join(" "),
            record.provider.clone(),
            ConfidenceLevel::High,
        ),
        None => Field::empty(),
    }
}

fn by_precedence<'a>(records: &[&'a ProviderRecord]) -> Vec<&'a ProviderRecord> {
    let mut ordered = records.to_vec();
    ordered.sort_by_key(|r| precedence(&r.provider));
    ordered
}

fn merge_other_names(records: &[&ProviderRecord]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in by_precedence(records) {
        for name in &record.other_names {
            let trimmed = name.trim();
            if !trimmed.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(trimmed)) {
                names.push(trimmed.to_string());
            }
        }
    }
    names
}

fn merge_prose(records: &[&ProviderRecord]) -> BTreeMap<ProseSection, Vec<AttributedText>> {
    let ordered = by_precedence(records);
    let mut out = BTreeMap::new();
    for section in ProseSection::ALL {
        let mut parts: Vec<AttributedText> = Vec::new();
        for record in &ordered {
            let Some(body) = record.prose.get(&section).map(|t| t.trim()).filter(|t| !t.is_empty()) else {
                continue;
            };
            if parts.iter().any(|p| p.text.eq_ignore_ascii_case(body)) {
                continue;
            }
            parts.push(AttributedText {
                provider: record.provider.clone(),
                text: body.to_string(),
            });
        }
        if !parts.is_empty() {
            out.insert(section, parts);
        }
    }
    out
}

fn assign<T: Reconcilable>(slot: &mut Field<T>, value: Option<T>, provider: &ProviderId) -> Option<String> {
    let value = value?;
    let rendered = value.render();
    *slot = Field::resolved(value, provider.clone(), ConfidenceLevel::Medium);
    Some(rendered)
}

fn apply_value(plant: &mut CanonicalPlant, record: &ProviderRecord, field: FieldName) -> Option<String> {
    let provider = &record.provider;
    let attrs = &record.attributes;
    match field {
        FieldName::CommonName => assign(
            &mut plant.common_name,
            record.contributed_common_name().map(ToString::to_string),
            provider,
        ),
        FieldName::Family => assign(&mut plant.family, text(&record.family), provider),
        FieldName::Genus => assign(&mut plant.genus, text(&record.genus), provider),
        FieldName::Cycle => assign(&mut plant.attributes.cycle, attrs.cycle, provider),
        FieldName::GrowthHabit => assign(&mut plant.attributes.growth_habit, attrs.growth_habit, provider),
        FieldName::SunNeeds => assign(&mut plant.attributes.sun_needs, attrs.sun_needs, provider),
        FieldName::WaterNeeds => assign(&mut plant.attributes.water_needs, attrs.water_needs, provider),
        FieldName::PhRange => assign(&mut plant.attributes.ph_range, attrs.ph_range, provider),
        FieldName::Maturity => assign(&mut plant.attributes.maturity, attrs.maturity, provider),
        FieldName::Toxicity => assign(&mut plant.attributes.toxicity, attrs.toxicity, provider),
        FieldName::Edible => assign(&mut plant.attributes.edible, attrs.edible, provider),
        FieldName::EdibleParts => assign(
            &mut plant.attributes.edible_parts,
            attrs.edible_parts.clone(),
            provider,
        ),
        FieldName::RootDepth => assign(&mut plant.attributes.root_depth, attrs.root_depth, provider),
        FieldName::Hardiness => assign(&mut plant.attributes.hardiness, attrs.hardiness.clone(), provider),
        FieldName::DroughtTolerant => assign(
            &mut plant.attributes.drought_tolerant,
            attrs.drought_tolerant,
            provider,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOMATO: &str = "Solanum lycopersicum";

    fn record(provider: ProviderId) -> ProviderRecord {
        ProviderRecord::new(provider, TOMATO)
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::default()
    }

    #[test]
    fn tomato_scenario_merges_disjoint_fields_without_conflicts() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.family = Some("Solanaceae".into());
        let mut perenual = record(ProviderId::Perenual);
        perenual.other_names = vec!["Tomate".into()];

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::PreferTrefle)
            .unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.plant.family.value.as_deref(), Some("Solanaceae"));
        assert_eq!(result.plant.common_name.value.as_deref(), Some("Tomate"));
        assert_eq!(result.plant.common_name.provider(), Some(&ProviderId::Perenual));
        assert_eq!(result.plant.common_name.confidence(), Some(ConfidenceLevel::High));
        assert_eq!(result.plant.slug, "solanum-lycopersicum");
        assert_eq!(result.plant.other_names, vec!["Tomate".to_string()]);
    }

    #[test]
    fn single_contributor_value_is_adopted_with_high_confidence() {
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.water_needs = Some(WaterNeeds::Frequent);

        let result = engine()
            .merge(&[record(ProviderId::Trefle), perenual], ConflictResolutionStrategy::Manual)
            .unwrap();

        assert!(result.conflicts.is_empty());
        let water = &result.plant.attributes.water_needs;
        assert_eq!(water.value, Some(WaterNeeds::Frequent));
        assert_eq!(water.confidence(), Some(ConfidenceLevel::High));
        assert!(!result.plant.attributes.sun_needs.is_present());
    }

    #[test]
    fn agreeing_contributors_ignore_case_and_whitespace() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.common_name = Some("Garden Tomato".into());
        trefle.attributes.ph_range = Some(PhRange { min: 6.0, max: 6.8 });
        let mut perenual = record(ProviderId::Perenual);
        perenual.common_name = Some("  garden tomato ".into());
        perenual.attributes.ph_range = Some(PhRange { min: 6.0000001, max: 6.8 });

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::Manual)
            .unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.plant.common_name.value.as_deref(), Some("Garden Tomato"));
        assert_eq!(result.plant.common_name.provider(), Some(&ProviderId::Trefle));
    }

    #[test]
    fn manual_strategy_records_one_pending_conflict_and_leaves_field_absent() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.attributes.sun_needs = Some(SunNeeds::FullSun);
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.sun_needs = Some(SunNeeds::PartShade);

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::Manual)
            .unwrap();

        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.field, FieldName::SunNeeds);
        assert_eq!(conflict.chosen_value, None);
        assert_eq!(conflict.confidence, ConfidenceLevel::Low);
        assert_eq!(conflict.resolution_strategy, ConflictResolutionStrategy::Manual);
        assert_eq!(conflict.values.len(), 2);
        assert!(!result.plant.attributes.sun_needs.is_present());
        assert_eq!(result.pending_conflicts().count(), 1);
    }

    #[test]
    fn prefer_trefle_adopts_trefle_value_with_medium_confidence() {
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.cycle = Some(PlantCycle::Perennial);
        let mut trefle = record(ProviderId::Trefle);
        trefle.attributes.cycle = Some(PlantCycle::Annual);

        let result = engine()
            .merge(&[perenual, trefle], ConflictResolutionStrategy::PreferTrefle)
            .unwrap();

        let cycle = &result.plant.attributes.cycle;
        assert_eq!(cycle.value, Some(PlantCycle::Annual));
        assert_eq!(cycle.confidence(), Some(ConfidenceLevel::Medium));
        let conflict = result.conflict_for(FieldName::Cycle).unwrap();
        assert_eq!(conflict.chosen_value.as_deref(), Some("Annual"));
        assert_eq!(conflict.chosen_provider, Some(ProviderId::Trefle));
        assert_eq!(conflict.values[0].provider, ProviderId::Perenual);
    }

    #[test]
    fn prefer_perenual_applies_to_attributes_but_not_taxonomy() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.family = Some("Solanaceae".into());
        trefle.attributes.toxicity = Some(ToxicityLevel::Low);
        let mut perenual = record(ProviderId::Perenual);
        perenual.family = Some("Nightshades".into());
        perenual.attributes.toxicity = Some(ToxicityLevel::Moderate);

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::PreferPerenual)
            .unwrap();

        assert_eq!(result.plant.family.value.as_deref(), Some("Solanaceae"));
        assert_eq!(result.plant.attributes.toxicity.value, Some(ToxicityLevel::Moderate));
        let family = result.conflict_for(FieldName::Family).unwrap();
        assert_eq!(family.resolution_strategy, ConflictResolutionStrategy::PreferTrefle);
        assert_eq!(result.conflicts.len(), 2);
    }

    #[test]
    fn taxonomy_conflicts_resolve_to_trefle_even_under_manual() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.family = Some("FamilyA".into());
        trefle.genus = Some("GenusA".into());
        let mut perenual = record(ProviderId::Perenual);
        perenual.family = Some("FamilyB".into());
        perenual.genus = Some("GenusB".into());

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::Manual)
            .unwrap();

        let fields = result.conflicts.iter().map(|c| c.field).collect::<Vec<_>>();
        assert_eq!(fields, vec![FieldName::Family, FieldName::Genus]);
        assert_eq!(result.plant.genus.value.as_deref(), Some("GenusA"));
        assert_eq!(result.pending_conflicts().count(), 0);
    }

    #[test]
    fn prefer_strategy_falls_back_when_named_provider_is_silent() {
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.edible = Some(true);
        let mut trefle = record(ProviderId::Trefle);
        trefle.attributes.edible = Some(false);
        let mut other_trefle = record(ProviderId::Trefle);
        other_trefle.provider_ref = Some("2".into());

        // No Perenual contributor for root depth: Trefle wins by precedence.
        trefle.attributes.root_depth = Some(RootDepth::Deep);
        other_trefle.attributes.root_depth = Some(RootDepth::Shallow);

        let result = engine()
            .merge(&[perenual, trefle, other_trefle], ConflictResolutionStrategy::PreferPerenual)
            .unwrap();

        assert_eq!(result.plant.attributes.edible.value, Some(true));
        let depth = &result.plant.attributes.root_depth;
        assert_eq!(depth.value, Some(RootDepth::Deep));
        assert_eq!(depth.confidence(), Some(ConfidenceLevel::Medium));
    }

    #[test]
    fn scraped_values_fill_gaps_but_never_conflict() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.common_name = Some("Tomato".into());
        let mut scraped = record(ProviderId::scraped("almanac.com"));
        scraped.common_name = Some("Love apple".into());
        scraped.attributes.growth_habit = Some(GrowthHabit::Vine);

        let result = engine()
            .merge(&[scraped, trefle], ConflictResolutionStrategy::Manual)
            .unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.plant.common_name.value.as_deref(), Some("Tomato"));
        let habit = &result.plant.attributes.growth_habit;
        assert_eq!(habit.value, Some(GrowthHabit::Vine));
        assert_eq!(habit.provider(), Some(&ProviderId::scraped("almanac.com")));
        assert_eq!(habit.confidence(), Some(ConfidenceLevel::Low));
    }

    #[test]
    fn prose_is_concatenated_with_attribution() {
        let mut trefle = record(ProviderId::Trefle);
        trefle
            .prose
            .insert(ProseSection::Description, "A tender annual.".into());
        let mut scraped = record(ProviderId::scraped("almanac.com"));
        scraped
            .prose
            .insert(ProseSection::Description, "Tomatoes love heat.".into());
        scraped
            .prose
            .insert(ProseSection::Companions, "Basil, carrots.".into());
        let mut perenual = record(ProviderId::Perenual);
        perenual
            .prose
            .insert(ProseSection::Description, "a tender annual.".into());

        let result = engine()
            .merge(&[scraped, perenual, trefle], ConflictResolutionStrategy::Manual)
            .unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(
            result.plant.prose_text(ProseSection::Description).unwrap(),
            "[trefle] A tender annual.\n\n[scraped:almanac.com] Tomatoes love heat."
        );
        assert_eq!(
            result.plant.prose_text(ProseSection::Companions).unwrap(),
            "[scraped:almanac.com] Basil, carrots."
        );
        assert!(result.plant.prose_text(ProseSection::HarvestInfo).is_none());
    }

    #[test]
    fn empty_input_is_invalid() {
        let err = engine()
            .merge(&[], ConflictResolutionStrategy::PreferTrefle)
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));
    }

    #[test]
    fn records_without_scientific_name_are_excluded() {
        let mut nameless = ProviderRecord::new(ProviderId::Perenual, "  ");
        nameless.family = Some("Wrong".into());
        let mut trefle = record(ProviderId::Trefle);
        trefle.family = Some("Solanaceae".into());

        let result = engine()
            .merge(&[nameless.clone(), trefle], ConflictResolutionStrategy::Manual)
            .unwrap();
        assert!(result.conflicts.is_empty());
        assert_eq!(result.plant.contributors, vec![ProviderId::Trefle]);

        let err = engine()
            .merge(&[nameless], ConflictResolutionStrategy::Manual)
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));
    }

    #[test]
    fn scientific_name_mismatch_fails_without_partial_merge() {
        let trefle = record(ProviderId::Trefle);
        let perenual = ProviderRecord::new(ProviderId::Perenual, "Solanum tuberosum");

        let err = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::PreferTrefle)
            .unwrap_err();
        assert_eq!(
            err,
            MergeError::RecordMismatch {
                expected: "solanum lycopersicum".into(),
                found: "solanum tuberosum".into(),
                provider: ProviderId::Perenual,
            }
        );
    }

    #[test]
    fn manual_conflicts_can_be_resolved_later() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.attributes.maturity = Some(MaturityWindow { min_days: 60, max_days: 80 });
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.maturity = Some(MaturityWindow { min_days: 70, max_days: 90 });
        let records = vec![trefle, perenual];

        let engine = engine();
        let mut result = engine.merge(&records, ConflictResolutionStrategy::Manual).unwrap();
        assert!(!result.plant.attributes.maturity.is_present());

        engine
            .resolve_conflict(&mut result, &records, FieldName::Maturity, &ProviderId::Perenual)
            .unwrap();

        let maturity = &result.plant.attributes.maturity;
        assert_eq!(maturity.value, Some(MaturityWindow { min_days: 70, max_days: 90 }));
        assert_eq!(maturity.confidence(), Some(ConfidenceLevel::Medium));
        let conflict = result.conflict_for(FieldName::Maturity).unwrap();
        assert_eq!(conflict.chosen_value.as_deref(), Some("70-90 days"));
        assert!(conflict.resolved_at.is_some());
        assert_eq!(result.pending_conflicts().count(), 0);
    }

    #[test]
    fn resolving_unknown_or_foreign_conflicts_fails() {
        let records = vec![record(ProviderId::Trefle)];
        let engine = engine();
        let mut result = engine.merge(&records, ConflictResolutionStrategy::Manual).unwrap();

        let err = engine
            .resolve_conflict(&mut result, &records, FieldName::Toxicity, &ProviderId::Trefle)
            .unwrap_err();
        assert_eq!(err, MergeError::UnknownConflict(FieldName::Toxicity));

        let mut a = record(ProviderId::Trefle);
        a.attributes.drought_tolerant = Some(true);
        let mut b = record(ProviderId::Perenual);
        b.attributes.drought_tolerant = Some(false);
        let records = vec![a, b];
        let mut result = engine.merge(&records, ConflictResolutionStrategy::Manual).unwrap();
        let err = engine
            .resolve_conflict(
                &mut result,
                &records,
                FieldName::DroughtTolerant,
                &ProviderId::scraped("almanac.com"),
            )
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidInput(_)));
    }

    #[test]
    fn edible_parts_compare_as_sets() {
        let mut trefle = record(ProviderId::Trefle);
        trefle.attributes.edible_parts = Some(vec!["Fruit".into(), "leaves".into()]);
        let mut perenual = record(ProviderId::Perenual);
        perenual.attributes.edible_parts = Some(vec!["leaves".into(), "fruit".into()]);

        let result = engine()
            .merge(&[trefle, perenual], ConflictResolutionStrategy::Manual)
            .unwrap();
        assert!(result.conflicts.is_empty());
        assert_eq!(
            result.plant.attributes.edible_parts.value,
            Some(vec!["Fruit".to_string(), "leaves".to_string()])
        );
    }
}
