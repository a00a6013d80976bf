use std::path::PathBuf;

use flora_core::{
    ConfidenceLevel, ConflictResolutionStrategy, FieldName, ProseSection, ProviderId,
    ProviderRecord, WaterNeeds,
};
use flora_reconcile::ReconciliationEngine;

fn tomato_fixture() -> Vec<ProviderRecord> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/tomato.json");
    let text = std::fs::read_to_string(&path).expect("fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn tomato_fixture_merges_under_prefer_trefle() {
    let result = ReconciliationEngine::default()
        .merge(&tomato_fixture(), ConflictResolutionStrategy::PreferTrefle)
        .expect("merge");
    let plant = &result.plant;

    assert_eq!(plant.slug, "solanum-lycopersicum");
    assert_eq!(plant.family.value.as_deref(), Some("Solanaceae"));
    assert_eq!(plant.common_name.value.as_deref(), Some("Tomate"));
    assert_eq!(plant.common_name.provider(), Some(&ProviderId::Perenual));
    assert_eq!(plant.attributes.cycle.confidence(), Some(ConfidenceLevel::High));
    assert_eq!(plant.attributes.water_needs.value, Some(WaterNeeds::Moderate));
    assert_eq!(plant.attributes.water_needs.provider(), Some(&ProviderId::Trefle));
    assert!(plant.prose_text(ProseSection::Description).is_some());

    let water = result.conflict_for(FieldName::WaterNeeds).expect("water conflict");
    assert!(!water.is_pending());
    assert_eq!(result.conflicts.len(), 1);
}

#[test]
fn tomato_fixture_leaves_disagreement_pending_under_manual() {
    let result = ReconciliationEngine::default()
        .merge(&tomato_fixture(), ConflictResolutionStrategy::Manual)
        .expect("merge");

    assert!(result.plant.attributes.water_needs.value.is_none());
    assert_eq!(result.pending_conflicts().count(), 1);
    assert_eq!(
        result.plant.attributes.sun_needs.provider(),
        Some(&ProviderId::Trefle)
    );
}
