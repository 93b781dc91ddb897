use crate::controller::api::{MeasurementTypeRecord, NodelistRecord, TargetRecord};
use crate::measure::kind::MeasurementKind;
use crate::runtime::fleet_config::MeasurementSection;
use std::collections::{BTreeMap, HashMap};

/// Merges the API resources into `measurements[<type><ipv>] = {party: [targets], nodes}`.
///
/// Disabled targets are dropped. Targets whose type is unknown, or whose
/// series this crate cannot measure, are skipped with a warning.
pub fn assemble_measurements(
    types: &[MeasurementTypeRecord],
    targets: &[TargetRecord],
    nodelists: &[NodelistRecord],
) -> BTreeMap<String, MeasurementSection> {
    let types_by_id: HashMap<u64, &MeasurementTypeRecord> =
        types.iter().map(|record| (record.id, record)).collect();
    let lists_by_id: HashMap<u64, &NodelistRecord> =
        nodelists.iter().map(|record| (record.id, record)).collect();

    let mut measurements: BTreeMap<String, MeasurementSection> = BTreeMap::new();

    for target in targets.iter().filter(|target| target.enabled) {
        let Some(kind) = types_by_id.get(&target.measurement_type_id) else {
            tracing::warn!(
                target = %target.target,
                measurement_type_id = target.measurement_type_id,
                "target references an unknown measurement type"
            );
            continue;
        };

        let series = format!("{}{}", kind.name, target.ipv);
        if MeasurementKind::parse_series(&series).is_none() {
            tracing::warn!(target = %target.target, series = %series, "unsupported measurement type");
            continue;
        }

        let section = measurements.entry(series).or_insert_with(|| {
            let nodes = match lists_by_id.get(&kind.nodelist_id) {
                Some(list) => list.list.clone(),
                None => {
                    tracing::warn!(
                        measurement_type = %kind.name,
                        nodelist_id = kind.nodelist_id,
                        "measurement type references an unknown nodelist"
                    );
                    Vec::new()
                }
            };
            MeasurementSection {
                nodes,
                parties: BTreeMap::new(),
            }
        });

        section
            .parties
            .entry(target.party.clone())
            .or_default()
            .push(target.target.clone());
    }

    measurements
}
