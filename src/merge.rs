//! Keyed multi-source merge table.
//!
//! Holds the latest [`Snapshot`] of every registered source and combines
//! them into one deduplicated entity list on demand.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::entity::{Entity, EntityKey};

/// Opaque handle for one upstream producer.
///
/// Handles are allocated in increasing order, so ordering by handle is
/// ordering by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// The complete set of entities most recently reported by one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entities: Vec<Entity>,
}

impl Snapshot {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl From<Vec<Entity>> for Snapshot {
    fn from(entities: Vec<Entity>) -> Self {
        Self::new(entities)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
}

#[derive(Debug, Default)]
pub struct MergeTable {
    snapshots: BTreeMap<SourceId, Snapshot>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` with an empty snapshot. Re-adding a known source
    /// keeps its current snapshot.
    pub fn add(&mut self, source: SourceId) {
        self.snapshots.entry(source).or_default();
    }

    /// Drops `source` and its snapshot. Unknown sources are ignored.
    pub fn remove(&mut self, source: SourceId) {
        self.snapshots.remove(&source);
    }

    /// Replaces the stored snapshot of a registered source.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::UnknownSource`] if `source` was never added or
    /// has since been removed.
    pub fn update(&mut self, source: SourceId, snapshot: Snapshot) -> Result<(), MergeError> {
        match self.snapshots.get_mut(&source) {
            Some(slot) => {
                *slot = snapshot;
                Ok(())
            }
            None => Err(MergeError::UnknownSource(source)),
        }
    }

    pub fn contains(&self, source: SourceId) -> bool {
        self.snapshots.contains_key(&source)
    }

    pub fn snapshot(&self, source: SourceId) -> Option<&Snapshot> {
        self.snapshots.get(&source)
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.snapshots.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Merged view of all current snapshots.
    ///
    /// Snapshots are walked in registration order and entities are grouped
    /// by key. An entity joins the first group it shares any key with, as
    /// long as it [matches](Entity::matches) every member. Each group is then
    /// combined with [`Entity::merge_all`]; unkeyed entities pass through.
    /// The result keeps first-appearance order and is a fresh list, the
    /// table is untouched.
    pub fn items(&self) -> Vec<Entity> {
        let total: usize = self.snapshots.values().map(Snapshot::len).sum();
        let mut groups: Vec<Vec<&Entity>> = Vec::with_capacity(total);
        let mut index: HashMap<EntityKey, usize> = HashMap::with_capacity(total);
        let mut collisions = 0usize;

        for entity in self.snapshots.values().flat_map(|s| s.entities.iter()) {
            let keys = entity.keys();
            let found = keys
                .iter()
                .filter_map(|key| index.get(key).copied())
                .find(|&pos| groups[pos].iter().all(|member| member.matches(entity)));

            let pos = match found {
                Some(pos) => {
                    groups[pos].push(entity);
                    collisions += 1;
                    pos
                }
                None => {
                    groups.push(vec![entity]);
                    groups.len() - 1
                }
            };
            for key in keys {
                index.entry(key).or_insert(pos);
            }
        }

        let merged: Vec<Entity> = groups
            .iter()
            .filter_map(|copies| Entity::merge_all(copies))
            .collect();

        debug!(
            sources = self.snapshots.len(),
            input = total,
            output = merged.len(),
            collisions,
            "Merged snapshots"
        );

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{StopTimeUpdate, TripUpdate, VehiclePosition};
    use crate::gtfs_rt::FeedEntity;

    fn trip(id: &str) -> TripUpdate {
        TripUpdate {
            trip_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    fn vehicle(id: &str, ts: u64) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: Some(id.to_string()),
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table
            .update(SourceId(1), Snapshot::new(vec![trip("T1").into()]))
            .unwrap();
        table.add(SourceId(1));

        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot(SourceId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table.remove(SourceId(9));
        assert!(table.contains(SourceId(1)));
    }

    #[test]
    fn test_update_unknown_source_fails() {
        let mut table = MergeTable::new();
        let err = table.update(SourceId(3), Snapshot::default()).unwrap_err();
        assert_eq!(err, MergeError::UnknownSource(SourceId(3)));
        assert_eq!(err.to_string(), "unknown source source-3");
    }

    #[test]
    fn test_update_replaces_snapshot() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table
            .update(SourceId(1), Snapshot::new(vec![trip("T1").into()]))
            .unwrap();
        table
            .update(SourceId(1), Snapshot::new(vec![trip("T2").into()]))
            .unwrap();

        let items = table.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].trip_id(), Some("T2"));
    }

    #[test]
    fn test_items_merges_same_key_across_sources() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table.add(SourceId(2));
        table
            .update(
                SourceId(1),
                Snapshot::new(vec![
                    vehicle("v1", 200).into(),
                    VehiclePosition {
                        label: Some("1234".to_string()),
                        ..vehicle("v2", 10)
                    }
                    .into(),
                ]),
            )
            .unwrap();
        table
            .update(
                SourceId(2),
                Snapshot::new(vec![
                    VehiclePosition {
                        speed: Some(4.0),
                        ..vehicle("v2", 20)
                    }
                    .into(),
                    vehicle("v1", 100).into(),
                ]),
            )
            .unwrap();

        let items = table.items();
        assert_eq!(items.len(), 2);

        let Entity::VehiclePosition(v1) = &items[0] else {
            panic!("expected vehicle, got {:?}", items[0]);
        };
        assert_eq!(v1.vehicle_id.as_deref(), Some("v1"));
        assert_eq!(v1.timestamp, Some(200));

        let Entity::VehiclePosition(v2) = &items[1] else {
            panic!("expected vehicle, got {:?}", items[1]);
        };
        assert_eq!(v2.timestamp, Some(20));
        assert_eq!(v2.speed, Some(4.0));
        assert_eq!(v2.label.as_deref(), Some("1234"));
    }

    #[test]
    fn test_unkeyed_entities_pass_through() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table.add(SourceId(2));
        let alert = Entity::Other(FeedEntity {
            id: "alert-1".to_string(),
            ..Default::default()
        });
        let orphan = Entity::from(StopTimeUpdate {
            stop_id: Some("70061".to_string()),
            ..Default::default()
        });
        table
            .update(SourceId(1), Snapshot::new(vec![alert.clone(), orphan.clone()]))
            .unwrap();
        table
            .update(SourceId(2), Snapshot::new(vec![alert.clone(), orphan.clone()]))
            .unwrap();

        assert_eq!(table.items(), vec![alert.clone(), orphan.clone(), alert, orphan]);
    }

    #[test]
    fn test_items_is_deterministic_and_pure() {
        let mut table = MergeTable::new();
        for id in 1..=3 {
            table.add(SourceId(id));
            table
                .update(
                    SourceId(id),
                    Snapshot::new(vec![trip("T1").into(), trip(&format!("T{}", id + 1)).into()]),
                )
                .unwrap();
        }

        let first = table.items();
        let second = table.items();
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|e| e.trip_id().unwrap()).collect::<Vec<_>>(),
            vec!["T1", "T2", "T3", "T4"]
        );
        assert_eq!(table.snapshot(SourceId(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_removed_source_excluded() {
        let mut table = MergeTable::new();
        table.add(SourceId(1));
        table.add(SourceId(2));
        table
            .update(SourceId(1), Snapshot::new(vec![trip("T1").into()]))
            .unwrap();
        table
            .update(SourceId(2), Snapshot::new(vec![trip("T2").into()]))
            .unwrap();
        table.remove(SourceId(1));

        let items = table.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].trip_id(), Some("T2"));
    }

    fn table_with(snapshots: Vec<Vec<Entity>>) -> MergeTable {
        let mut table = MergeTable::new();
        for (i, entities) in snapshots.into_iter().enumerate() {
            let id = SourceId(i as u64 + 1);
            table.add(id);
            table.update(id, Snapshot::new(entities)).unwrap();
        }
        table
    }

    #[test]
    fn test_three_sources_fill_from_next_newest() {
        let table = table_with(vec![
            vec![TripUpdate {
                timestamp: Some(300),
                ..trip("T1")
            }
            .into()],
            vec![TripUpdate {
                timestamp: Some(100),
                delay: Some(10),
                ..trip("T1")
            }
            .into()],
            vec![TripUpdate {
                timestamp: Some(200),
                delay: Some(99),
                ..trip("T1")
            }
            .into()],
        ]);

        let items = table.items();
        assert_eq!(items.len(), 1);
        let Entity::TripUpdate(t1) = &items[0] else {
            panic!("expected trip update, got {:?}", items[0]);
        };
        assert_eq!(t1.timestamp, Some(300));
        assert_eq!(t1.delay, Some(99));
    }

    #[test]
    fn test_three_sources_tie_goes_to_latest_registered() {
        let table = table_with(vec![
            vec![TripUpdate {
                delay: Some(1),
                ..trip("T1")
            }
            .into()],
            vec![TripUpdate {
                timestamp: Some(100),
                ..trip("T1")
            }
            .into()],
            vec![TripUpdate {
                delay: Some(3),
                ..trip("T1")
            }
            .into()],
        ]);

        let items = table.items();
        let Entity::TripUpdate(t1) = &items[0] else {
            panic!("expected trip update, got {:?}", items[0]);
        };
        assert_eq!(t1.timestamp, Some(100));
        assert_eq!(t1.delay, Some(3));
    }

    fn stop_time(seq: Option<u32>, stop_id: Option<&str>, arrival: Option<i64>) -> Entity {
        StopTimeUpdate {
            trip_id: Some("T1".to_string()),
            stop_sequence: seq,
            stop_id: stop_id.map(str::to_string),
            arrival_time: arrival,
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn test_stop_named_by_id_merges_with_stop_named_by_sequence() {
        for (first, second) in [
            (stop_time(Some(5), Some("X"), None), stop_time(None, Some("X"), Some(600))),
            (stop_time(None, Some("X"), Some(600)), stop_time(Some(5), Some("X"), None)),
        ] {
            let items = table_with(vec![vec![first], vec![second]]).items();
            assert_eq!(items.len(), 1);
            let Entity::StopTimeUpdate(stop) = &items[0] else {
                panic!("expected stop time update, got {:?}", items[0]);
            };
            assert_eq!(stop.stop_sequence, Some(5));
            assert_eq!(stop.stop_id.as_deref(), Some("X"));
            assert_eq!(stop.arrival_time, Some(600));
        }
    }

    #[test]
    fn test_loop_trip_visits_stay_distinct() {
        let items = table_with(vec![
            vec![stop_time(Some(3), Some("X"), Some(100))],
            vec![stop_time(Some(9), Some("X"), Some(900))],
        ])
        .items();
        assert_eq!(items.len(), 2);
    }
}
