//! Transit entities flowing through the merge pipeline.
//!
//! Each upstream feed is decomposed into flat [`Entity`] values: trip
//! descriptors, vehicle positions and per-stop predictions. Entities are
//! immutable; merging two of them builds a new value.

use std::cmp::Reverse;

use crate::gtfs_rt::FeedEntity;

/// Schedule relationship of a whole trip (`TripDescriptor.schedule_relationship`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TripRelationship {
    #[default]
    Scheduled,
    Added,
    Unscheduled,
    Canceled,
    Replacement,
    Duplicated,
    Deleted,
}

impl TripRelationship {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Scheduled),
            1 => Some(Self::Added),
            2 => Some(Self::Unscheduled),
            3 => Some(Self::Canceled),
            5 => Some(Self::Replacement),
            6 => Some(Self::Duplicated),
            7 => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Scheduled => 0,
            Self::Added => 1,
            Self::Unscheduled => 2,
            Self::Canceled => 3,
            Self::Replacement => 5,
            Self::Duplicated => 6,
            Self::Deleted => 7,
        }
    }
}

/// Schedule relationship of a single stop (`StopTimeUpdate.schedule_relationship`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopRelationship {
    #[default]
    Scheduled,
    Skipped,
    NoData,
    Unscheduled,
}

impl StopRelationship {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Scheduled),
            1 => Some(Self::Skipped),
            2 => Some(Self::NoData),
            3 => Some(Self::Unscheduled),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Scheduled => 0,
            Self::Skipped => 1,
            Self::NoData => 2,
            Self::Unscheduled => 3,
        }
    }
}

/// Trip-level part of a GTFS-RT trip update. Stop predictions are split out
/// into [`StopTimeUpdate`] entities.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TripUpdate {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
    pub vehicle_id: Option<String>,
    pub schedule_relationship: Option<TripRelationship>,
    pub delay: Option<i32>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehiclePosition {
    pub vehicle_id: Option<String>,
    pub label: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub latitude: f32,
    pub longitude: f32,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub stop_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<i32>,
    pub occupancy_status: Option<i32>,
    pub timestamp: Option<u64>,
}

/// Arrival/departure prediction for one stop of one trip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StopTimeUpdate {
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival_time: Option<i64>,
    pub departure_time: Option<i64>,
    pub uncertainty: Option<i32>,
    pub schedule_relationship: Option<StopRelationship>,
}

/// How a [`StopTimeUpdate`] names its stop within the trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StopRef {
    Sequence(u32),
    StopId(String),
}

/// Identity of an entity for merging purposes. Entities of different kinds
/// never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Trip(String),
    Vehicle(String),
    StopTime { trip_id: String, stop: StopRef },
}

/// Sort rank used to group the merged output by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    TripUpdate = 0,
    VehiclePosition = 1,
    StopTimeUpdate = 2,
    Other = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    TripUpdate(TripUpdate),
    VehiclePosition(VehiclePosition),
    StopTimeUpdate(StopTimeUpdate),
    /// Anything the merger does not model (alerts), carried through verbatim.
    Other(FeedEntity),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::TripUpdate(_) => EntityKind::TripUpdate,
            Entity::VehiclePosition(_) => EntityKind::VehiclePosition,
            Entity::StopTimeUpdate(_) => EntityKind::StopTimeUpdate,
            Entity::Other(_) => EntityKind::Other,
        }
    }

    pub fn trip_id(&self) -> Option<&str> {
        match self {
            Entity::TripUpdate(t) => t.trip_id.as_deref(),
            Entity::VehiclePosition(v) => v.trip_id.as_deref(),
            Entity::StopTimeUpdate(s) => s.trip_id.as_deref(),
            Entity::Other(_) => None,
        }
    }

    /// Every key the entity can be matched under, primary key first.
    pub fn keys(&self) -> Vec<EntityKey> {
        match self {
            Entity::TripUpdate(t) => t.merge_keys(),
            Entity::VehiclePosition(v) => v.merge_keys(),
            Entity::StopTimeUpdate(s) => s.merge_keys(),
            Entity::Other(_) => Vec::new(),
        }
    }

    /// Whether `other`, found under one of this entity's keys, is the same
    /// real-world object.
    pub fn matches(&self, other: &Entity) -> bool {
        match (self, other) {
            (Entity::TripUpdate(a), Entity::TripUpdate(b)) => a.matches(b),
            (Entity::VehiclePosition(a), Entity::VehiclePosition(b)) => a.matches(b),
            (Entity::StopTimeUpdate(a), Entity::StopTimeUpdate(b)) => a.matches(b),
            _ => false,
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Entity::TripUpdate(t) => t.timestamp(),
            Entity::VehiclePosition(v) => v.timestamp(),
            Entity::StopTimeUpdate(s) => s.timestamp(),
            Entity::Other(_) => None,
        }
    }

    /// This entity's fields with the missing ones taken from `other`.
    ///
    /// Returns `None` if the two entities are of different kinds.
    pub fn fill_from(&self, other: &Entity) -> Option<Entity> {
        match (self, other) {
            (Entity::TripUpdate(a), Entity::TripUpdate(b)) => {
                Some(Entity::TripUpdate(a.fill_from(b)))
            }
            (Entity::VehiclePosition(a), Entity::VehiclePosition(b)) => {
                Some(Entity::VehiclePosition(a.fill_from(b)))
            }
            (Entity::StopTimeUpdate(a), Entity::StopTimeUpdate(b)) => {
                Some(Entity::StopTimeUpdate(a.fill_from(b)))
            }
            _ => None,
        }
    }

    /// Combines copies of one object, given in registration order.
    ///
    /// Copies are ranked newest timestamp first, then latest registered
    /// first. Each field comes from the best-ranked copy that has it.
    pub fn merge_all(copies: &[&Entity]) -> Option<Entity> {
        let mut ranked: Vec<(usize, &Entity)> = copies.iter().copied().enumerate().collect();
        ranked.sort_by_key(|&(order, e)| Reverse((e.timestamp(), order)));

        let mut ranked = ranked.into_iter().map(|(_, e)| e);
        let first = ranked.next()?.clone();
        Some(ranked.fold(first, |acc, e| acc.fill_from(e).unwrap_or(acc)))
    }
}

impl From<TripUpdate> for Entity {
    fn from(value: TripUpdate) -> Self {
        Entity::TripUpdate(value)
    }
}

impl From<VehiclePosition> for Entity {
    fn from(value: VehiclePosition) -> Self {
        Entity::VehiclePosition(value)
    }
}

impl From<StopTimeUpdate> for Entity {
    fn from(value: StopTimeUpdate) -> Self {
        Entity::StopTimeUpdate(value)
    }
}

/// A value that can be matched and combined with a copy from another source.
///
/// `merge` is called as `earlier.merge(later)`, where `later` came from a
/// source registered after `earlier`'s. The newer timestamp is primary; on a
/// tie `later` is primary. Fields missing on the primary are taken from the
/// other value.
pub trait Mergeable: Sized {
    fn merge_key(&self) -> Option<EntityKey>;

    /// Every key the value can be found under, primary key first.
    fn merge_keys(&self) -> Vec<EntityKey> {
        self.merge_key().into_iter().collect()
    }

    /// Whether `other`, found under one of our keys, is the same object.
    fn matches(&self, _other: &Self) -> bool {
        true
    }

    fn timestamp(&self) -> Option<u64> {
        None
    }

    /// `self` with its missing fields taken from `other`.
    fn fill_from(&self, other: &Self) -> Self;

    fn merge(&self, later: &Self) -> Self {
        let (p, s) = precedence(self, later);
        p.fill_from(s)
    }
}

/// Orders `(earlier, later)` into `(primary, secondary)`.
fn precedence<'a, T: Mergeable>(earlier: &'a T, later: &'a T) -> (&'a T, &'a T) {
    if earlier.timestamp() > later.timestamp() {
        (earlier, later)
    } else {
        (later, earlier)
    }
}

fn fill<T: Clone>(primary: &Option<T>, secondary: &Option<T>) -> Option<T> {
    primary.as_ref().or(secondary.as_ref()).cloned()
}

impl Mergeable for TripUpdate {
    fn merge_key(&self) -> Option<EntityKey> {
        self.trip_id.clone().map(EntityKey::Trip)
    }

    fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    fn fill_from(&self, other: &Self) -> Self {
        let (p, s) = (self, other);
        TripUpdate {
            trip_id: fill(&p.trip_id, &s.trip_id),
            route_id: fill(&p.route_id, &s.route_id),
            direction_id: p.direction_id.or(s.direction_id),
            start_date: fill(&p.start_date, &s.start_date),
            start_time: fill(&p.start_time, &s.start_time),
            vehicle_id: fill(&p.vehicle_id, &s.vehicle_id),
            schedule_relationship: p.schedule_relationship.or(s.schedule_relationship),
            delay: p.delay.or(s.delay),
            timestamp: p.timestamp.or(s.timestamp),
        }
    }
}

impl Mergeable for VehiclePosition {
    fn merge_key(&self) -> Option<EntityKey> {
        self.vehicle_id.clone().map(EntityKey::Vehicle)
    }

    fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    fn fill_from(&self, other: &Self) -> Self {
        let (p, s) = (self, other);
        VehiclePosition {
            vehicle_id: fill(&p.vehicle_id, &s.vehicle_id),
            label: fill(&p.label, &s.label),
            trip_id: fill(&p.trip_id, &s.trip_id),
            route_id: fill(&p.route_id, &s.route_id),
            // coordinates are required on the wire, so the primary always has them
            latitude: p.latitude,
            longitude: p.longitude,
            bearing: p.bearing.or(s.bearing),
            speed: p.speed.or(s.speed),
            stop_id: fill(&p.stop_id, &s.stop_id),
            current_stop_sequence: p.current_stop_sequence.or(s.current_stop_sequence),
            current_status: p.current_status.or(s.current_status),
            occupancy_status: p.occupancy_status.or(s.occupancy_status),
            timestamp: p.timestamp.or(s.timestamp),
        }
    }
}

impl Mergeable for StopTimeUpdate {
    fn merge_key(&self) -> Option<EntityKey> {
        self.merge_keys().into_iter().next()
    }

    /// The sequence key when present, then the stop id key, so a copy that
    /// names the stop only one way still finds one that names it both ways.
    fn merge_keys(&self) -> Vec<EntityKey> {
        let Some(trip_id) = &self.trip_id else {
            return Vec::new();
        };
        let sequence = self.stop_sequence.map(StopRef::Sequence);
        let stop_id = self.stop_id.clone().map(StopRef::StopId);

        sequence
            .into_iter()
            .chain(stop_id)
            .map(|stop| EntityKey::StopTime {
                trip_id: trip_id.clone(),
                stop,
            })
            .collect()
    }

    /// Loop trips visit a stop id more than once, so two different sequence
    /// numbers are never the same stop.
    fn matches(&self, other: &Self) -> bool {
        match (self.stop_sequence, other.stop_sequence) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn fill_from(&self, other: &Self) -> Self {
        let (p, s) = (self, other);
        StopTimeUpdate {
            trip_id: fill(&p.trip_id, &s.trip_id),
            stop_id: fill(&p.stop_id, &s.stop_id),
            stop_sequence: p.stop_sequence.or(s.stop_sequence),
            arrival_time: p.arrival_time.or(s.arrival_time),
            departure_time: p.departure_time.or(s.departure_time),
            uncertainty: p.uncertainty.or(s.uncertainty),
            schedule_relationship: p.schedule_relationship.or(s.schedule_relationship),
        }
    }
}
