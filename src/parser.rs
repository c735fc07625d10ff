//! Protobuf parser for GTFS Realtime feeds.

use anyhow::Result;
use prost::Message;

use crate::entity::{
    Entity, StopRelationship, StopTimeUpdate, TripRelationship, TripUpdate, VehiclePosition,
};
use crate::gtfs_rt::{self, FeedEntity, FeedMessage};
use crate::merge::Snapshot;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Decodes `bytes` straight into a [`Snapshot`].
pub fn parse_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    Ok(snapshot_from_feed(&parse_feed(bytes)?))
}

/// Flattens a feed into merge entities.
///
/// A trip update becomes one [`TripUpdate`] followed by one
/// [`StopTimeUpdate`] per stop, each tagged with the trip id. Vehicles become
/// [`VehiclePosition`]s. Alerts and other payloads are kept as
/// [`Entity::Other`]. Deleted entities are skipped.
pub fn snapshot_from_feed(feed: &FeedMessage) -> Snapshot {
    let mut entities = Vec::with_capacity(feed.entity.len());

    for e in &feed.entity {
        if e.is_deleted.unwrap_or(false) {
            continue;
        }

        if let Some(tu) = &e.trip_update {
            let trip = trip_update(tu);
            let trip_id = trip.trip_id.clone();
            entities.push(Entity::TripUpdate(trip));
            entities.extend(
                tu.stop_time_update
                    .iter()
                    .map(|stu| Entity::StopTimeUpdate(stop_time_update(trip_id.clone(), stu))),
            );
        }

        if let Some(v) = &e.vehicle {
            entities.push(Entity::VehiclePosition(vehicle_position(v)));
        }

        if e.trip_update.is_none() && e.vehicle.is_none() {
            entities.push(Entity::Other(FeedEntity {
                id: e.id.clone(),
                alert: e.alert.clone(),
                ..Default::default()
            }));
        }
    }

    Snapshot::new(entities)
}

fn trip_update(tu: &gtfs_rt::TripUpdate) -> TripUpdate {
    TripUpdate {
        trip_id: tu.trip.trip_id.clone(),
        route_id: tu.trip.route_id.clone(),
        direction_id: tu.trip.direction_id,
        start_date: tu.trip.start_date.clone(),
        start_time: tu.trip.start_time.clone(),
        vehicle_id: tu.vehicle.as_ref().and_then(|v| v.id.clone()),
        schedule_relationship: tu
            .trip
            .schedule_relationship
            .and_then(TripRelationship::from_i32),
        delay: tu.delay,
        timestamp: tu.timestamp,
    }
}

fn stop_time_update(
    trip_id: Option<String>,
    stu: &gtfs_rt::trip_update::StopTimeUpdate,
) -> StopTimeUpdate {
    StopTimeUpdate {
        trip_id,
        stop_id: stu.stop_id.clone(),
        stop_sequence: stu.stop_sequence,
        arrival_time: stu.arrival.as_ref().and_then(|a| a.time),
        departure_time: stu.departure.as_ref().and_then(|d| d.time),
        uncertainty: stu
            .arrival
            .as_ref()
            .and_then(|a| a.uncertainty)
            .or_else(|| stu.departure.as_ref().and_then(|d| d.uncertainty)),
        schedule_relationship: stu
            .schedule_relationship
            .and_then(StopRelationship::from_i32),
    }
}

fn vehicle_position(v: &gtfs_rt::VehiclePosition) -> VehiclePosition {
    let descriptor = v.vehicle.as_ref();
    let trip = v.trip.as_ref();
    let position = v.position.as_ref();

    VehiclePosition {
        vehicle_id: descriptor.and_then(|d| d.id.clone()),
        label: descriptor.and_then(|d| d.label.clone()),
        trip_id: trip.and_then(|t| t.trip_id.clone()),
        route_id: trip.and_then(|t| t.route_id.clone()),
        latitude: position.map_or(0.0, |p| p.latitude),
        longitude: position.map_or(0.0, |p| p.longitude),
        bearing: position.and_then(|p| p.bearing),
        speed: position.and_then(|p| p.speed),
        stop_id: v.stop_id.clone(),
        current_stop_sequence: v.current_stop_sequence,
        current_status: v.current_status,
        occupancy_status: v.occupancy_status,
        timestamp: v.timestamp,
    }
}
