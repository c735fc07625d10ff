//! Output formatting and persistence for merged batches.
//!
//! Rebuilds a GTFS-RT [`FeedMessage`] from merged entities, encodes it, and
//! appends per-cycle statistics to CSV.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use prost::Message;
use tracing::{debug, info, trace};

use crate::entity::{Entity, StopTimeUpdate, TripUpdate, VehiclePosition};
use crate::gtfs_rt::{
    self, FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, VehicleDescriptor,
    trip_update::StopTimeEvent,
};
use crate::stats::CycleStats;

pub const GTFS_RT_VERSION: &str = "2.0";

/// Reassembles merged entities into a full-dataset feed.
///
/// Stop time updates are regrouped under the trip update with the same trip
/// id; a trip with stops but no trip update gets a bare trip descriptor.
/// Stop time updates without a trip id cannot be placed and are dropped.
pub fn build_feed(entities: &[Entity], timestamp: u64) -> FeedMessage {
    let mut out: Vec<FeedEntity> = Vec::with_capacity(entities.len());
    let mut trips: HashMap<String, usize> = HashMap::new();
    let mut dropped = 0usize;

    for (i, e) in entities.iter().enumerate() {
        match e {
            Entity::TripUpdate(t) => {
                let descriptor = trip_descriptor(t);
                match t.trip_id.as_ref().and_then(|id| trips.get(id)) {
                    Some(&pos) => {
                        if let Some(tu) = out[pos].trip_update.as_mut() {
                            fill_trip_update(tu, t, descriptor);
                        }
                    }
                    None => {
                        let mut tu = gtfs_rt::TripUpdate::default();
                        fill_trip_update(&mut tu, t, descriptor);
                        let id = match &t.trip_id {
                            Some(trip_id) => {
                                trips.insert(trip_id.clone(), out.len());
                                format!("trip-{trip_id}")
                            }
                            None => format!("trip-{i}"),
                        };
                        out.push(FeedEntity {
                            id,
                            trip_update: Some(tu),
                            ..Default::default()
                        });
                    }
                }
            }
            Entity::StopTimeUpdate(stu) => {
                let Some(trip_id) = &stu.trip_id else {
                    dropped += 1;
                    continue;
                };
                let pos = *trips.entry(trip_id.clone()).or_insert_with(|| {
                    out.push(FeedEntity {
                        id: format!("trip-{trip_id}"),
                        trip_update: Some(gtfs_rt::TripUpdate {
                            trip: TripDescriptor {
                                trip_id: Some(trip_id.clone()),
                                ..Default::default()
                            },
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                    out.len() - 1
                });
                if let Some(tu) = out[pos].trip_update.as_mut() {
                    tu.stop_time_update.push(stop_time_update(stu));
                }
            }
            Entity::VehiclePosition(v) => {
                let id = match &v.vehicle_id {
                    Some(vehicle_id) => format!("vehicle-{vehicle_id}"),
                    None => format!("vehicle-{i}"),
                };
                out.push(FeedEntity {
                    id,
                    vehicle: Some(vehicle_position(v)),
                    ..Default::default()
                });
            }
            Entity::Other(other) => out.push(other.clone()),
        }
    }

    if dropped > 0 {
        trace!(dropped, "Stop time updates without trip id dropped");
    }

    FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: GTFS_RT_VERSION.to_string(),
            incrementality: Some(0),
            timestamp: Some(timestamp),
            feed_version: None,
        },
        entity: out,
    }
}

fn trip_descriptor(t: &TripUpdate) -> TripDescriptor {
    TripDescriptor {
        trip_id: t.trip_id.clone(),
        route_id: t.route_id.clone(),
        direction_id: t.direction_id,
        start_time: t.start_time.clone(),
        start_date: t.start_date.clone(),
        schedule_relationship: t.schedule_relationship.map(|r| r.as_i32()),
    }
}

fn fill_trip_update(tu: &mut gtfs_rt::TripUpdate, t: &TripUpdate, descriptor: TripDescriptor) {
    tu.trip = descriptor;
    tu.vehicle = t.vehicle_id.clone().map(|id| VehicleDescriptor {
        id: Some(id),
        ..Default::default()
    });
    tu.timestamp = t.timestamp;
    tu.delay = t.delay;
}

fn stop_time_update(stu: &StopTimeUpdate) -> gtfs_rt::trip_update::StopTimeUpdate {
    let event = |time: Option<i64>| {
        time.map(|time| StopTimeEvent {
            time: Some(time),
            uncertainty: stu.uncertainty,
            delay: None,
        })
    };

    gtfs_rt::trip_update::StopTimeUpdate {
        stop_sequence: stu.stop_sequence,
        stop_id: stu.stop_id.clone(),
        arrival: event(stu.arrival_time),
        departure: event(stu.departure_time),
        schedule_relationship: stu.schedule_relationship.map(|r| r.as_i32()),
    }
}

fn vehicle_position(v: &VehiclePosition) -> gtfs_rt::VehiclePosition {
    let trip = (v.trip_id.is_some() || v.route_id.is_some()).then(|| TripDescriptor {
        trip_id: v.trip_id.clone(),
        route_id: v.route_id.clone(),
        ..Default::default()
    });
    let vehicle = (v.vehicle_id.is_some() || v.label.is_some()).then(|| VehicleDescriptor {
        id: v.vehicle_id.clone(),
        label: v.label.clone(),
        license_plate: None,
    });

    gtfs_rt::VehiclePosition {
        trip,
        vehicle,
        position: Some(Position {
            latitude: v.latitude,
            longitude: v.longitude,
            bearing: v.bearing,
            odometer: None,
            speed: v.speed,
        }),
        current_stop_sequence: v.current_stop_sequence,
        stop_id: v.stop_id.clone(),
        current_status: v.current_status,
        timestamp: v.timestamp,
        occupancy_status: v.occupancy_status,
        ..Default::default()
    }
}

/// Serializes a feed to protobuf bytes.
pub fn encode_feed(feed: &FeedMessage) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(feed.encoded_len());
    feed.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Gzip-compresses `bytes` with the default compression level.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Logs cycle statistics as pretty-printed JSON.
pub fn print_json(stats: &CycleStats) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

/// Appends a [`CycleStats`] record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, stats: &CycleStats) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(stats)?;
    writer.flush()?;

    Ok(())
}
