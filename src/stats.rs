use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entity::{Entity, TripRelationship};

/// Per-cycle summary of an emitted batch, written as one CSV row.
#[derive(Debug, Default, Serialize)]
pub struct CycleStats {
    pub timestamp: DateTime<Utc>,
    pub total_entities: usize,

    // entity kinds
    pub trip_updates: usize,
    pub vehicles: usize,
    pub stop_time_updates: usize,
    pub other: usize,

    // trip fields
    pub cancelled_trips: usize,
    pub trips_with_route: usize,
    pub trips_with_vehicle: usize,

    // vehicle fields
    pub vehicles_with_trip: usize,
    pub vehicles_with_bearing: usize,
    pub vehicles_with_speed: usize,
    pub vehicles_with_timestamp: usize,

    // stop time fields
    pub stops_with_arrival: usize,
    pub stops_with_departure: usize,
}

impl CycleStats {
    pub fn from_entities(entities: &[Entity]) -> Self {
        let mut s = CycleStats {
            timestamp: Utc::now(),
            total_entities: entities.len(),
            ..Default::default()
        };

        for e in entities {
            match e {
                Entity::TripUpdate(t) => {
                    s.trip_updates += 1;

                    if t.schedule_relationship == Some(TripRelationship::Canceled) {
                        s.cancelled_trips += 1;
                    }

                    if t.route_id.is_some() {
                        s.trips_with_route += 1;
                    }

                    if t.vehicle_id.is_some() {
                        s.trips_with_vehicle += 1;
                    }
                }
                Entity::VehiclePosition(v) => {
                    s.vehicles += 1;

                    if v.trip_id.is_some() {
                        s.vehicles_with_trip += 1;
                    }

                    if v.bearing.is_some() {
                        s.vehicles_with_bearing += 1;
                    }

                    if v.speed.is_some() {
                        s.vehicles_with_speed += 1;
                    }

                    if v.timestamp.is_some() {
                        s.vehicles_with_timestamp += 1;
                    }
                }
                Entity::StopTimeUpdate(stu) => {
                    s.stop_time_updates += 1;

                    if stu.arrival_time.is_some() {
                        s.stops_with_arrival += 1;
                    }

                    if stu.departure_time.is_some() {
                        s.stops_with_departure += 1;
                    }
                }
                Entity::Other(_) => s.other += 1,
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    pub fn vehicles_with_trip_pct(&self) -> f64 {
        Self::pct(self.vehicles_with_trip, self.vehicles)
    }
}
