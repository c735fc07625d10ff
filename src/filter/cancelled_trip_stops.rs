use std::collections::HashSet;

use anyhow::Result;

use super::Filter;
use crate::entity::{Entity, TripRelationship};

/// Drops stop time updates for trips whose trip update says the whole trip
/// is cancelled.
pub struct CancelledTripStops;

impl Filter for CancelledTripStops {
    fn name(&self) -> &'static str {
        "cancelled_trip_stops"
    }

    fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let cancelled: HashSet<String> = entities
            .iter()
            .filter_map(|e| match e {
                Entity::TripUpdate(t)
                    if t.schedule_relationship == Some(TripRelationship::Canceled) =>
                {
                    t.trip_id.clone()
                }
                _ => None,
            })
            .collect();

        if cancelled.is_empty() {
            return Ok(entities);
        }

        Ok(entities
            .into_iter()
            .filter(|e| match e {
                Entity::StopTimeUpdate(s) => s
                    .trip_id
                    .as_ref()
                    .is_none_or(|trip_id| !cancelled.contains(trip_id)),
                _ => true,
            })
            .collect())
    }
}
