use anyhow::Result;

use super::Filter;
use crate::entity::Entity;

/// Drops vehicle positions that are not assigned to a trip.
pub struct VehicleWithNoTrip;

impl Filter for VehicleWithNoTrip {
    fn name(&self) -> &'static str {
        "vehicle_with_no_trip"
    }

    fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        Ok(entities
            .into_iter()
            .filter(|e| !matches!(e, Entity::VehiclePosition(v) if v.trip_id.is_none()))
            .collect())
    }
}
