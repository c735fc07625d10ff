use anyhow::Result;

use super::Filter;
use crate::entity::{Entity, VehiclePosition};

/// Rounds vehicle speeds to whole metres per second.
pub struct RoundSpeed;

impl Filter for RoundSpeed {
    fn name(&self) -> &'static str {
        "round_speed"
    }

    fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        Ok(entities
            .into_iter()
            .map(|e| match e {
                Entity::VehiclePosition(v) if v.speed.is_some() => {
                    Entity::VehiclePosition(VehiclePosition {
                        speed: v.speed.map(f32::round),
                        ..v
                    })
                }
                other => other,
            })
            .collect())
    }
}
