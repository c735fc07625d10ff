use anyhow::Result;
use chrono::Utc;

use super::Filter;
use crate::entity::Entity;

/// Drops vehicle positions whose timestamp is older than `max_age_secs`.
/// Positions without a timestamp are kept.
pub struct StaleVehicle {
    max_age_secs: u64,
    now: fn() -> u64,
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

impl StaleVehicle {
    pub fn new(max_age_secs: u64) -> Self {
        Self {
            max_age_secs,
            now: unix_now,
        }
    }

    #[cfg(test)]
    fn with_clock(max_age_secs: u64, now: fn() -> u64) -> Self {
        Self { max_age_secs, now }
    }
}

impl Filter for StaleVehicle {
    fn name(&self) -> &'static str {
        "stale_vehicle"
    }

    fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let cutoff = (self.now)().saturating_sub(self.max_age_secs);
        Ok(entities
            .into_iter()
            .filter(|e| match e {
                Entity::VehiclePosition(v) => v.timestamp.is_none_or(|ts| ts >= cutoff),
                _ => true,
            })
            .collect())
    }
}
