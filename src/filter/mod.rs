//! Ordered chain of entity filters applied to every merged cycle.
//!
//! Filters see the whole sorted list and return the list to hand to the
//! next filter. They are not told which source produced which entity.

mod cancelled_trip_stops;
mod round_speed;
mod stale_vehicle;
mod vehicle_with_no_trip;

pub use cancelled_trip_stops::CancelledTripStops;
pub use round_speed::RoundSpeed;
pub use stale_vehicle::StaleVehicle;
pub use vehicle_with_no_trip::VehicleWithNoTrip;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::trace;

use crate::entity::Entity;

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the entities to keep, in order. Implementations must not
    /// reorder entities they keep.
    fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>>;
}

/// Filter selection as it appears in the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    VehicleWithNoTrip,
    RoundSpeed,
    StaleVehicle { max_age_secs: u64 },
    CancelledTripStops,
}

impl FilterConfig {
    pub fn build(&self) -> Box<dyn Filter> {
        match self {
            FilterConfig::VehicleWithNoTrip => Box::new(VehicleWithNoTrip),
            FilterConfig::RoundSpeed => Box::new(RoundSpeed),
            FilterConfig::StaleVehicle { max_age_secs } => {
                Box::new(StaleVehicle::new(*max_age_secs))
            }
            FilterConfig::CancelledTripStops => Box::new(CancelledTripStops),
        }
    }
}

/// Immutable, constructor-time list of filters.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn from_config(configs: &[FilterConfig]) -> Self {
        Self::new(configs.iter().map(FilterConfig::build).collect())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs every filter left to right; output of one is input of the next.
    ///
    /// # Errors
    ///
    /// Stops at the first failing filter and returns its error, annotated
    /// with the filter name. No partially filtered list is returned.
    pub fn run(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        self.filters.iter().try_fold(entities, |entities, filter| {
            let before = entities.len();
            let kept = filter
                .filter(entities)
                .with_context(|| format!("filter '{}' failed", filter.name()))?;
            trace!(filter = filter.name(), before, after = kept.len(), "Filter applied");
            Ok(kept)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TripUpdate;

    struct DropFirst;

    impl Filter for DropFirst {
        fn name(&self) -> &'static str {
            "drop_first"
        }

        fn filter(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
            Ok(entities.into_iter().skip(1).collect())
        }
    }

    struct Failing;

    impl Filter for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn filter(&self, _entities: Vec<Entity>) -> Result<Vec<Entity>> {
            anyhow::bail!("boom")
        }
    }

    fn trips(ids: &[&str]) -> Vec<Entity> {
        ids.iter()
            .map(|id| {
                TripUpdate {
                    trip_id: Some(id.to_string()),
                    ..Default::default()
                }
                .into()
            })
            .collect()
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = FilterChain::default();
        assert_eq!(chain.run(trips(&["a", "b"])).unwrap(), trips(&["a", "b"]));
    }

    #[test]
    fn test_filters_run_in_order() {
        let chain = FilterChain::new(vec![Box::new(DropFirst), Box::new(DropFirst)]);
        assert_eq!(chain.run(trips(&["a", "b", "c"])).unwrap(), trips(&["c"]));
    }

    #[test]
    fn test_error_names_filter() {
        let chain = FilterChain::new(vec![Box::new(DropFirst), Box::new(Failing)]);
        let err = chain.run(trips(&["a"])).unwrap_err();
        assert_eq!(err.to_string(), "filter 'failing' failed");
        assert_eq!(err.root_cause().to_string(), "boom");
    }

    #[test]
    fn test_config_parses_tagged_filters() {
        let configs: Vec<FilterConfig> = serde_json::from_str(
            r#"[
                {"type": "vehicle_with_no_trip"},
                {"type": "stale_vehicle", "max_age_secs": 600},
                {"type": "round_speed"},
                {"type": "cancelled_trip_stops"}
            ]"#,
        )
        .unwrap();

        let chain = FilterChain::from_config(&configs);
        assert_eq!(
            chain.names(),
            vec![
                "vehicle_with_no_trip",
                "stale_vehicle",
                "round_speed",
                "cancelled_trip_stops"
            ]
        );
    }
}
