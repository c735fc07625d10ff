//! Demand bookkeeping and batch-window state for the coordinator.
//!
//! [`Batcher`] is the synchronous core of the coordinator: it owns the
//! [`MergeTable`], the per-source demand counters and the filter chain, and
//! decides when a timer must be armed and which sources get new demand after
//! a cycle. It never sleeps or sends; the async runner in
//! [`crate::coordinator`] turns its decisions into timers and channel sends.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::filter::FilterChain;
use crate::merge::{MergeTable, SourceId, Snapshot};
use crate::sort::sort_by_kind;

/// Demand granted on subscription and on every re-ask.
pub const INITIAL_DEMAND: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// No timer pending.
    Idle,
    /// A timer is pending and deliveries are accumulating.
    Batching,
}

/// What the runner must do after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First delivery of a window: arm the batch timer.
    ArmTimer,
    /// A timer is already pending.
    Batched,
    /// The delivery was discarded (unknown source or empty).
    Ignored,
}

/// Output of one completed merge cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub entities: Vec<Entity>,
    /// Sources that exhausted their demand and were re-asked for
    /// [`INITIAL_DEMAND`] more.
    pub regrants: Vec<SourceId>,
}

pub struct Batcher {
    table: MergeTable,
    demand: HashMap<SourceId, usize>,
    filters: FilterChain,
    state: BatchState,
    violations: u64,
}

impl Batcher {
    pub fn new(filters: FilterChain) -> Self {
        Self {
            table: MergeTable::new(),
            demand: HashMap::new(),
            filters,
            state: BatchState::Idle,
            violations: 0,
        }
    }

    /// Registers a source and returns the demand to grant it.
    pub fn subscribe(&mut self, source: SourceId) -> usize {
        self.subscribe_with_demand(source, INITIAL_DEMAND)
    }

    /// Registers a source with an explicit initial credit.
    pub fn subscribe_with_demand(&mut self, source: SourceId, demand: usize) -> usize {
        self.table.add(source);
        self.demand.insert(source, demand);
        info!(source = %source, demand, "Source subscribed");
        demand
    }

    /// Forgets a source. Its snapshot no longer contributes to any cycle.
    pub fn cancel(&mut self, source: SourceId, reason: &str) {
        let known = self.demand.remove(&source).is_some();
        self.table.remove(source);
        if known {
            info!(source = %source, reason, "Source cancelled");
        } else {
            debug!(source = %source, reason, "Cancel for unknown source");
        }
    }

    /// Accepts a delivery of one or more snapshots from `source`.
    ///
    /// Only the last snapshot is kept. Demand is decremented by the number of
    /// snapshots delivered and clamped at zero; over-delivery and deliveries
    /// from unregistered sources are logged as protocol violations.
    pub fn receive(&mut self, source: SourceId, mut events: Vec<Snapshot>) -> Receipt {
        let count = events.len();
        let Some(last) = events.pop() else {
            warn!(source = %source, "Empty delivery ignored");
            return Receipt::Ignored;
        };

        let Some(credit) = self.demand.get_mut(&source) else {
            self.violations += 1;
            warn!(source = %source, events = count, "Delivery from unregistered source ignored");
            return Receipt::Ignored;
        };

        if count > *credit {
            self.violations += 1;
            warn!(
                source = %source,
                events = count,
                credit = *credit,
                "Source delivered more than its demand; clamping to zero"
            );
        }
        *credit = credit.saturating_sub(count);

        debug!(
            source = %source,
            events = count,
            entities = last.len(),
            remaining = *credit,
            "Snapshot received"
        );

        if let Err(e) = self.table.update(source, last) {
            // demand and table are registered together
            self.violations += 1;
            warn!(error = %e, "Merge table out of sync with demand map");
            return Receipt::Ignored;
        }

        match self.state {
            BatchState::Idle => {
                self.state = BatchState::Batching;
                Receipt::ArmTimer
            }
            BatchState::Batching => Receipt::Batched,
        }
    }

    /// Runs merge, sort and filter for the current window.
    ///
    /// Returns `Ok(None)` when no window is open. After a successful cycle
    /// the state is `Idle` and every source with zero demand is re-asked.
    ///
    /// # Errors
    ///
    /// A filter failure is returned as-is and leaves demand untouched; the
    /// caller is expected to treat it as fatal.
    pub fn fire(&mut self) -> Result<Option<Cycle>> {
        if self.state != BatchState::Batching {
            warn!("Timer fired with no open batch window");
            return Ok(None);
        }

        let merged = self.table.items();
        let sorted = sort_by_kind(merged);
        let entities = self.filters.run(sorted)?;

        self.state = BatchState::Idle;

        let mut regrants: Vec<SourceId> = self
            .demand
            .iter_mut()
            .filter(|(_, credit)| **credit == 0)
            .map(|(source, credit)| {
                *credit = INITIAL_DEMAND;
                *source
            })
            .collect();
        regrants.sort();

        info!(
            entities = entities.len(),
            sources = self.table.len(),
            regrants = regrants.len(),
            "Batch cycle complete"
        );

        Ok(Some(Cycle { entities, regrants }))
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn demand(&self, source: SourceId) -> Option<usize> {
        self.demand.get(&source).copied()
    }

    /// Number of protocol violations seen so far.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn table(&self) -> &MergeTable {
        &self.table
    }

    pub fn is_registered(&self, source: SourceId) -> bool {
        self.demand.contains_key(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{StopTimeUpdate, TripUpdate, VehiclePosition};
    use crate::filter::{Filter, VehicleWithNoTrip};
    use crate::gtfs_rt::FeedEntity;

    fn trip(id: &str) -> Entity {
        TripUpdate {
            trip_id: Some(id.to_string()),
            ..Default::default()
        }
        .into()
    }

    fn snapshot(ids: &[&str]) -> Snapshot {
        Snapshot::new(ids.iter().map(|id| trip(id)).collect())
    }

    #[test]
    fn test_subscribe_grants_one() {
        let mut batcher = Batcher::new(FilterChain::default());
        assert_eq!(batcher.subscribe(SourceId(1)), 1);
        assert_eq!(batcher.demand(SourceId(1)), Some(1));
        assert!(batcher.table().contains(SourceId(1)));
        assert_eq!(batcher.state(), BatchState::Idle);
    }

    #[test]
    fn test_keeps_only_last_snapshot_of_delivery() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe_with_demand(SourceId(1), 3);

        batcher.receive(
            SourceId(1),
            vec![snapshot(&["a"]), snapshot(&["b"]), snapshot(&["c", "d"])],
        );

        assert_eq!(
            batcher.table().snapshot(SourceId(1)),
            Some(&snapshot(&["c", "d"]))
        );
    }

    #[test]
    fn test_demand_clamps_and_records_violation() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe(SourceId(1));

        let receipt = batcher.receive(SourceId(1), vec![snapshot(&["a"]), snapshot(&["b"])]);

        assert_eq!(receipt, Receipt::ArmTimer);
        assert_eq!(batcher.demand(SourceId(1)), Some(0));
        assert_eq!(batcher.violations(), 1);
        // the delivery is still used
        assert_eq!(batcher.table().snapshot(SourceId(1)), Some(&snapshot(&["b"])));
    }

    #[test]
    fn test_only_first_delivery_arms_timer() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe(SourceId(1));
        batcher.subscribe(SourceId(2));

        assert_eq!(batcher.receive(SourceId(1), vec![snapshot(&["a"])]), Receipt::ArmTimer);
        assert_eq!(batcher.state(), BatchState::Batching);
        assert_eq!(batcher.receive(SourceId(2), vec![snapshot(&["b"])]), Receipt::Batched);
        assert_eq!(batcher.receive(SourceId(1), vec![snapshot(&["c"])]), Receipt::Batched);
    }

    #[test]
    fn test_unregistered_and_empty_deliveries_ignored() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe(SourceId(1));

        assert_eq!(batcher.receive(SourceId(7), vec![snapshot(&["a"])]), Receipt::Ignored);
        assert_eq!(batcher.receive(SourceId(1), vec![]), Receipt::Ignored);
        assert_eq!(batcher.violations(), 1);
        assert_eq!(batcher.state(), BatchState::Idle);
        assert_eq!(batcher.demand(SourceId(1)), Some(1));
    }

    #[test]
    fn test_fire_when_idle_is_noop() {
        let mut batcher = Batcher::new(FilterChain::default());
        assert_eq!(batcher.fire().unwrap(), None);
    }

    #[test]
    fn test_fire_reasks_only_exhausted_sources() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe(SourceId(1));
        batcher.subscribe_with_demand(SourceId(2), 3);
        batcher.subscribe(SourceId(3));

        batcher.receive(SourceId(1), vec![snapshot(&["a"])]);
        batcher.receive(SourceId(2), vec![snapshot(&["b"])]);

        let cycle = batcher.fire().unwrap().unwrap();
        assert_eq!(cycle.regrants, vec![SourceId(1)]);
        assert_eq!(batcher.demand(SourceId(1)), Some(1));
        assert_eq!(batcher.demand(SourceId(2)), Some(2));
        assert_eq!(batcher.demand(SourceId(3)), Some(1));
        assert_eq!(batcher.state(), BatchState::Idle);
    }

    #[test]
    fn test_fire_sorts_and_filters() {
        let chain = FilterChain::new(vec![Box::new(VehicleWithNoTrip)]);
        let mut batcher = Batcher::new(chain);
        batcher.subscribe(SourceId(1));

        let alert = Entity::Other(FeedEntity {
            id: "alert".to_string(),
            ..Default::default()
        });
        let stop: Entity = StopTimeUpdate {
            trip_id: Some("T1".to_string()),
            stop_sequence: Some(1),
            ..Default::default()
        }
        .into();
        let vehicle: Entity = VehiclePosition {
            vehicle_id: Some("v1".to_string()),
            trip_id: Some("T1".to_string()),
            ..Default::default()
        }
        .into();
        let lost: Entity = VehiclePosition {
            vehicle_id: Some("v2".to_string()),
            ..Default::default()
        }
        .into();

        batcher.receive(
            SourceId(1),
            vec![Snapshot::new(vec![
                alert.clone(),
                stop.clone(),
                lost,
                vehicle.clone(),
                trip("T1"),
            ])],
        );

        let cycle = batcher.fire().unwrap().unwrap();
        assert_eq!(cycle.entities, vec![trip("T1"), vehicle, stop, alert]);
    }

    #[test]
    fn test_filter_error_keeps_window_open() {
        struct Broken;
        impl Filter for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn filter(&self, _: Vec<Entity>) -> Result<Vec<Entity>> {
                anyhow::bail!("bad entity")
            }
        }

        let mut batcher = Batcher::new(FilterChain::new(vec![Box::new(Broken)]));
        batcher.subscribe(SourceId(1));
        batcher.receive(SourceId(1), vec![snapshot(&["a"])]);

        assert!(batcher.fire().is_err());
        assert_eq!(batcher.state(), BatchState::Batching);
        assert_eq!(batcher.demand(SourceId(1)), Some(0));
    }

    #[test]
    fn test_cancelled_source_excluded_from_cycle() {
        let mut batcher = Batcher::new(FilterChain::default());
        batcher.subscribe(SourceId(1));
        batcher.subscribe(SourceId(2));
        batcher.receive(SourceId(1), vec![snapshot(&["a"])]);
        batcher.receive(SourceId(2), vec![snapshot(&["b"])]);

        batcher.cancel(SourceId(1), "disconnected");
        assert!(!batcher.is_registered(SourceId(1)));

        let cycle = batcher.fire().unwrap().unwrap();
        assert_eq!(cycle.entities, vec![trip("b")]);
        assert_eq!(cycle.regrants, vec![SourceId(2)]);
    }
}
