//! Incremental geographic clustering of flights into launches and routes
//!
//! Inspired by k-means, except that the number of clusters is not fixed:
//! what is fixed is how far a flight may sit from its cluster's centroid.
//! Clusters are seeded one unclustered flight at a time, then each cluster
//! repeatedly pulls in matching flights from smaller clusters and drops
//! members that no longer match. A change is only committed when it does
//! not shrink net membership, which is what makes the iteration converge.

pub mod check;
pub mod definition;
mod driver;
mod reclassify;

use serde::{Deserialize, Serialize};

use crate::db::ClusterId;

pub use check::{check, CheckReport, Mismatch};
pub use definition::{ClusterDefinition, ClusterSnapshot};
pub use driver::classify;
pub use reclassify::Classifier;

/// Numeric knobs for the match predicates and the propagation driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Match radius around a launch centroid
    pub launch_radius_km: f64,
    /// Floor of the route match radius
    pub route_min_radius_km: f64,
    /// Route radius as a fraction of the members' average triangle distance
    pub route_radius_scale: f64,
    /// Bounding-box pre-filter half-height
    pub lat_margin_deg: f64,
    /// Bounding-box pre-filter half-width
    pub lng_margin_deg: f64,
    /// Propagation rounds before a run is cut short
    pub max_rounds: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            launch_radius_km: 3.0,
            route_min_radius_km: 3.0,
            route_radius_scale: 0.05,
            lat_margin_deg: 0.1,
            lng_margin_deg: 0.2,
            max_rounds: 10_000,
        }
    }
}

/// What a single reclassification did
#[derive(Debug, Clone, PartialEq)]
pub enum Reclassification {
    /// The cluster no longer has members (pruned earlier)
    Missing,
    /// Nothing to grow; no transaction was kept
    Unchanged,
    /// Net membership would have shrunk; the transaction was rolled back
    RolledBack { added: usize, removed: usize, pruned: usize },
    Committed { added: usize, removed: usize, pruned: usize, affected: Vec<ClusterId> },
}

impl Reclassification {
    /// Clusters to re-examine in the next propagation round
    pub fn affected_ids(&self) -> &[ClusterId] {
        match self {
            Reclassification::Committed { affected, .. } => affected,
            _ => &[],
        }
    }
}

/// Counters for one top-level run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// Propagation rounds across all runs
    pub rounds: usize,
    /// Sum of added + removed + pruned over committed reclassifications
    pub reclassified: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Clusters seeded by the creator
    pub created: usize,
    /// Propagations cut short by `max_rounds`
    pub truncated: usize,
}

impl RunStats {
    pub fn made_progress(&self) -> bool {
        self.reclassified + self.created > 0
    }
}
