//! Audit of a converged store: no empty clusters, and every assignment
//! satisfies its cluster's match predicate against the current centroid.

use serde::Serialize;

use super::{ClusterParams, ClusterSnapshot};
use crate::db::{ClusterId, ClusterKind, Database};
use crate::error::Result;

/// A flight assigned to a cluster it no longer matches
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub flight_id: i64,
    pub cluster_id: ClusterId,
    /// Distance of the flight's furthest defining point from the centroid
    pub worst_km: f64,
    pub radius_km: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub kind: ClusterKind,
    pub clusters: usize,
    pub empty_clusters: Vec<ClusterId>,
    pub mismatches: Vec<Mismatch>,
    pub unassigned: i64,
}

impl CheckReport {
    pub fn is_consistent(&self) -> bool {
        self.empty_clusters.is_empty() && self.mismatches.is_empty()
    }
}

pub fn check(db: &Database, kind: ClusterKind, params: &ClusterParams) -> Result<CheckReport> {
    let def = kind.definition();
    let ids = db.list_cluster_ids(kind)?;
    let mut mismatches = Vec::new();

    for &id in &ids {
        let snapshot = {
            let conn = db.conn();
            ClusterSnapshot::load(&conn, kind, id, params)?
        };
        let Some(snapshot) = snapshot else {
            continue;
        };
        for flight in db.flights_in_cluster(kind, id)? {
            if snapshot.matches(&flight.geometry, params) {
                continue;
            }
            let worst_km = def
                .anchors
                .iter()
                .zip(&snapshot.centroid)
                .map(|(a, c)| flight.geometry.point(a.point).distance_km(c))
                .fold(0.0, f64::max);
            mismatches.push(Mismatch {
                flight_id: flight.id,
                cluster_id: id,
                worst_km,
                radius_km: snapshot.radius_km,
            });
        }
    }

    let report = CheckReport {
        kind,
        clusters: ids.len(),
        empty_clusters: db.empty_cluster_ids(kind)?,
        mismatches,
        unassigned: db.count_unassigned(kind)?,
    };
    if !report.is_consistent() {
        elog!(
            "[Check] {}: {} empty clusters, {} mismatched flights",
            kind,
            report.empty_clusters.len(),
            report.mismatches.len()
        );
    }
    Ok(report)
}
