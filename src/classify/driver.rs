use std::collections::HashSet;

use super::reclassify::Classifier;
use super::{ClusterParams, RunStats};
use crate::db::{ClusterId, ClusterKind, Database};
use crate::error::Result;

impl<'a> Classifier<'a> {
    /// Breadth-first propagation: reclassify every queued cluster, queue
    /// whatever they report as affected, repeat until a round is quiet.
    pub fn run(&mut self, seeds: Vec<ClusterId>) -> Result<()> {
        let kind = self.kind;
        let mut queue = dedup(seeds);
        let mut rounds = 0;

        while !queue.is_empty() {
            if rounds >= self.params.max_rounds {
                elog!(
                    "[Classify] Stopping {} propagation after {} rounds, {} {}s still queued",
                    kind, rounds, queue.len(), kind
                );
                self.stats.truncated += 1;
                break;
            }
            rounds += 1;
            self.stats.rounds += 1;
            log!("[Classify] Reclustering {}s {}", kind, join_ids(&queue));

            let mut next = Vec::new();
            for id in queue {
                let outcome = self.reclassify(id)?;
                let more = outcome.affected_ids();
                if more.is_empty() {
                    continue;
                }
                log!("[Classify] Affected {}s: {}", kind, join_ids(more));
                next.extend_from_slice(more);
            }
            log!("[Classify] --");
            queue = dedup(next);
        }
        log!("[Classify] ==================");
        Ok(())
    }

    /// Full convergence pass. With `single`, only propagate from that
    /// cluster. Otherwise reclassify every existing cluster, then seed and
    /// converge new clusters until no flight is left unclustered.
    pub fn classify(&mut self, single: Option<ClusterId>) -> Result<&RunStats> {
        if let Some(id) = single {
            self.run(vec![id])?;
            return Ok(&self.stats);
        }

        let all = self.db.list_cluster_ids(self.kind)?;
        log!("[Classify] {} existing {}s", all.len(), self.kind);
        self.run(all)?;

        while let Some(created) = self.create()? {
            self.run(vec![created])?;
        }
        Ok(&self.stats)
    }
}

/// Top-level entry point: converge `kind` and return the run counters
pub fn classify(
    db: &Database,
    kind: ClusterKind,
    single: Option<ClusterId>,
    params: ClusterParams,
) -> Result<RunStats> {
    let mut classifier = Classifier::new(db, kind, params);
    classifier.classify(single)?;
    let stats = classifier.into_stats();
    log!(
        "[Classify] Total flights reclustered {} ({} commits, {} rollbacks, {} created)",
        stats.reclassified, stats.committed, stats.rolled_back, stats.created
    );
    Ok(stats)
}

/// Drop repeated ids, keeping first occurrences in order
fn dedup(ids: Vec<ClusterId>) -> Vec<ClusterId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn join_ids(ids: &[ClusterId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::check;
    use crate::classify::reclassify::tests::insert;
    use crate::geo::{self, LatLng};

    fn alps() -> LatLng {
        LatLng::new(45.9, 6.4)
    }

    #[test]
    fn test_dedup_keeps_first_order() {
        let ids = vec![ClusterId(3), ClusterId(1), ClusterId(3), ClusterId(2), ClusterId(1)];
        assert_eq!(dedup(ids), vec![ClusterId(3), ClusterId(1), ClusterId(2)]);
    }

    #[test]
    fn test_example_scenario_two_routes() {
        let db = Database::in_memory().unwrap();
        let origin = alps();
        let close = [
            insert(&db, "a", origin),
            insert(&db, "b", geo::offset_km(&origin, 1.2, 0.4)),
            insert(&db, "c", geo::offset_km(&origin, 0.3, -1.1)),
        ];
        let lone = insert(&db, "lone", geo::offset_km(&origin, 50.0, 0.0));

        let stats = classify(&db, ClusterKind::Route, None, ClusterParams::default()).unwrap();
        assert!(stats.made_progress());
        assert_eq!(stats.rolled_back, 0);

        let routes = db.list_clusters(ClusterKind::Route, 10).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].flights, 3);
        assert_eq!(routes[1].flights, 1);
        assert_eq!(db.count_unassigned(ClusterKind::Route).unwrap(), 0);

        let route_of = |f: i64| db.get_flight(f).unwrap().unwrap().route_id.unwrap();
        assert!(close.iter().all(|&f| route_of(f) == routes[0].id));
        assert_eq!(route_of(lone), routes[1].id);

        // Rerun on a stable store: nothing to do
        let again = classify(&db, ClusterKind::Route, None, ClusterParams::default()).unwrap();
        assert!(!again.made_progress());
        assert_eq!(again.committed, 0);
        assert_eq!(again.created, 0);
        assert_eq!(db.list_clusters(ClusterKind::Route, 10).unwrap().len(), 2);
        assert!(close.iter().all(|&f| route_of(f) == routes[0].id));
    }

    #[test]
    fn test_converges_three_centers() {
        let db = Database::in_memory().unwrap();
        let centers = [
            alps(),
            geo::offset_km(&alps(), 40.0, 0.0),
            geo::offset_km(&alps(), 0.0, 40.0),
        ];
        let jitter = [(0.0, 0.0), (0.4, 0.2), (-0.3, 0.5), (0.2, -0.6), (-0.5, -0.3)];
        for (c, center) in centers.iter().enumerate() {
            for (j, (dx, dy)) in jitter.iter().enumerate() {
                insert(&db, &format!("c{}-{}", c, j), geo::offset_km(center, *dx, *dy));
            }
        }

        for kind in ClusterKind::ALL {
            let stats = classify(&db, kind, None, ClusterParams::default()).unwrap();
            let clusters = db.list_clusters(kind, 10).unwrap();
            assert_eq!(clusters.len(), 3, "{} clusters", kind);
            assert!(clusters.iter().all(|c| c.flights == 5));
            assert_eq!(stats.created, 3);
            assert_eq!(stats.truncated, 0);
            assert!(stats.rounds <= 3 * clusters.len(), "{} rounds", stats.rounds);
            assert_eq!(db.count_unassigned(kind).unwrap(), 0);

            let report = check(&db, kind, &ClusterParams::default()).unwrap();
            assert!(report.is_consistent(), "{:?}", report);
        }
    }

    #[test]
    fn test_new_flights_join_existing_cluster() {
        let db = Database::in_memory().unwrap();
        let origin = alps();
        insert(&db, "a", origin);
        insert(&db, "b", geo::offset_km(&origin, 0.5, 0.5));
        classify(&db, ClusterKind::Launch, None, ClusterParams::default()).unwrap();
        let launch = db.list_cluster_ids(ClusterKind::Launch).unwrap();
        assert_eq!(launch.len(), 1);

        // A later import near the same launch site
        let late = insert(&db, "late", geo::offset_km(&origin, -0.4, 0.2));
        let stats = classify(&db, ClusterKind::Launch, None, ClusterParams::default()).unwrap();
        assert!(stats.made_progress());
        assert_eq!(stats.created, 0);
        assert_eq!(db.get_flight(late).unwrap().unwrap().launch_id, Some(launch[0]));
        assert_eq!(db.list_cluster_ids(ClusterKind::Launch).unwrap(), launch);
    }

    #[test]
    fn test_single_cluster_run_does_not_seed() {
        let db = Database::in_memory().unwrap();
        let origin = alps();
        let a = insert(&db, "a", origin);
        insert(&db, "b", geo::offset_km(&origin, 0.5, 0.0));
        insert(&db, "far", geo::offset_km(&origin, 60.0, 0.0));

        let id = db.create_cluster(ClusterKind::Route).unwrap();
        db.assign_flight(ClusterKind::Route, a, Some(id)).unwrap();

        let stats = classify(&db, ClusterKind::Route, Some(id), ClusterParams::default()).unwrap();
        assert_eq!(stats.created, 0);
        assert_eq!(stats.committed, 1);
        // The far flight is left for a full run to seed
        assert_eq!(db.count_unassigned(ClusterKind::Route).unwrap(), 1);
    }

    #[test]
    fn test_single_missing_cluster_is_not_progress() {
        let db = Database::in_memory().unwrap();
        let stats = classify(&db, ClusterKind::Route, Some(ClusterId(7)), ClusterParams::default()).unwrap();
        assert!(!stats.made_progress());
        assert_eq!(stats.rounds, 1);
    }

    #[test]
    fn test_round_limit_stops_propagation() {
        let db = Database::in_memory().unwrap();
        let origin = alps();
        let a = insert(&db, "a", origin);
        insert(&db, "b", geo::offset_km(&origin, 0.5, 0.0));
        let id = db.create_cluster(ClusterKind::Route).unwrap();
        db.assign_flight(ClusterKind::Route, a, Some(id)).unwrap();

        let params = ClusterParams { max_rounds: 1, ..ClusterParams::default() };
        let stats = classify(&db, ClusterKind::Route, Some(id), params).unwrap();
        // The commit re-queues the cluster, which the limit then cuts off
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.truncated, 1);
        assert_eq!(stats.committed, 1);
    }
}
