use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use super::definition::ClusterSnapshot;
use super::{ClusterParams, Reclassification, RunStats};
use crate::db::{ClusterId, ClusterKind, Database};
use crate::error::Result;

/// Reclassifier and creator for one cluster kind. Holds no cluster state
/// between calls: every step re-reads the aggregate view.
pub struct Classifier<'a> {
    pub(super) db: &'a Database,
    pub(super) kind: ClusterKind,
    pub(super) params: ClusterParams,
    pub(super) stats: RunStats,
}

impl<'a> Classifier<'a> {
    pub fn new(db: &'a Database, kind: ClusterKind, params: ClusterParams) -> Self {
        Self { db, kind, params, stats: RunStats::default() }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn into_stats(self) -> RunStats {
        self.stats
    }

    /// Recompute one cluster's membership.
    ///
    /// Grows the cluster with every matching flight that is unassigned or
    /// sits in a cluster no bigger than this one, drops members that no
    /// longer match the grown centroid, prunes empty clusters, and commits
    /// only if `added >= removed + pruned`.
    pub fn reclassify(&mut self, id: ClusterId) -> Result<Reclassification> {
        let kind = self.kind;
        let def = kind.definition();
        let mut conn = self.db.conn();

        let Some(snapshot) = ClusterSnapshot::load(&conn, kind, id, &self.params)? else {
            log!("[Classify] {} {} has been nulled", kind, id);
            return Ok(Reclassification::Missing);
        };
        log!("[Classify] reclustering {} {} ({} flights)", kind, id, snapshot.flights);

        let predicate = def.match_predicate();
        let affected = self.affected_clusters(&conn, &snapshot, &predicate)?;
        log!("[Classify] affect: {} {} -> {} {}s", kind, id, affected.len(), kind);

        // Dropping `tx` on any early return rolls back
        let tx = conn.transaction()?;

        let grow = snapshot
            .predicate_params(&self.params)
            .with("id", id.0)
            .with("flights", snapshot.flights);
        let added = tx.execute(
            &format!(
                "UPDATE flight SET {fk} = :id
                 WHERE ({fk} IS NULL OR {fk} IN (SELECT id FROM {view} WHERE flights <= :flights))
                   AND {fk} IS NOT :id
                   AND {predicate}",
                fk = def.foreign_key,
                view = def.view,
                predicate = predicate,
            ),
            grow.as_refs().as_slice(),
        )?;
        log!("[Classify] grow: {} {} +{} flights", kind, id, added);
        if added == 0 {
            return Ok(Reclassification::Unchanged);
        }

        // Shrink against the centroid as it stands after growing
        let Some(grown) = ClusterSnapshot::load(&tx, kind, id, &self.params)? else {
            return Ok(Reclassification::Missing);
        };
        let shrink = grown.predicate_params(&self.params).with("id", id.0);
        let removed = tx.execute(
            &format!(
                "UPDATE flight SET {fk} = NULL WHERE {fk} = :id AND NOT ({predicate})",
                fk = def.foreign_key,
                predicate = predicate,
            ),
            shrink.as_refs().as_slice(),
        )?;
        log!("[Classify] reduce: {} {} -{} flights", kind, id, removed);

        let pruned = tx.execute(
            &format!(
                "DELETE FROM {table} WHERE id NOT IN
                    (SELECT DISTINCT {fk} FROM flight WHERE {fk} IS NOT NULL)",
                table = def.table,
                fk = def.foreign_key,
            ),
            [],
        )?;
        log!("[Classify] prune {}s: {} {}s", kind, pruned, kind);

        if added < removed + pruned {
            log!("[Classify] Non-convergent modification, rolling back");
            tx.rollback()?;
            self.stats.rolled_back += 1;
            return Ok(Reclassification::RolledBack { added, removed, pruned });
        }
        tx.commit()?;

        self.stats.committed += 1;
        self.stats.reclassified += added + removed + pruned;

        let mut affected = affected;
        if !affected.contains(&id) {
            affected.push(id);
        }
        Ok(Reclassification::Committed { added, removed, pruned, affected })
    }

    /// Strictly smaller clusters owning at least one flight that matches
    /// this cluster: they may lose members to it.
    fn affected_clusters(
        &self,
        conn: &Connection,
        snapshot: &ClusterSnapshot,
        predicate: &str,
    ) -> Result<Vec<ClusterId>> {
        let def = self.kind.definition();
        let named = snapshot
            .predicate_params(&self.params)
            .with("flights", snapshot.flights);
        let mut stmt = conn.prepare(&format!(
            "SELECT flight.{fk} FROM flight
             JOIN {view} ON {view}.id = flight.{fk}
             WHERE {view}.flights < :flights AND {predicate}
             ORDER BY flight.id",
            fk = def.foreign_key,
            view = def.view,
            predicate = predicate,
        ))?;
        let rows = stmt
            .query_map(named.as_refs().as_slice(), |row| row.get::<_, ClusterId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        Ok(rows.into_iter().filter(|id| seen.insert(*id)).collect())
    }

    /// Seed a new cluster with one unclustered flight. None once every
    /// flight is clustered on this axis.
    pub fn create(&mut self) -> Result<Option<ClusterId>> {
        let kind = self.kind;
        let def = kind.definition();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let flight_id: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM flight WHERE {} IS NULL ORDER BY id LIMIT 1", def.foreign_key),
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(flight_id) = flight_id else {
            log!("[Classify] No more unclassified flights");
            return Ok(None);
        };

        tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", def.table), [])?;
        let id = ClusterId(tx.last_insert_rowid());
        tx.execute(
            &format!("UPDATE flight SET {} = ?1 WHERE id = ?2", def.foreign_key),
            params![id, flight_id],
        )?;
        tx.commit()?;

        self.stats.created += 1;
        log!("[Classify] created {} {} for flight {}", kind, id, flight_id);
        Ok(Some(id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{FlightGeometry, NewFlight};
    use crate::error::Error;
    use crate::geo::{self, LatLng};

    /// A 40 km triangle launched from `origin`
    pub(crate) fn triangle_at(hash: &str, origin: LatLng) -> NewFlight {
        NewFlight {
            hash: hash.to_string(),
            geometry: FlightGeometry {
                launch: origin,
                turnpoints: [
                    geo::offset_km(&origin, 5.0, 8.0),
                    geo::offset_km(&origin, 16.0, 0.0),
                    geo::offset_km(&origin, 5.0, -8.0),
                ],
            },
            score: 40.0,
            distance: 40.0,
            category: "B".to_string(),
            wing: "Glider".to_string(),
        }
    }

    pub(crate) fn insert(db: &Database, hash: &str, origin: LatLng) -> i64 {
        db.insert_flight(&triangle_at(hash, origin)).unwrap().unwrap()
    }

    /// Point `km` east of the equator origin
    fn east(km: f64) -> LatLng {
        geo::offset_km(&LatLng::new(0.0, 0.0), km, 0.0)
    }

    fn cluster_of(db: &Database, kind: ClusterKind, flight: i64) -> Option<ClusterId> {
        db.get_flight(flight).unwrap().unwrap().cluster_id(kind)
    }

    #[test]
    fn test_missing_cluster_is_noop() {
        let db = Database::in_memory().unwrap();
        let mut c = Classifier::new(&db, ClusterKind::Route, ClusterParams::default());
        assert_eq!(c.reclassify(ClusterId(99)).unwrap(), Reclassification::Missing);
        assert!(c.reclassify(ClusterId(99)).unwrap().affected_ids().is_empty());
        assert_eq!(c.stats().committed, 0);
    }

    #[test]
    fn test_create_seeds_lowest_unassigned_flight() {
        let db = Database::in_memory().unwrap();
        let origin = LatLng::new(45.0, 6.0);
        let a = insert(&db, "a", origin);
        let b = insert(&db, "b", geo::offset_km(&origin, 50.0, 0.0));
        let mut c = Classifier::new(&db, ClusterKind::Route, ClusterParams::default());

        let first = c.create().unwrap().unwrap();
        assert_eq!(cluster_of(&db, ClusterKind::Route, a), Some(first));
        assert_eq!(cluster_of(&db, ClusterKind::Route, b), None);

        let second = c.create().unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(cluster_of(&db, ClusterKind::Route, b), Some(second));

        assert_eq!(c.create().unwrap(), None);
        assert_eq!(c.stats().created, 2);
        // Launch axis untouched
        assert_eq!(db.count_unassigned(ClusterKind::Launch).unwrap(), 2);
    }

    #[test]
    fn test_create_on_empty_store() {
        let db = Database::in_memory().unwrap();
        let mut c = Classifier::new(&db, ClusterKind::Launch, ClusterParams::default());
        assert_eq!(c.create().unwrap(), None);
        assert_eq!(db.count_clusters(ClusterKind::Launch).unwrap(), 0);
    }

    #[test]
    fn test_grow_commits_and_requeues_self() {
        let db = Database::in_memory().unwrap();
        let origin = LatLng::new(45.0, 6.0);
        let a = insert(&db, "a", origin);
        let b = insert(&db, "b", geo::offset_km(&origin, 1.0, 0.5));
        let far = insert(&db, "far", geo::offset_km(&origin, 50.0, 0.0));
        let mut c = Classifier::new(&db, ClusterKind::Route, ClusterParams::default());

        let id = c.create().unwrap().unwrap();
        let outcome = c.reclassify(id).unwrap();
        assert_eq!(
            outcome,
            Reclassification::Committed { added: 1, removed: 0, pruned: 0, affected: vec![id] }
        );
        assert_eq!(cluster_of(&db, ClusterKind::Route, a), Some(id));
        assert_eq!(cluster_of(&db, ClusterKind::Route, b), Some(id));
        assert_eq!(cluster_of(&db, ClusterKind::Route, far), None);

        // Second pass finds nothing new
        assert_eq!(c.reclassify(id).unwrap(), Reclassification::Unchanged);
        assert_eq!(c.stats().committed, 1);
        assert_eq!(c.stats().reclassified, 1);
    }

    #[test]
    fn test_steals_from_smaller_cluster_and_prunes_it() {
        let db = Database::in_memory().unwrap();
        let kind = ClusterKind::Launch;
        let a = insert(&db, "a", east(0.0));
        let b = insert(&db, "b", east(0.5));
        let lone = insert(&db, "lone", east(1.0));

        let big = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, a, Some(big)).unwrap();
        db.assign_flight(kind, b, Some(big)).unwrap();
        let small = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, lone, Some(small)).unwrap();

        let mut c = Classifier::new(&db, kind, ClusterParams::default());
        let outcome = c.reclassify(big).unwrap();
        assert_eq!(
            outcome,
            Reclassification::Committed { added: 1, removed: 0, pruned: 1, affected: vec![small, big] }
        );
        assert_eq!(cluster_of(&db, kind, lone), Some(big));
        assert!(db.empty_cluster_ids(kind).unwrap().is_empty());
        assert_eq!(db.count_clusters(kind).unwrap(), 1);
    }

    #[test]
    fn test_smaller_cluster_cannot_steal_from_bigger() {
        let db = Database::in_memory().unwrap();
        let kind = ClusterKind::Launch;
        let a = insert(&db, "a", east(0.0));
        let b = insert(&db, "b", east(0.5));
        let lone = insert(&db, "lone", east(1.0));

        let big = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, a, Some(big)).unwrap();
        db.assign_flight(kind, b, Some(big)).unwrap();
        let small = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, lone, Some(small)).unwrap();

        let mut c = Classifier::new(&db, kind, ClusterParams::default());
        assert_eq!(c.reclassify(small).unwrap(), Reclassification::Unchanged);
        assert_eq!(cluster_of(&db, kind, lone), Some(small));
    }

    #[test]
    fn test_store_failure_aborts_and_leaves_store_unchanged() {
        let db = Database::in_memory().unwrap();
        let kind = ClusterKind::Launch;
        let a = insert(&db, "a", east(0.0));
        let b = insert(&db, "b", east(0.5));
        let lone = insert(&db, "lone", east(1.0));

        let big = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, a, Some(big)).unwrap();
        db.assign_flight(kind, b, Some(big)).unwrap();
        let small = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, lone, Some(small)).unwrap();

        // Pruning the emptied cluster fails after the grow already ran
        db.conn()
            .execute_batch(
                "CREATE TRIGGER no_prune BEFORE DELETE ON launch
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .unwrap();

        let mut c = Classifier::new(&db, kind, ClusterParams::default());
        let err = c.reclassify(big).unwrap_err();
        assert!(matches!(err, Error::Db(_)), "{}", err);
        assert_eq!(cluster_of(&db, kind, lone), Some(small));
        assert_eq!(cluster_of(&db, kind, a), Some(big));
        assert_eq!(c.stats().committed, 0);
        assert_eq!(c.stats().rolled_back, 0);

        let run = crate::classify::classify(&db, kind, None, ClusterParams::default());
        assert!(matches!(run, Err(Error::Db(_))));
        assert_eq!(cluster_of(&db, kind, lone), Some(small));
        assert_eq!(db.count_clusters(kind).unwrap(), 2);
    }

    #[test]
    fn test_non_convergent_change_rolls_back() {
        // Two members 2.9 km apart and three singleton clusters 2.95 km
        // past the centroid. Absorbing them drags the centroid so far east
        // that the westmost member drops out: added 3 < removed 1 + pruned 3.
        let db = Database::in_memory().unwrap();
        let kind = ClusterKind::Launch;
        let west = insert(&db, "west", east(0.0));
        let mid = insert(&db, "mid", east(2.9));
        let cluster = db.create_cluster(kind).unwrap();
        db.assign_flight(kind, west, Some(cluster)).unwrap();
        db.assign_flight(kind, mid, Some(cluster)).unwrap();

        let mut singles = Vec::new();
        for i in 0..3 {
            let f = insert(&db, &format!("s{}", i), east(4.4));
            let s = db.create_cluster(kind).unwrap();
            db.assign_flight(kind, f, Some(s)).unwrap();
            singles.push((f, s));
        }

        let mut c = Classifier::new(&db, kind, ClusterParams::default());
        let outcome = c.reclassify(cluster).unwrap();
        match outcome {
            Reclassification::RolledBack { added, removed, pruned } => {
                assert_eq!((added, removed, pruned), (3, 1, 3));
                assert!(added < removed + pruned);
            }
            other => panic!("expected rollback, got {:?}", other),
        }
        assert!(outcome.affected_ids().is_empty());

        // Store is exactly as before
        assert_eq!(cluster_of(&db, kind, west), Some(cluster));
        assert_eq!(cluster_of(&db, kind, mid), Some(cluster));
        for (f, s) in singles {
            assert_eq!(cluster_of(&db, kind, f), Some(s));
        }
        assert_eq!(db.count_clusters(kind).unwrap(), 4);
        assert_eq!(c.stats().rolled_back, 1);
        assert_eq!(c.stats().reclassified, 0);
    }

    #[test]
    fn test_commits_satisfy_guard() {
        let db = Database::in_memory().unwrap();
        let origin = LatLng::new(45.0, 6.0);
        for i in 0..6 {
            insert(&db, &format!("f{}", i), geo::offset_km(&origin, 0.3 * i as f64, 0.0));
        }
        let mut c = Classifier::new(&db, ClusterKind::Route, ClusterParams::default());
        while let Some(id) = c.create().unwrap() {
            let mut queue = vec![id];
            while let Some(next) = queue.pop() {
                match c.reclassify(next).unwrap() {
                    Reclassification::Committed { added, removed, pruned, affected } => {
                        assert!(added >= removed + pruned);
                        queue.extend(affected);
                    }
                    Reclassification::RolledBack { added, removed, pruned } => {
                        assert!(added < removed + pruned);
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(db.count_unassigned(ClusterKind::Route).unwrap(), 0);
        assert!(db.empty_cluster_ids(ClusterKind::Route).unwrap().is_empty());
    }
}
