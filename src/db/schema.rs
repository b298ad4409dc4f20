use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::models::{ClusterId, ClusterKind, ClusterSummary, Flight, FlightGeometry, NewFlight};
use crate::classify::definition::ClusterDefinition;
use crate::geo::{self, LatLng};

/// Handle on the flight store. Owns the only connection; dropping the
/// handle closes it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Exclusive access to the connection, e.g. to open a transaction.
    /// A poisoned lock is recovered: every mutation runs inside a
    /// transaction, so a panic mid-step cannot leave partial writes behind.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn();

        register_functions(&conn)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS launch (
                id INTEGER PRIMARY KEY AUTOINCREMENT
            );

            CREATE TABLE IF NOT EXISTS route (
                id INTEGER PRIMARY KEY AUTOINCREMENT
            );

            CREATE TABLE IF NOT EXISTS flight (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                launch_lat REAL NOT NULL,
                launch_lng REAL NOT NULL,
                -- Triangle turn points
                p1_lat REAL NOT NULL,
                p1_lng REAL NOT NULL,
                p2_lat REAL NOT NULL,
                p2_lng REAL NOT NULL,
                p3_lat REAL NOT NULL,
                p3_lng REAL NOT NULL,
                score REAL NOT NULL DEFAULT 0,
                distance REAL NOT NULL DEFAULT 0,  -- km
                category TEXT NOT NULL DEFAULT 'X',
                wing TEXT NOT NULL DEFAULT 'Glider',
                -- Cluster assignments, NULL = not clustered on that axis yet
                launch_id INTEGER REFERENCES launch(id),
                route_id INTEGER REFERENCES route(id)
            );

            CREATE INDEX IF NOT EXISTS idx_flight_launch_id ON flight(launch_id);
            CREATE INDEX IF NOT EXISTS idx_flight_route_id ON flight(route_id);
            CREATE INDEX IF NOT EXISTS idx_flight_launch_lat ON flight(launch_lat);
            CREATE INDEX IF NOT EXISTS idx_flight_p1_lat ON flight(p1_lat);

            -- Clusters have no geography of their own: centroid and size are
            -- derived from member flights. Empty clusters have no row here.
            CREATE VIEW IF NOT EXISTS launch_info AS
                SELECT launch.id AS id,
                       COUNT(flight.id) AS flights,
                       AVG(flight.launch_lat) AS lat,
                       AVG(flight.launch_lng) AS lng,
                       AVG(flight.distance) AS avg_distance,
                       AVG(flight.score) AS avg_score,
                       MAX(flight.score) AS max_score
                FROM launch JOIN flight ON flight.launch_id = launch.id
                GROUP BY launch.id;

            CREATE VIEW IF NOT EXISTS route_info AS
                SELECT route.id AS id,
                       COUNT(flight.id) AS flights,
                       AVG(flight.p1_lat) AS c1_lat,
                       AVG(flight.p1_lng) AS c1_lng,
                       AVG(flight.p2_lat) AS c2_lat,
                       AVG(flight.p2_lng) AS c2_lng,
                       AVG(flight.p3_lat) AS c3_lat,
                       AVG(flight.p3_lng) AS c3_lng,
                       AVG(flight.distance) AS avg_distance,
                       AVG(flight.score) AS avg_score,
                       MAX(flight.score) AS max_score
                FROM route JOIN flight ON flight.route_id = route.id
                GROUP BY route.id;

            PRAGMA foreign_keys = ON;
            "
        )?;

        Ok(())
    }

    // ==================== Flight Operations ====================

    const FLIGHT_COLUMNS: &'static str =
        "id, hash, launch_lat, launch_lng, p1_lat, p1_lng, p2_lat, p2_lng, p3_lat, p3_lng, \
         score, distance, category, wing, launch_id, route_id";

    fn row_to_flight(row: &rusqlite::Row) -> Result<Flight> {
        Ok(Flight {
            id: row.get(0)?,
            hash: row.get(1)?,
            geometry: FlightGeometry {
                launch: LatLng::new(row.get(2)?, row.get(3)?),
                turnpoints: [
                    LatLng::new(row.get(4)?, row.get(5)?),
                    LatLng::new(row.get(6)?, row.get(7)?),
                    LatLng::new(row.get(8)?, row.get(9)?),
                ],
            },
            score: row.get(10)?,
            distance: row.get(11)?,
            category: row.get(12)?,
            wing: row.get(13)?,
            launch_id: row.get(14)?,
            route_id: row.get(15)?,
        })
    }

    /// Insert a flight. Returns None when a flight with the same hash is
    /// already stored.
    pub fn insert_flight(&self, flight: &NewFlight) -> Result<Option<i64>> {
        let conn = self.conn();
        let g = &flight.geometry;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO flight
                (hash, launch_lat, launch_lng, p1_lat, p1_lng, p2_lat, p2_lng, p3_lat, p3_lng,
                 score, distance, category, wing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                flight.hash,
                g.launch.lat, g.launch.lng,
                g.turnpoints[0].lat, g.turnpoints[0].lng,
                g.turnpoints[1].lat, g.turnpoints[1].lng,
                g.turnpoints[2].lat, g.turnpoints[2].lng,
                flight.score, flight.distance, flight.category, flight.wing,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_flight(&self, id: i64) -> Result<Option<Flight>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM flight WHERE id = ?1", Self::FLIGHT_COLUMNS),
            [id],
            Self::row_to_flight,
        )
        .optional()
    }

    pub fn get_all_flights(&self) -> Result<Vec<Flight>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM flight ORDER BY id", Self::FLIGHT_COLUMNS))?;
        let flights = stmt.query_map([], Self::row_to_flight)?.collect::<Result<Vec<_>>>()?;
        Ok(flights)
    }

    pub fn count_flights(&self) -> Result<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM flight", [], |row| row.get(0))
    }

    /// Flights with no cluster on this axis
    pub fn count_unassigned(&self, kind: ClusterKind) -> Result<i64> {
        let def = kind.definition();
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM flight WHERE {} IS NULL", def.foreign_key),
            [],
            |row| row.get(0),
        )
    }

    pub fn flights_in_cluster(&self, kind: ClusterKind, id: ClusterId) -> Result<Vec<Flight>> {
        let def = kind.definition();
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flight WHERE {} = ?1 ORDER BY id",
            Self::FLIGHT_COLUMNS, def.foreign_key
        ))?;
        let flights = stmt.query_map([id], Self::row_to_flight)?.collect::<Result<Vec<_>>>()?;
        Ok(flights)
    }

    // ==================== Cluster Operations ====================

    /// Rows in the backing table, including empty ones
    pub fn count_clusters(&self, kind: ClusterKind) -> Result<i64> {
        let def = kind.definition();
        let conn = self.conn();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", def.table), [], |row| row.get(0))
    }

    /// Ids of all clusters that currently have members
    pub fn list_cluster_ids(&self, kind: ClusterKind) -> Result<Vec<ClusterId>> {
        let def = kind.definition();
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY id", def.view))?;
        let ids = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Backing-table rows with no member flight
    pub fn empty_cluster_ids(&self, kind: ClusterKind) -> Result<Vec<ClusterId>> {
        let def = kind.definition();
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {table} WHERE id NOT IN
                (SELECT DISTINCT {fk} FROM flight WHERE {fk} IS NOT NULL)
             ORDER BY id",
            table = def.table,
            fk = def.foreign_key
        ))?;
        let ids = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Aggregate rows, biggest clusters first
    pub fn list_clusters(&self, kind: ClusterKind, limit: usize) -> Result<Vec<ClusterSummary>> {
        let def = kind.definition();
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, flights, avg_distance, avg_score, max_score, {} FROM {}
             ORDER BY flights DESC, id LIMIT ?1",
            def.centroid_columns(),
            def.view
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let clusters = stmt
            .query_map([limit], |row| Self::row_to_summary(def, row))?
            .collect::<Result<Vec<_>>>()?;
        Ok(clusters)
    }

    fn row_to_summary(def: &ClusterDefinition, row: &rusqlite::Row) -> Result<ClusterSummary> {
        let mut centroid = Vec::with_capacity(def.anchors.len());
        for i in 0..def.anchors.len() {
            centroid.push(LatLng::new(row.get(5 + 2 * i)?, row.get(6 + 2 * i)?));
        }
        Ok(ClusterSummary {
            id: row.get(0)?,
            kind: def.kind,
            flights: row.get(1)?,
            centroid,
            avg_distance: row.get(2)?,
            avg_score: row.get(3)?,
            max_score: row.get(4)?,
        })
    }

    /// Allocate an empty cluster row
    pub fn create_cluster(&self, kind: ClusterKind) -> Result<ClusterId> {
        let def = kind.definition();
        let conn = self.conn();
        conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", def.table), [])?;
        Ok(ClusterId(conn.last_insert_rowid()))
    }

    /// Set (or clear) one flight's assignment on the given axis
    pub fn assign_flight(&self, kind: ClusterKind, flight_id: i64, cluster: Option<ClusterId>) -> Result<()> {
        let def = kind.definition();
        let conn = self.conn();
        conn.execute(
            &format!("UPDATE flight SET {} = ?1 WHERE id = ?2", def.foreign_key),
            params![cluster, flight_id],
        )?;
        Ok(())
    }
}

/// Scalar functions the match predicates call
fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "great_circle",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let lat1: f64 = ctx.get(0)?;
            let lng1: f64 = ctx.get(1)?;
            let lat2: f64 = ctx.get(2)?;
            let lng2: f64 = ctx.get(3)?;
            Ok(geo::great_circle_km(lat1, lng1, lat2, lng2))
        },
    )
}
