//! Loading of already-scored flights.
//!
//! IGC parsing and scoring happen upstream; this reads their output, a JSON
//! array of flight records, and stores each flight unclustered.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::db::{Database, FlightGeometry, NewFlight};
use crate::error::{Error, Result};
use crate::geo::LatLng;

/// One scored flight as produced by the scoring pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct FlightRecord {
    /// Identity of the track; derived from the geometry when absent
    #[serde(default)]
    pub hash: Option<String>,
    pub launch: LatLng,
    /// Triangle turn points
    #[serde(alias = "turnpoints")]
    pub tp: [LatLng; 3],
    pub score: f64,
    /// Triangle distance in km
    pub distance: f64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_wing")]
    pub wing: String,
}

fn default_category() -> String {
    "X".to_string()
}

fn default_wing() -> String {
    "Glider".to_string()
}

/// Import result summary
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub imported: usize,
    pub duplicates: usize,
}

/// Stable identity for a record without a hash: SHA-256 of its launch and
/// turn points, so re-importing the same file does not duplicate flights
fn geometry_hash(geometry: &FlightGeometry) -> String {
    let mut hasher = Sha256::new();
    for p in std::iter::once(&geometry.launch).chain(geometry.turnpoints.iter()) {
        hasher.update(p.lat.to_le_bytes());
        hasher.update(p.lng.to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

fn valid_point(p: &LatLng) -> bool {
    p.lat.is_finite() && p.lng.is_finite() && (-90.0..=90.0).contains(&p.lat) && (-180.0..=180.0).contains(&p.lng)
}

impl FlightRecord {
    pub fn into_new_flight(self) -> Result<NewFlight> {
        let geometry = FlightGeometry { launch: self.launch, turnpoints: self.tp };
        let hash = self.hash.unwrap_or_else(|| geometry_hash(&geometry));

        let points_ok = std::iter::once(&geometry.launch)
            .chain(geometry.turnpoints.iter())
            .all(valid_point);
        if !points_ok {
            return Err(Error::InvalidFlight { hash, reason: "coordinate out of range".to_string() });
        }
        if !(self.distance.is_finite() && self.distance >= 0.0) {
            return Err(Error::InvalidFlight { hash, reason: format!("bad distance {}", self.distance) });
        }

        Ok(NewFlight {
            hash,
            geometry,
            score: self.score,
            distance: self.distance,
            category: self.category,
            wing: self.wing,
        })
    }
}

/// Insert records, skipping flights already stored. A malformed record
/// aborts the import before anything is written.
pub fn import_flights(db: &Database, records: Vec<FlightRecord>) -> Result<ImportResult> {
    let flights = records
        .into_iter()
        .map(FlightRecord::into_new_flight)
        .collect::<Result<Vec<_>>>()?;

    let mut result = ImportResult::default();
    for flight in &flights {
        match db.insert_flight(flight)? {
            Some(_) => result.imported += 1,
            None => {
                log!("[Import] {} already present", flight.hash);
                result.duplicates += 1;
            }
        }
    }
    log!("[Import] {} flights imported, {} duplicates skipped", result.imported, result.duplicates);
    Ok(result)
}

pub fn import_flights_json(db: &Database, json_content: &str) -> Result<ImportResult> {
    let records: Vec<FlightRecord> = serde_json::from_str(json_content)?;
    import_flights(db, records)
}

pub fn import_flights_file<P: AsRef<Path>>(db: &Database, path: P) -> Result<ImportResult> {
    let content = fs::read_to_string(path.as_ref())?;
    log!("[Import] Reading {}", path.as_ref().display());
    import_flights_json(db, &content)
}
