use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::geo::LatLng;

/// Which axis flights are grouped on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Launch,
    Route,
}

impl ClusterKind {
    pub const ALL: [ClusterKind; 2] = [ClusterKind::Launch, ClusterKind::Route];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Launch => "launch",
            ClusterKind::Route => "route",
        }
    }
}

impl FromStr for ClusterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launch" => Ok(ClusterKind::Launch),
            "route" => Ok(ClusterKind::Route),
            other => Err(format!("unknown cluster kind '{}' (expected launch or route)", other)),
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row id of a launch or route cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClusterId(pub i64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClusterId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(ClusterId)
    }
}

impl ToSql for ClusterId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for ClusterId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(ClusterId)
    }
}

/// The points of a flight the clustering predicates look at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlightGeometry {
    pub launch: LatLng,
    /// Triangle turn points, in scoring order
    pub turnpoints: [LatLng; 3],
}

/// A flight as imported: geometry plus score, no cluster assignment yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlight {
    pub hash: String,
    pub geometry: FlightGeometry,
    pub score: f64,
    /// Triangle distance in km
    pub distance: f64,
    pub category: String,
    pub wing: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flight {
    pub id: i64,
    pub hash: String,
    pub geometry: FlightGeometry,
    pub score: f64,
    pub distance: f64,
    pub category: String,
    pub wing: String,
    pub launch_id: Option<ClusterId>,
    pub route_id: Option<ClusterId>,
}

impl Flight {
    pub fn cluster_id(&self, kind: ClusterKind) -> Option<ClusterId> {
        match kind {
            ClusterKind::Launch => self.launch_id,
            ClusterKind::Route => self.route_id,
        }
    }
}

/// One row of a `*_info` aggregate view, for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub kind: ClusterKind,
    pub flights: i64,
    /// Averaged defining points (one for launches, three for routes)
    pub centroid: Vec<LatLng>,
    pub avg_distance: f64,
    pub avg_score: f64,
    pub max_score: f64,
}
