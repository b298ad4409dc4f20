//! Per-kind parameterization that keeps the reclassifier generic over
//! launches and routes.

use rusqlite::types::{ToSql, Value};
use rusqlite::{Connection, OptionalExtension};

use super::ClusterParams;
use crate::db::{ClusterId, ClusterKind, FlightGeometry};
use crate::geo::{self, LatLng};

/// Which point of a flight an anchor reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightPoint {
    Launch,
    Turnpoint(usize),
}

impl FlightGeometry {
    pub fn point(&self, point: FlightPoint) -> LatLng {
        match point {
            FlightPoint::Launch => self.launch,
            FlightPoint::Turnpoint(i) => self.turnpoints[i],
        }
    }
}

/// A flight point paired with the aggregate field averaging it
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub point: FlightPoint,
    pub lat_column: &'static str,
    pub lng_column: &'static str,
    pub center_lat: &'static str,
    pub center_lng: &'static str,
}

/// How a cluster's match radius is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusRule {
    /// `launch_radius_km` regardless of the cluster
    Fixed,
    /// `max(route_min_radius_km, avg_distance * route_radius_scale)`
    Scaled,
}

#[derive(Debug)]
pub struct ClusterDefinition {
    pub kind: ClusterKind,
    pub table: &'static str,
    pub view: &'static str,
    /// Column on `flight` holding the assignment
    pub foreign_key: &'static str,
    /// The bounding-box pre-filter uses the first anchor
    pub anchors: &'static [Anchor],
    pub radius: RadiusRule,
}

static LAUNCH: ClusterDefinition = ClusterDefinition {
    kind: ClusterKind::Launch,
    table: "launch",
    view: "launch_info",
    foreign_key: "launch_id",
    anchors: &[Anchor {
        point: FlightPoint::Launch,
        lat_column: "launch_lat",
        lng_column: "launch_lng",
        center_lat: "lat",
        center_lng: "lng",
    }],
    radius: RadiusRule::Fixed,
};

static ROUTE: ClusterDefinition = ClusterDefinition {
    kind: ClusterKind::Route,
    table: "route",
    view: "route_info",
    foreign_key: "route_id",
    anchors: &[
        Anchor {
            point: FlightPoint::Turnpoint(0),
            lat_column: "p1_lat",
            lng_column: "p1_lng",
            center_lat: "c1_lat",
            center_lng: "c1_lng",
        },
        Anchor {
            point: FlightPoint::Turnpoint(1),
            lat_column: "p2_lat",
            lng_column: "p2_lng",
            center_lat: "c2_lat",
            center_lng: "c2_lng",
        },
        Anchor {
            point: FlightPoint::Turnpoint(2),
            lat_column: "p3_lat",
            lng_column: "p3_lng",
            center_lat: "c3_lat",
            center_lng: "c3_lng",
        },
    ],
    radius: RadiusRule::Scaled,
};

impl ClusterKind {
    pub fn definition(&self) -> &'static ClusterDefinition {
        match self {
            ClusterKind::Launch => &LAUNCH,
            ClusterKind::Route => &ROUTE,
        }
    }
}

impl ClusterDefinition {
    /// Aggregate fields the predicate binds, in anchor order
    pub fn bound_fields(&self) -> Vec<&'static str> {
        self.anchors
            .iter()
            .flat_map(|a| [a.center_lat, a.center_lng])
            .collect()
    }

    /// Comma-separated centroid columns of the aggregate view
    pub fn centroid_columns(&self) -> String {
        self.bound_fields().join(", ")
    }

    pub fn radius_km(&self, avg_distance: f64, params: &ClusterParams) -> f64 {
        match self.radius {
            RadiusRule::Fixed => params.launch_radius_km,
            RadiusRule::Scaled => {
                (avg_distance * params.route_radius_scale).max(params.route_min_radius_km)
            }
        }
    }

    /// Boolean SQL over `flight` columns: does the flight fall within
    /// `:radius` of every centroid point. Binds `:<field>` for each bound
    /// field plus `:radius`, `:lat_margin` and `:lng_margin`.
    pub fn match_predicate(&self) -> String {
        let mut clauses = Vec::with_capacity(self.anchors.len() + 1);
        if let Some(first) = self.anchors.first() {
            // No index on great_circle, but the box discards most rows early
            clauses.push(format!(
                "flight.{lat} BETWEEN :{clat} - :lat_margin AND :{clat} + :lat_margin \
                 AND flight.{lng} BETWEEN :{clng} - :lng_margin AND :{clng} + :lng_margin",
                lat = first.lat_column,
                lng = first.lng_column,
                clat = first.center_lat,
                clng = first.center_lng,
            ));
        }
        for a in self.anchors {
            clauses.push(format!(
                "great_circle(flight.{}, flight.{}, :{}, :{}) < :radius",
                a.lat_column, a.lng_column, a.center_lat, a.center_lng
            ));
        }
        clauses.join(" AND ")
    }
}

/// Named SQL parameters, owned so they can be extended per statement
#[derive(Debug, Clone, Default)]
pub(crate) struct NamedParams(Vec<(String, Value)>);

impl NamedParams {
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.0.push((format!(":{}", name), value.into()));
        self
    }

    pub fn as_refs(&self) -> Vec<(&str, &dyn ToSql)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v as &dyn ToSql)).collect()
    }
}

/// A cluster's aggregate state as read from its view, never cached
/// across steps
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub id: ClusterId,
    pub kind: ClusterKind,
    pub flights: i64,
    pub avg_distance: f64,
    /// One point per anchor
    pub centroid: Vec<LatLng>,
    pub radius_km: f64,
}

impl ClusterSnapshot {
    /// Read the aggregate row. None when the cluster has no members.
    pub fn load(
        conn: &Connection,
        kind: ClusterKind,
        id: ClusterId,
        params: &ClusterParams,
    ) -> rusqlite::Result<Option<Self>> {
        let def = kind.definition();
        let sql = format!(
            "SELECT flights, avg_distance, {} FROM {} WHERE id = ?1",
            def.centroid_columns(),
            def.view
        );
        conn.query_row(&sql, [id], |row| {
            let flights: i64 = row.get(0)?;
            let avg_distance: f64 = row.get(1)?;
            let mut centroid = Vec::with_capacity(def.anchors.len());
            for i in 0..def.anchors.len() {
                centroid.push(LatLng::new(row.get(2 + 2 * i)?, row.get(3 + 2 * i)?));
            }
            Ok(ClusterSnapshot {
                id,
                kind,
                flights,
                avg_distance,
                centroid,
                radius_km: def.radius_km(avg_distance, params),
            })
        })
        .optional()
    }

    /// Bindings for `ClusterDefinition::match_predicate`
    pub(crate) fn predicate_params(&self, params: &ClusterParams) -> NamedParams {
        let def = self.kind.definition();
        let mut named = NamedParams::default()
            .with("radius", self.radius_km)
            .with("lat_margin", params.lat_margin_deg)
            .with("lng_margin", params.lng_margin_deg);
        for (anchor, center) in def.anchors.iter().zip(&self.centroid) {
            named = named.with(anchor.center_lat, center.lat).with(anchor.center_lng, center.lng);
        }
        named
    }

    /// In-process evaluation of the same predicate the SQL applies
    pub fn matches(&self, geometry: &FlightGeometry, params: &ClusterParams) -> bool {
        let def = self.kind.definition();
        if let (Some(first), Some(center)) = (def.anchors.first(), self.centroid.first()) {
            let p = geometry.point(first.point);
            if !geo::within_box(&p, center, params.lat_margin_deg, params.lng_margin_deg) {
                return false;
            }
        }
        def.anchors
            .iter()
            .zip(&self.centroid)
            .all(|(anchor, center)| geometry.point(anchor.point).distance_km(center) < self.radius_km)
    }
}
