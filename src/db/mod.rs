mod schema;
mod models;

pub use schema::Database;
pub use models::{ClusterId, ClusterKind, ClusterSummary, Flight, FlightGeometry, NewFlight};
