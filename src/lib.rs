#[macro_use]
pub mod logging;

pub mod classify;
pub mod db;
pub mod error;
pub mod geo;
pub mod import;
pub mod settings;

pub use error::{Error, Result};
