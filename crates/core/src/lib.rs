//! Core functionality for the Beacon dispatch system.
//!
//! This crate provides the configuration, error type, logging setup and
//! geographic primitives shared across the Beacon workspace.

pub mod config;
pub mod error;
pub mod geo;
pub mod logging;
pub mod types;

pub use config::{Config, DispatchConfig, NotificationConfig, StoreConfig};
pub use error::{CoreError, Result};
pub use geo::{GeoPosition, EARTH_RADIUS_M};
pub use types::{now_millis, Timestamp};
