//! Common type definitions shared by the storage and scanner layers.
//!
//! # ID Types
//!
//! - [`UserId`]: external chat-platform identity of a route owner
//! - [`RouteId`]: storage-generated route identifier
//!
//! # Coordinates
//!
//! [`Coords`] is always held as `(lat, lon)`. The routing service expects the
//! opposite order, see [`Coords::to_rll`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Type aliases for IDs
pub type UserId = i64;
pub type RouteId = i64;

/// A geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

impl Coords {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Render a start/end pair as the `rll` query value: `lon1,lat1~lon2,lat2`.
    pub fn to_rll(start: Coords, end: Coords) -> String {
        format!("{},{}~{},{}", start.lon, start.lat, end.lon, end.lat)
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lon)
    }
}

/// Error returned when a `lat,lon` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("expected coordinates as `lat,lon`, got {input:?}")]
pub struct ParseCoordsError {
    input: String,
}

impl FromStr for Coords {
    type Err = ParseCoordsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCoordsError { input: s.to_string() };

        let (lat, lon) = s.split_once(',').ok_or_else(err)?;
        let lat: f64 = lat.trim().parse().map_err(|_| err())?;
        let lon: f64 = lon.trim().parse().map_err(|_| err())?;

        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(err());
        }

        Ok(Self { lat, lon })
    }
}
