//! Data models for users, routes and traffic samples.
//!
//! These are the storage-agnostic records handed across the [`Storage`](super::Storage)
//! boundary. Backends map their own row layouts onto them.

use chrono::{DateTime, Datelike, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::errors::{DbError, Result};
use crate::types::{Coords, RouteId, UserId};

/// Longest title a route may carry, in characters.
pub const MAX_TITLE_LEN: usize = 50;

const SECONDS_PER_HOUR: i64 = 3600;

/// A route owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    /// External chat-platform identity
    pub user_id: UserId,
    /// UTC offset in whole hours; `None` falls back to the configured default
    pub timezone: Option<i32>,
}

impl User {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id, timezone: None }
    }
}

/// A tracked pair of endpoints owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Generated identifier, stable for the lifetime of the route
    pub route_id: RouteId,
    /// Owner of the route
    pub user_id: UserId,
    /// Display title, at most [`MAX_TITLE_LEN`] characters
    pub title: String,
    pub start: Coords,
    pub end: Coords,
}

/// Request payload for creating a route.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoute {
    pub user_id: UserId,
    pub title: String,
    pub start: Coords,
    pub end: Coords,
}

impl NewRoute {
    pub fn new(start: Coords, end: Coords, title: impl Into<String>, user_id: UserId) -> Self {
        Self {
            user_id,
            title: title.into(),
            start,
            end,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_title(&self.title)
    }
}

/// Reject titles longer than [`MAX_TITLE_LEN`] characters.
pub fn validate_title(title: &str) -> Result<()> {
    let len = title.chars().count();
    if len > MAX_TITLE_LEN {
        return Err(DbError::CheckViolation {
            table: Some("routes".to_string()),
            message: format!("route title is {len} characters long, the limit is {MAX_TITLE_LEN}"),
        });
    }
    Ok(())
}

/// One timestamped duration measurement for a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Traffic {
    pub route_id: RouteId,
    /// Capture time, unix seconds
    pub timestamp: i64,
    /// Traffic-aware travel time; `None` when the service found no viable path
    pub duration_sec: Option<i64>,
}

/// All samples of one route, ordered by capture time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficReport {
    pub route: Route,
    /// Owner's UTC offset in hours, already resolved against the default
    pub timezone: i32,
    pub timestamps: Vec<i64>,
    pub durations: Vec<Option<i64>>,
}

impl TrafficReport {
    pub fn new(route: Route, timezone: i32, mut samples: Vec<Traffic>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        let (timestamps, durations) = samples.into_iter().map(|s| (s.timestamp, s.duration_sec)).unzip();
        Self {
            route,
            timezone,
            timestamps,
            durations,
        }
    }

    /// Keep only samples captured on `day` in the owner's local time.
    pub fn for_weekday(self, day: Weekday) -> Self {
        let timezone = self.timezone;
        let (timestamps, durations) = self
            .timestamps
            .into_iter()
            .zip(self.durations)
            .filter(|(ts, _)| local_weekday(*ts, timezone) == Some(day))
            .unzip();
        Self {
            route: self.route,
            timezone,
            timestamps,
            durations,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Iterate `(timestamp, duration)` pairs.
    pub fn samples(&self) -> impl Iterator<Item = (i64, Option<i64>)> + '_ {
        self.timestamps.iter().copied().zip(self.durations.iter().copied())
    }
}

/// Calendar weekday of a unix timestamp shifted by `timezone` hours.
///
/// Weekdays count from Monday, matching [`Weekday::num_days_from_monday`].
pub fn local_weekday(timestamp: i64, timezone: i32) -> Option<Weekday> {
    let shifted = timestamp.checked_add(i64::from(timezone) * SECONDS_PER_HOUR)?;
    DateTime::from_timestamp(shifted, 0).map(|dt| dt.weekday())
}
