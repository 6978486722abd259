//! Route and traffic storage.
//!
//! All access goes through a [`StorageScope`] obtained from [`Storage::session_scope`]. A scope
//! is a unit of work: nothing it writes is visible to other scopes until [`StorageScope::commit`]
//! succeeds, and dropping a scope without committing rolls everything back. Backends serialize
//! scopes, which is what lets the command layer and the scan scheduler run concurrently without
//! sharing any in-memory state.
//!
//! Two backends are provided:
//!
//! - [`sqlite::SqliteStorage`]: transactional relational store (sqlx + SQLite)
//! - [`file::FileStorage`]: file-backed append-only store (JSON lines in a directory)

pub mod errors;
pub mod file;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use chrono::Weekday;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::types::{RouteId, UserId};
use errors::Result;
use models::{NewRoute, Route, Traffic, TrafficReport, User};

/// Factory for transactional scopes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a new unit of work. Waits while another scope is open.
    async fn session_scope(&self) -> Result<Box<dyn StorageScope>>;

    /// Release backend resources before exit.
    async fn close(&self) {}
}

/// Operations available inside one unit of work.
#[async_trait]
pub trait StorageScope: Send {
    /// Fetch a route only if it belongs to `user_id`.
    async fn get_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<Option<Route>>;

    /// All routes of one user, or of every user when `user_id` is `None`. Ordered by id.
    async fn get_routes(&mut self, user_id: Option<UserId>) -> Result<Vec<Route>>;

    /// Insert a route, creating its owner if this is the owner's first interaction.
    async fn add_route(&mut self, route: NewRoute) -> Result<Route>;

    /// Delete a user's route together with all of its samples.
    ///
    /// Returns `false` when the user owns no route with that id.
    async fn remove_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<bool>;

    /// Change a route's title. Missing routes are ignored.
    async fn rename_route(&mut self, user_id: UserId, route_id: RouteId, title: &str) -> Result<()>;

    /// Append one sample stamped with an explicit capture time.
    async fn append_traffic_at(&mut self, route: &Route, timestamp: i64, duration_sec: Option<i64>) -> Result<Traffic>;

    /// Append one sample stamped with the current wall-clock time.
    ///
    /// A `None` duration records that the service found no viable path.
    async fn append_traffic(&mut self, route: &Route, duration_sec: Option<i64>) -> Result<Traffic> {
        let now = chrono::Utc::now().timestamp();
        self.append_traffic_at(route, now, duration_sec).await
    }

    /// Delete samples of `route` older than `keep_days`. Returns the number removed.
    async fn delete_old_traffic(&mut self, route: &Route, keep_days: u32) -> Result<u64>;

    /// Every sample of `route`, in capture order, with the owner's timezone resolved.
    async fn make_report(&mut self, route: &Route) -> Result<TrafficReport>;

    /// Samples of `route` captured on `day` in the owner's local time.
    async fn make_report_for_day(&mut self, route: &Route, day: Weekday) -> Result<TrafficReport> {
        Ok(self.make_report(route).await?.for_weekday(day))
    }

    /// Create the user if missing, otherwise overwrite its timezone.
    async fn update_user(&mut self, user: &User) -> Result<()>;

    async fn get_user(&mut self, user_id: UserId) -> Result<Option<User>>;

    /// Make every write of this scope durable and visible.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Cutoff timestamp for a retention window ending at `now`.
pub(crate) fn retention_cutoff(now: i64, keep_days: u32) -> i64 {
    now - i64::from(keep_days) * 24 * 3600
}

/// Open the backend selected by configuration.
pub async fn open_storage(config: &StorageConfig, default_timezone: i32) -> Result<Arc<dyn Storage>> {
    match config {
        StorageConfig::Sqlite { url, pool } => {
            let storage = sqlite::SqliteStorage::connect(url, pool, default_timezone).await?;
            Ok(Arc::new(storage))
        }
        StorageConfig::File { dir } => {
            let storage = file::FileStorage::open(dir, default_timezone).await?;
            Ok(Arc::new(storage))
        }
    }
}
