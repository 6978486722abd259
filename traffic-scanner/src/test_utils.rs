//! Test utilities shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::VecDeque;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SqlitePoolSettings;
use crate::db::sqlite::SqliteStorage;
use crate::scanner::{RouteQueryResult, RouteSession, ScanError};
use crate::types::Coords;

/// Timezone of users that never set one in tests.
pub const TEST_DEFAULT_TIMEZONE: i32 = 3;

/// Fresh in-memory database with migrations applied.
///
/// The pool holds exactly one connection that never expires; an in-memory database lives only as
/// long as its connection.
pub async fn sqlite_storage() -> SqliteStorage {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Failed to parse in-memory database url")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("Failed to open in-memory database");

    SqliteStorage::new(pool, TEST_DEFAULT_TIMEZONE)
        .await
        .expect("Failed to run migrations")
}

/// Database file at `path`, opened the way the binary opens it.
///
/// Opening the same path twice gives two independent pools, like two processes sharing the file.
pub async fn sqlite_file_storage(path: &Path) -> SqliteStorage {
    let url = format!("sqlite://{}", path.display());
    SqliteStorage::connect(&url, &SqlitePoolSettings::default(), TEST_DEFAULT_TIMEZONE)
        .await
        .expect("Failed to open database file")
}

/// One recorded route request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteCall {
    pub start: Coords,
    pub end: Coords,
    /// When the request started, on the tokio clock
    pub at: Instant,
}

/// Scripted [`RouteSession`].
///
/// Route requests pop queued responses in order. Once the queue is empty every request answers
/// with a single ten minute route.
#[derive(Clone, Default)]
pub struct MockRouteSession {
    responses: Arc<Mutex<VecDeque<Result<RouteQueryResult, ScanError>>>>,
    calls: Arc<Mutex<Vec<RouteCall>>>,
    ensure_calls: Arc<AtomicUsize>,
    latency: Duration,
}

impl MockRouteSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every route request take `latency` on the tokio clock.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a successful response carrying `data`.
    pub fn push_data(&self, data: Value) {
        self.responses.lock().push_back(Ok(RouteQueryResult::new(data)));
    }

    pub fn push_error(&self, error: ScanError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RouteCall> {
        self.calls.lock().clone()
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteSession for MockRouteSession {
    async fn ensure_session(&self, _force: bool) -> Result<(), ScanError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn build_route(&self, start: Coords, end: Coords) -> Result<RouteQueryResult, ScanError> {
        self.calls.lock().push(RouteCall {
            start,
            end,
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(RouteQueryResult::new(json!({"routes": [{"durationInTraffic": 600}]}))))
    }
}
