//! Transactional relational storage backed by SQLite.
//!
//! Every [`StorageScope`] wraps one database transaction. The pool holds a single connection, so
//! scopes are handed out one at a time: a scope opened while another is in flight waits for the
//! connection instead of racing it for SQLite's write lock.
//!
//! Other processes (the CLI next to a running `serve`) share the database file. Transactions start
//! with `BEGIN IMMEDIATE`, so the write lock is taken up front and waits on another process go
//! through the busy timeout. A deferred transaction that read first would instead fail outright
//! with `SQLITE_BUSY_SNAPSHOT` once another process committed in between.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::SqlitePoolSettings;
use crate::db::errors::Result;
use crate::db::models::{NewRoute, Route, Traffic, TrafficReport, User, validate_title};
use crate::db::{Storage, StorageScope, retention_cutoff};
use crate::types::{Coords, RouteId, UserId};

/// SQLite-backed [`Storage`].
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    default_timezone: i32,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url` and run pending migrations.
    pub async fn connect(url: &str, settings: &SqlitePoolSettings, default_timezone: i32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(settings.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        info!("Connected to SQLite database at {}", url);
        Self::new(pool, default_timezone).await
    }

    /// Wrap an existing pool, running pending migrations on it.
    pub async fn new(pool: SqlitePool, default_timezone: i32) -> Result<Self> {
        crate::migrator().run(&pool).await?;
        Ok(Self { pool, default_timezone })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn session_scope(&self) -> Result<Box<dyn StorageScope>> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteScope {
            tx,
            default_timezone: self.default_timezone,
        }))
    }

    async fn close(&self) {
        info!("Closing database connections...");
        self.pool.close().await;
    }
}

#[derive(FromRow)]
struct RouteRow {
    route_id: i64,
    user_id: i64,
    title: String,
    start_lat: f64,
    start_lon: f64,
    end_lat: f64,
    end_lon: f64,
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        Self {
            route_id: row.route_id,
            user_id: row.user_id,
            title: row.title,
            start: Coords::new(row.start_lat, row.start_lon),
            end: Coords::new(row.end_lat, row.end_lon),
        }
    }
}

/// One open transaction. Dropping it without [`StorageScope::commit`] rolls back.
pub struct SqliteScope {
    tx: Transaction<'static, Sqlite>,
    default_timezone: i32,
}

#[async_trait]
impl StorageScope for SqliteScope {
    async fn get_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<Option<Route>> {
        let row = sqlx::query_as::<_, RouteRow>(
            r#"
            SELECT route_id, user_id, title, start_lat, start_lon, end_lat, end_lon
            FROM routes
            WHERE route_id = ? AND user_id = ?
            "#,
        )
        .bind(route_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Route::from))
    }

    async fn get_routes(&mut self, user_id: Option<UserId>) -> Result<Vec<Route>> {
        let rows = sqlx::query_as::<_, RouteRow>(
            r#"
            SELECT route_id, user_id, title, start_lat, start_lon, end_lat, end_lon
            FROM routes
            WHERE ? IS NULL OR user_id = ?
            ORDER BY route_id
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Route::from).collect())
    }

    async fn add_route(&mut self, route: NewRoute) -> Result<Route> {
        route.validate()?;

        sqlx::query("INSERT INTO users (user_id) VALUES (?) ON CONFLICT (user_id) DO NOTHING")
            .bind(route.user_id)
            .execute(&mut *self.tx)
            .await?;

        let route_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO routes (user_id, title, start_lat, start_lon, end_lat, end_lon)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING route_id
            "#,
        )
        .bind(route.user_id)
        .bind(&route.title)
        .bind(route.start.lat)
        .bind(route.start.lon)
        .bind(route.end.lat)
        .bind(route.end.lon)
        .fetch_one(&mut *self.tx)
        .await?;

        debug!(route_id, user_id = route.user_id, "Inserted route");

        Ok(Route {
            route_id,
            user_id: route.user_id,
            title: route.title,
            start: route.start,
            end: route.end,
        })
    }

    async fn remove_route(&mut self, user_id: UserId, route_id: RouteId) -> Result<bool> {
        // Samples go first so the route is never left with dangling rows, whatever the
        // connection's foreign key setting.
        let samples = sqlx::query(
            r#"
            DELETE FROM traffic
            WHERE route_id IN (SELECT route_id FROM routes WHERE route_id = ? AND user_id = ?)
            "#,
        )
        .bind(route_id)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        let removed = sqlx::query("DELETE FROM routes WHERE route_id = ? AND user_id = ?")
            .bind(route_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        if removed > 0 {
            debug!(route_id, user_id, samples, "Removed route");
        }

        Ok(removed > 0)
    }

    async fn rename_route(&mut self, user_id: UserId, route_id: RouteId, title: &str) -> Result<()> {
        validate_title(title)?;

        sqlx::query("UPDATE routes SET title = ? WHERE route_id = ? AND user_id = ?")
            .bind(title)
            .bind(route_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn append_traffic_at(&mut self, route: &Route, timestamp: i64, duration_sec: Option<i64>) -> Result<Traffic> {
        sqlx::query("INSERT INTO traffic (route_id, timestamp, duration_sec) VALUES (?, ?, ?)")
            .bind(route.route_id)
            .bind(timestamp)
            .bind(duration_sec)
            .execute(&mut *self.tx)
            .await?;

        Ok(Traffic {
            route_id: route.route_id,
            timestamp,
            duration_sec,
        })
    }

    async fn delete_old_traffic(&mut self, route: &Route, keep_days: u32) -> Result<u64> {
        let cutoff = retention_cutoff(chrono::Utc::now().timestamp(), keep_days);

        let deleted = sqlx::query("DELETE FROM traffic WHERE route_id = ? AND timestamp < ?")
            .bind(route.route_id)
            .bind(cutoff)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn make_report(&mut self, route: &Route) -> Result<TrafficReport> {
        let timezone: Option<Option<i32>> = sqlx::query_scalar("SELECT timezone FROM users WHERE user_id = ?")
            .bind(route.user_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        let samples = sqlx::query_as::<_, Traffic>(
            r#"
            SELECT route_id, timestamp, duration_sec
            FROM traffic
            WHERE route_id = ?
            ORDER BY timestamp, traffic_id
            "#,
        )
        .bind(route.route_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let timezone = timezone.flatten().unwrap_or(self.default_timezone);
        Ok(TrafficReport::new(route.clone(), timezone, samples))
    }

    async fn update_user(&mut self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, timezone) VALUES (?, ?)
            ON CONFLICT (user_id) DO UPDATE SET timezone = excluded.timezone
            "#,
        )
        .bind(user.user_id)
        .bind(user.timezone)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_user(&mut self, user_id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT user_id, timezone FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(user)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
