//! The periodic scan loop.
//!
//! This module provides the [`ScanScheduler`], which runs as a single background task for the
//! lifetime of the process. Every cycle it lists all routes of all users, queries the routing
//! service for each one in turn, appends a sample per route, trims samples past the retention
//! window, and then sleeps for whatever is left of the period.
//!
//! Routes are scanned strictly one after another. The routing session is rate limited, and
//! concurrent requests from one session get it flagged.
//!
//! No storage scope is held while a request is in flight. A cycle lists the routes in a short
//! read scope, queries the service, and then writes every sample in one scope that commits once.
//! Commands running in another process only ever wait for those short scopes.
//!
//! [`ScanScheduler::serve_restart`] wraps the loop in a supervisor: when a cycle fails the whole
//! loop stops, the error is logged, and the loop starts over after a cooldown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ScannerConfig;
use crate::db::models::Route;
use crate::db::{Storage, StorageScope};
use crate::scanner::{RouteSession, ScanError};

/// How long to sleep after a cycle that took `elapsed`, so cycles start `period` apart.
///
/// Never negative: a cycle that overran its period is followed immediately by the next one.
pub fn sleep_time(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Background scan loop.
#[derive(Clone)]
pub struct ScanScheduler {
    session: Arc<dyn RouteSession>,
    storage: Arc<dyn Storage>,
    config: ScannerConfig,
}

impl ScanScheduler {
    pub fn new(session: Arc<dyn RouteSession>, storage: Arc<dyn Storage>, config: ScannerConfig) -> Self {
        Self {
            session,
            storage,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Query the routing service for the current travel time of one route.
    ///
    /// `None` means the service found no viable path, which is recorded as a null sample rather
    /// than treated as an error.
    pub async fn fetch_duration(&self, route: &Route) -> Result<Option<i64>, ScanError> {
        let result = self.session.build_route(route.start, route.end).await?;

        let duration = result.duration_in_traffic().inspect_err(|e| {
            error!(route_id = route.route_id, data = %result.data(), "Invalid route response: {}", e);
        })?;

        match duration {
            Some(duration_sec) => info!(route_id = route.route_id, duration_sec, "Scanned route {}", route.title),
            None => warn!(route_id = route.route_id, "No viable path found for route {}", route.title),
        }

        Ok(duration)
    }

    /// Append a sample for `route` inside `scope` and trim its samples past retention.
    pub async fn record_sample(
        &self,
        scope: &mut dyn StorageScope,
        route: &Route,
        duration: Option<i64>,
    ) -> Result<(), ScanError> {
        scope.append_traffic(route, duration).await?;

        let trimmed = scope.delete_old_traffic(route, self.config.retention_days).await?;
        if trimmed > 0 {
            debug!(route_id = route.route_id, trimmed, "Deleted samples past retention");
        }

        Ok(())
    }

    /// Scan one route right away, outside the cycle, and commit its sample.
    pub async fn scan_route(&self, route: &Route) -> Result<Option<i64>, ScanError> {
        let duration = self.fetch_duration(route).await?;

        let mut scope = self.storage.session_scope().await?;
        self.record_sample(scope.as_mut(), route, duration).await?;
        scope.commit().await?;
        Ok(duration)
    }

    /// Run one full pass over every route. Returns the number of routes scanned.
    ///
    /// A failed scan stops the cycle: the samples of routes scanned before it are committed and
    /// the remaining routes wait for the next cycle. A storage failure rolls every sample of the
    /// cycle back. Routes removed while the cycle was querying the service are skipped.
    pub async fn run_cycle(&self) -> Result<usize, ScanError> {
        self.session.ensure_session(false).await?;

        let routes = {
            let mut scope = self.storage.session_scope().await?;
            let routes = scope.get_routes(None).await?;
            scope.commit().await?;
            routes
        };
        debug!("Scanning {} routes", routes.len());

        let mut scanned = Vec::with_capacity(routes.len());
        let mut failure = None;
        for route in &routes {
            match self.fetch_duration(route).await {
                Ok(duration) => scanned.push((route, duration)),
                Err(e) => {
                    error!(
                        route_id = route.route_id,
                        "Scan cycle aborted after {} of {} routes: {}",
                        scanned.len(),
                        routes.len(),
                        e
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut scope = self.storage.session_scope().await?;
        let live: HashSet<_> = scope.get_routes(None).await?.into_iter().map(|r| r.route_id).collect();
        for (route, duration) in &scanned {
            if !live.contains(&route.route_id) {
                debug!(route_id = route.route_id, "Route removed mid-cycle, dropping its sample");
                continue;
            }
            if let Err(e) = self.record_sample(scope.as_mut(), route, *duration).await {
                error!(route_id = route.route_id, "Storage failed mid-cycle, rolling back: {}", e);
                return Err(e);
            }
        }
        scope.commit().await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(routes.len()),
        }
    }

    /// Run cycles until `cancel` fires. Returns the first cycle error.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), ScanError> {
        info!("Scan loop started with a period of {:?}", self.config.period);

        while !cancel.is_cancelled() {
            let started = Instant::now();
            let scanned = self.run_cycle().await?;

            let elapsed = started.elapsed();
            let sleep = sleep_time(self.config.period, elapsed);
            info!(routes = scanned, "Scan cycle took {:?}, sleeping for {:?}", elapsed, sleep);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!("Scan loop stopped");
        Ok(())
    }

    /// Run [`serve`](Self::serve), restarting it after a cooldown whenever it fails.
    pub async fn serve_restart(&self, cancel: CancellationToken) {
        loop {
            let Err(e) = self.serve(cancel.clone()).await else {
                return;
            };

            error!(
                error = %e,
                "Scan loop crashed, restarting in {:?}",
                self.config.crash_cooldown
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.crash_cooldown) => {}
            }
        }
    }
}
