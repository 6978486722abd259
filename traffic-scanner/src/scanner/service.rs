//! Route management commands.
//!
//! [`TrafficService`] is what a front end (the CLI today) calls into. It shares nothing with the
//! running [`ScanScheduler`] except storage: every command opens its own scope, and scopes are
//! serialized by the backend.

use chrono::Weekday;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::Storage;
use crate::db::models::{NewRoute, Route, User, validate_title};
use crate::errors::{Error, Result};
use crate::report::DailyProfile;
use crate::scanner::{ScanError, ScanScheduler};
use crate::types::{Coords, RouteId, UserId};

/// Valid UTC offsets, in hours.
pub const TIMEZONE_RANGE: std::ops::RangeInclusive<i32> = -12..=14;

/// Outcome of [`TrafficService::add_route`].
#[derive(Debug)]
pub struct AddedRoute {
    pub route: Route,
    /// The eager first scan; the route is kept even when this failed
    pub first_scan: std::result::Result<Option<i64>, ScanError>,
}

#[derive(Clone)]
pub struct TrafficService {
    scheduler: ScanScheduler,
}

impl TrafficService {
    pub fn new(scheduler: ScanScheduler) -> Self {
        Self { scheduler }
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.scheduler.storage()
    }

    fn route_not_found(route_id: RouteId) -> Error {
        Error::NotFound {
            resource: "Route".to_string(),
            id: route_id.to_string(),
        }
    }

    /// Track a new route, then scan it once right away.
    #[instrument(skip(self, title), err)]
    pub async fn add_route(&self, start: Coords, end: Coords, user_id: UserId, title: String) -> Result<AddedRoute> {
        let new_route = NewRoute::new(start, end, title, user_id);
        new_route.validate()?;

        let mut scope = self.storage().session_scope().await?;
        let route = scope.add_route(new_route).await?;
        scope.commit().await?;
        info!(route_id = route.route_id, user_id, "Added route {}", route.title);

        let first_scan = self.scheduler.scan_route(&route).await;
        if let Err(e) = &first_scan {
            warn!(route_id = route.route_id, "First scan of new route failed: {}", e);
        }

        Ok(AddedRoute { route, first_scan })
    }

    /// Stop tracking a route and drop all of its samples.
    #[instrument(skip(self), err)]
    pub async fn remove_route(&self, user_id: UserId, route_id: RouteId) -> Result<()> {
        let mut scope = self.storage().session_scope().await?;
        if !scope.remove_route(user_id, route_id).await? {
            return Err(Self::route_not_found(route_id));
        }
        scope.commit().await?;
        info!(route_id, user_id, "Removed route");
        Ok(())
    }

    #[instrument(skip(self, title), err)]
    pub async fn rename_route(&self, user_id: UserId, route_id: RouteId, title: &str) -> Result<Route> {
        validate_title(title)?;

        let mut scope = self.storage().session_scope().await?;
        let Some(mut route) = scope.get_route(user_id, route_id).await? else {
            return Err(Self::route_not_found(route_id));
        };
        scope.rename_route(user_id, route_id, title).await?;
        scope.commit().await?;

        route.title = title.to_string();
        Ok(route)
    }

    pub async fn list_routes(&self, user_id: Option<UserId>) -> Result<Vec<Route>> {
        let mut scope = self.storage().session_scope().await?;
        Ok(scope.get_routes(user_id).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn set_timezone(&self, user_id: UserId, hours: i32) -> Result<User> {
        if !TIMEZONE_RANGE.contains(&hours) {
            return Err(Error::BadRequest {
                message: format!(
                    "timezone must be between {} and {} hours, got {hours}",
                    TIMEZONE_RANGE.start(),
                    TIMEZONE_RANGE.end()
                ),
            });
        }

        let user = User {
            user_id,
            timezone: Some(hours),
        };
        let mut scope = self.storage().session_scope().await?;
        scope.update_user(&user).await?;
        scope.commit().await?;
        Ok(user)
    }

    /// Daily profile of a route, optionally restricted to one local weekday.
    ///
    /// Buckets are three scan periods wide.
    pub async fn report(&self, user_id: UserId, route_id: RouteId, day: Option<Weekday>) -> Result<DailyProfile> {
        let mut scope = self.storage().session_scope().await?;
        let Some(route) = scope.get_route(user_id, route_id).await? else {
            return Err(Self::route_not_found(route_id));
        };
        let report = match day {
            Some(day) => scope.make_report_for_day(&route, day).await?,
            None => scope.make_report(&route).await?,
        };
        Ok(DailyProfile::from_report(&report, self.scheduler.config().period * 3))
    }
}
