//! # traffic-scanner: recurring travel-time measurements for user-defined routes
//!
//! `traffic-scanner` tracks how long a drive between two points takes over the course of the day.
//! Users register routes (a start point, an end point, a title); a background loop asks the Yandex
//! maps routing service for the current traffic-aware duration of every route once per period and
//! stores each answer as a timestamped sample. The samples feed a per-route daily profile.
//!
//! ## Architecture
//!
//! The [`Application`] wires three pieces together:
//!
//! - A [`SessionClient`](scanner::SessionClient) holding the routing service session: cookies, a
//!   CSRF token and a session id, refreshed every 24 hours. Every route request is signed with the
//!   `s` checksum the service expects (see [`make_s`](scanner::make_s)).
//! - A [`Storage`](db::Storage) backend: SQLite through sqlx, or a directory of JSON lines files.
//!   All reads and writes happen inside a scope that commits or rolls back as a unit.
//! - A [`ScanScheduler`](scanner::ScanScheduler) running the scan loop, and a
//!   [`TrafficService`](scanner::TrafficService) exposing route management to the CLI.
//!
//! The scheduler and the command layer share nothing but storage. Routes are scanned strictly
//! sequentially: the routing session is rate limited.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use traffic_scanner::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = traffic_scanner::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     traffic_scanner::telemetry::init_telemetry(&config.telemetry)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod config;
pub mod db;
pub mod errors;
pub mod report;
pub mod scanner;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::Config;
use config::Command;
use db::{Storage, open_storage};
use scanner::{RouteSession, ScanScheduler, SessionClient, TrafficService};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use types::{Coords, RouteId, UserId};

/// Get the traffic-scanner database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Composition root: storage, routing session, scan loop and command layer.
pub struct Application {
    config: Config,
    storage: Arc<dyn Storage>,
    scheduler: ScanScheduler,
    service: TrafficService,
}

impl Application {
    /// Open storage and build the routing session from configuration
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting traffic scanner with configuration: {:#?}", config);

        let storage = open_storage(&config.storage, config.default_timezone).await?;
        let session = Arc::new(SessionClient::new(config.client.clone())?);

        Ok(Self::from_parts(config, storage, session))
    }

    /// Assemble an application around an existing storage backend and routing session
    pub fn from_parts(config: Config, storage: Arc<dyn Storage>, session: Arc<dyn RouteSession>) -> Self {
        let scheduler = ScanScheduler::new(session, storage.clone(), config.scanner.clone());
        let service = TrafficService::new(scheduler.clone());
        Self {
            config,
            storage,
            scheduler,
            service,
        }
    }

    pub fn service(&self) -> &TrafficService {
        &self.service
    }

    /// Run the scan loop until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown_token = CancellationToken::new();
        let restart_on_crash = self.config.scanner.restart_on_crash;

        let scheduler = self.scheduler.clone();
        let token = shutdown_token.clone();
        let mut handle = tokio::spawn(async move {
            if restart_on_crash {
                scheduler.serve_restart(token).await;
                Ok(())
            } else {
                scheduler.serve(token).await
            }
        });

        let result = tokio::select! {
            _ = shutdown => {
                info!("Stopping scan loop...");
                shutdown_token.cancel();
                (&mut handle).await
            }
            result = &mut handle => result,
        };

        self.storage.close().await;
        Ok(result??)
    }

    /// Execute a one-shot command and return what to print
    pub async fn execute(&self, command: Command) -> errors::Result<String> {
        let out = match command {
            Command::Serve => {
                return Err(errors::Error::BadRequest {
                    message: "serve runs until interrupted, use Application::serve".to_string(),
                });
            }
            Command::AddRoute { user, start, end, title } => {
                let added = self.service.add_route(start, end, user, title).await?;
                let scan = match added.first_scan {
                    Ok(Some(secs)) => format!("Current travel time: {}m {}s", secs / 60, secs % 60),
                    Ok(None) => "No route found between these points right now".to_string(),
                    Err(e) => format!("First scan failed, will retry next cycle: {e}"),
                };
                format!("Added route #{} {}\n{scan}\n", added.route.route_id, added.route.title)
            }
            Command::RemoveRoute { user, route } => {
                self.service.remove_route(user, route).await?;
                format!("Removed route #{route}\n")
            }
            Command::RenameRoute { user, route, title } => {
                let route = self.service.rename_route(user, route, &title).await?;
                format!("Renamed route #{} to {}\n", route.route_id, route.title)
            }
            Command::ListRoutes { user } => {
                let routes = self.service.list_routes(user).await?;
                if routes.is_empty() {
                    "No routes\n".to_string()
                } else {
                    routes
                        .iter()
                        .map(|route| {
                            format!(
                                "#{} {} [{} -> {}] user {}\n",
                                route.route_id, route.title, route.start, route.end, route.user_id
                            )
                        })
                        .collect()
                }
            }
            Command::SetTimezone { user, hours } => {
                self.service.set_timezone(user, hours).await?;
                format!("Timezone of user {user} set to UTC{hours:+}\n")
            }
            Command::Report { user, route, day } => self.service.report(user, route, day).await?.to_string(),
        };
        Ok(out)
    }

    /// Run `command`; `serve` blocks until `shutdown` resolves
    pub async fn run<F>(self, command: Command, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if command == Command::Serve {
            return self.serve(shutdown).await;
        }

        let result = self.execute(command).await;
        self.storage.close().await;

        match result {
            Ok(out) => {
                print!("{out}");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Command failed");
                anyhow::bail!(e.user_message())
            }
        }
    }
}
