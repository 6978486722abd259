//! Route scanning: the routing service session, the scan loop, and the command layer on top.
//!
//! - [`client`]: authenticated, signed session against the routing service
//! - [`models`]: shape of route responses and duration extraction
//! - [`scheduler`]: the periodic scan loop and its restart supervisor
//! - [`service`]: route management commands that share storage with the loop

pub mod client;
pub mod models;
pub mod scheduler;
pub mod service;

use crate::db::errors::DbError;

pub use client::{RouteSession, SessionClient, make_s};
pub use models::RouteQueryResult;
pub use scheduler::ScanScheduler;
pub use service::TrafficService;

/// Failures of a scan, from the session handshake down to persisting the sample.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The session handshake (cookies or CSRF token) could not be completed
    #[error("Failed to establish routing session: {0}")]
    Session(#[source] reqwest::Error),

    /// A route request failed to connect or returned a non-2xx status
    #[error("Routing request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The response did not have the expected shape; the upstream contract changed
    #[error("Invalid response from routing service: {reason}")]
    InvalidResponse { reason: String },

    /// Writing the sample failed
    #[error(transparent)]
    Storage(#[from] DbError),
}

impl ScanError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ScanError::InvalidResponse { reason: reason.into() }
    }
}
