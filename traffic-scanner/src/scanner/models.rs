//! Shapes of routing service responses.
//!
//! A route request answers in one of three ways:
//!
//! - `{"data": {"routes": [...]}}`: a result, possibly with zero viable paths
//! - `{"csrfToken": "..."}` without `data`: the session is still warming up and the request
//!   should be repeated with the fresh token
//! - anything else: the upstream contract changed

use serde_json::Value;

use crate::scanner::ScanError;

/// Classified body of a route request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RouteResponse {
    Data(RouteQueryResult),
    TokenRefreshed(String),
    Malformed(Value),
}

impl RouteResponse {
    pub(crate) fn classify(mut body: Value) -> Self {
        if let Some(data) = body.get_mut("data") {
            return RouteResponse::Data(RouteQueryResult::new(data.take()));
        }
        match body.get("csrfToken").and_then(Value::as_str) {
            Some(token) => RouteResponse::TokenRefreshed(token.to_string()),
            None => RouteResponse::Malformed(body),
        }
    }
}

/// The `data` object of a successful route request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteQueryResult {
    data: Value,
}

impl RouteQueryResult {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Traffic-aware duration of the first suggested path, in seconds.
    ///
    /// `Ok(None)` means the service found no viable path. A missing `routes` list or a path
    /// without `durationInTraffic` is an [`ScanError::InvalidResponse`].
    pub fn duration_in_traffic(&self) -> Result<Option<i64>, ScanError> {
        let routes = self
            .data
            .get("routes")
            .and_then(Value::as_array)
            .ok_or_else(|| ScanError::invalid("data.routes is missing"))?;

        let Some(first) = routes.first() else {
            return Ok(None);
        };

        let duration = first
            .get("durationInTraffic")
            .ok_or_else(|| ScanError::invalid("data.routes[0].durationInTraffic is missing"))?;

        duration
            .as_i64()
            .or_else(|| duration.as_f64().map(|secs| secs as i64))
            .map(Some)
            .ok_or_else(|| ScanError::invalid(format!("durationInTraffic is not a number: {duration}")))
    }
}
