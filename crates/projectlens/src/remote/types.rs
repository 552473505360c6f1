use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::HttpMethod;

use super::errors::Result;

/// Rate limit information reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Maximum requests allowed per period.
    pub limit: u64,
    /// Remaining requests in current period.
    pub remaining: u64,
    /// When the rate limit resets, if the service reported it.
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    /// Fraction of the quota already consumed, in `[0, 1]`.
    ///
    /// A zero limit means the service did not report a quota and is
    /// treated as unused.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        let used = self.limit.saturating_sub(self.remaining) as f64;
        (used / self.limit as f64).clamp(0.0, 1.0)
    }

    /// Utilization as a percentage.
    #[must_use]
    pub fn utilization_percent(&self) -> f64 {
        self.utilization() * 100.0
    }

    /// Fraction of the quota still available, in `[0, 1]`.
    #[must_use]
    pub fn remaining_fraction(&self) -> f64 {
        1.0 - self.utilization()
    }
}

/// A request against the remote API, relative to the workspace base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Endpoint path, e.g. `/issues`.
    pub endpoint: String,
    /// Query parameters in order.
    pub params: Vec<(String, String)>,
    /// JSON body for write requests.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// Build a GET request.
    #[must_use]
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            endpoint: endpoint.into(),
            params: Vec::new(),
            body: None,
        }
    }

    /// Append a query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Look up a query parameter by name.
    #[must_use]
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated query parameter, in order.
    pub fn param_values(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Stable key identifying this request, used for caching.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let query = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{} {}?{}", self.method.as_str(), self.endpoint, query)
    }
}

/// A decoded response from the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
    /// Rate limit headers attached to this response, if any.
    pub rate_limit: Option<RateLimitInfo>,
    /// Size of the raw body in bytes.
    pub size_bytes: usize,
}

impl ApiResponse {
    /// Build a 200 response around a JSON body.
    #[must_use]
    pub fn ok(body: serde_json::Value) -> Self {
        let size_bytes = body.to_string().len();
        Self {
            status: 200,
            body,
            rate_limit: None,
            size_bytes,
        }
    }
}

/// Capability contract for the remote tracker API.
///
/// One implementation talks to a single workspace (space). Transport,
/// authentication and URL construction belong to the implementor; the sync
/// core only relies on this shape.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Issue a request.
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Current rate limit status for this workspace.
    async fn rate_limit_status(&self) -> Result<RateLimitInfo>;

    /// Issue a GET request with query parameters.
    async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        let mut request = ApiRequest::get(endpoint);
        for (k, v) in params {
            request = request.param(*k, v);
        }
        self.request(request).await
    }

    /// Issue a POST request with a JSON body.
    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.request(ApiRequest {
            method: HttpMethod::Post,
            endpoint: endpoint.to_string(),
            params: Vec::new(),
            body: Some(body),
        })
        .await
    }

    /// Issue a PUT request with a JSON body.
    async fn put(&self, endpoint: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.request(ApiRequest {
            method: HttpMethod::Put,
            endpoint: endpoint.to_string(),
            params: Vec::new(),
            body: Some(body),
        })
        .await
    }

    /// Issue a DELETE request.
    async fn delete(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(ApiRequest {
            method: HttpMethod::Delete,
            endpoint: endpoint.to_string(),
            params: Vec::new(),
            body: None,
        })
        .await
    }
}
