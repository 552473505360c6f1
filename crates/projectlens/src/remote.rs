//! Capability contract for the remote tracker API.
//!
//! The sync core never talks HTTP directly. It depends on the [`RemoteApi`]
//! trait, looked up per workspace through a [`ClientPool`]. The Backlog
//! implementation lives in [`crate::backlog`]; tests substitute scripted
//! implementations.
//!
//! # Example
//!
//! ```ignore
//! use projectlens::remote::{ClientPool, RemoteApi};
//!
//! async fn print_usage(pool: &ClientPool, workspace: &str) -> Result<(), RemoteError> {
//!     if let Some(client) = pool.get(workspace) {
//!         let info = client.rate_limit_status().await?;
//!         println!("{workspace}: {:.1}% used", info.utilization_percent());
//!     }
//!     Ok(())
//! }
//! ```

mod errors;
#[cfg(test)]
pub(crate) mod mock;
mod pool;
mod rate_limit;
mod types;

pub use errors::{RemoteError, Result, short_error_message};
pub use pool::ClientPool;
pub use rate_limit::{ApiRateLimiter, RateLimitedClient, rate_limits};
pub use types::{ApiRequest, ApiResponse, RateLimitInfo, RemoteApi};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::mock::ScriptedApi;
    use super::*;

    #[test]
    fn test_remote_error_from_status() {
        assert!(matches!(
            RemoteError::from_status(400, "bad"),
            RemoteError::Validation { .. }
        ));
        assert!(matches!(
            RemoteError::from_status(401, "nope"),
            RemoteError::AuthRequired
        ));
        assert!(matches!(
            RemoteError::from_status(404, "/issues/1"),
            RemoteError::NotFound { .. }
        ));
        assert!(matches!(
            RemoteError::from_status(409, "duplicate"),
            RemoteError::Constraint { .. }
        ));
        assert!(RemoteError::from_status(429, "slow down").is_rate_limited());
        assert!(matches!(
            RemoteError::from_status(503, "maintenance"),
            RemoteError::Server { status: 503, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(418, "teapot"),
            RemoteError::Api { status: 418, .. }
        ));
    }

    #[test]
    fn test_remote_error_rate_limited_display() {
        let err = RemoteError::RateLimited { reset_at: None };
        assert_eq!(err.to_string(), "Rate limit exceeded");

        let reset = Utc::now();
        let err = RemoteError::RateLimited {
            reset_at: Some(reset),
        };
        assert!(err.to_string().contains("Resets at"));
        assert_eq!(err.reset_at(), Some(reset));
    }

    #[test]
    fn test_remote_error_network() {
        let err = RemoteError::network("connection refused");
        assert!(err.to_string().contains("Network error"));
        assert!(err.to_string().contains("connection refused"));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_short_error_message_multiline() {
        let err = RemoteError::server(502, "bad gateway\n<html>...</html>");
        assert_eq!(short_error_message(&err), "Server error (502): bad gateway");
    }

    #[test]
    fn test_rate_limit_info_utilization() {
        let info = RateLimitInfo {
            limit: 600,
            remaining: 150,
            reset_at: None,
        };
        assert!((info.utilization() - 0.75).abs() < 1e-9);
        assert!((info.utilization_percent() - 75.0).abs() < 1e-9);
        assert!((info.remaining_fraction() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_rate_limit_info_zero_limit_is_unused() {
        let info = RateLimitInfo {
            limit: 0,
            remaining: 0,
            reset_at: None,
        };
        assert_eq!(info.utilization(), 0.0);
    }

    #[test]
    fn test_api_request_cache_key() {
        let request = ApiRequest::get("/issues")
            .param("count", 20)
            .param("sort", "updated");
        assert_eq!(request.cache_key(), "GET /issues?count=20&sort=updated");
        assert_eq!(request.param_value("sort"), Some("updated"));
        assert_eq!(request.param_value("order"), None);
    }

    #[test]
    fn test_api_response_ok_measures_body() {
        let response = ApiResponse::ok(serde_json::json!([1, 2, 3]));
        assert_eq!(response.status, 200);
        assert_eq!(response.size_bytes, "[1,2,3]".len());
    }

    #[test]
    fn test_rate_limits_constants() {
        assert_eq!(rate_limits::BACKLOG_DEFAULT_RPS, 2);
    }

    #[tokio::test]
    async fn test_api_rate_limiter_first_request_is_immediate() {
        let limiter = ApiRateLimiter::with_min_interval(Duration::from_secs(5));
        let start = std::time::Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));

        // Zero rate and zero interval must not panic
        let _ = ApiRateLimiter::new(0);
        let _ = ApiRateLimiter::with_min_interval(Duration::ZERO);
    }

    #[tokio::test]
    async fn test_rate_limited_client_delegates() {
        let api = ScriptedApi::new();
        api.respond("/projects", serde_json::json!([{"id": 1}]));

        let client = RateLimitedClient::new(api.clone(), 100);
        let response = client.get("/projects", &[]).await.unwrap();
        assert_eq!(response.body, serde_json::json!([{"id": 1}]));
        assert_eq!(client.inner().request_count(), 1);
    }

    #[test]
    fn test_client_pool_registry() {
        let pool = ClientPool::new();
        assert!(pool.is_empty());

        pool.insert("beta", Arc::new(ScriptedApi::new()));
        pool.insert("alpha", Arc::new(ScriptedApi::new()));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.workspace_ids(), vec!["alpha", "beta"]);
        assert!(pool.get("alpha").is_some());
        assert!(pool.remove("alpha"));
        assert!(!pool.remove("alpha"));
        assert!(pool.get("alpha").is_none());
    }
}
