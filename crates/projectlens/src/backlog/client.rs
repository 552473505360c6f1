//! Backlog API client.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Project, RateLimitEnvelope, User};
use crate::http::{
    HttpError, HttpMethod, HttpPairs, HttpRequest, HttpResponse, HttpTransport, pair_get,
};
use crate::remote::{ApiRequest, ApiResponse, RateLimitInfo, RemoteApi, RemoteError, Result};

/// Backlog API client for one space.
///
/// Authenticates with an API key passed as the `apiKey` query parameter.
/// Every response's `X-RateLimit-*` headers are remembered so callers can
/// inspect the latest known quota without another round trip.
#[derive(Clone)]
pub struct BacklogClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    api_key: String,
    last_rate_limit: Arc<Mutex<Option<RateLimitInfo>>>,
}

impl BacklogClient {
    /// Create a client for `domain` (e.g. `acme.backlog.com`) over reqwest.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = BacklogClient::new("acme.backlog.com", "api-key", Duration::from_secs(30))?;
    /// let me = client.get_myself().await?;
    /// ```
    #[cfg(feature = "backlog")]
    pub fn new(domain: &str, api_key: &str, timeout: std::time::Duration) -> Result<Self> {
        let transport = crate::http::reqwest_transport::ReqwestTransport::with_timeout(timeout)
            .map_err(|e| RemoteError::internal(e.to_string()))?;
        Ok(Self::new_with_transport(domain, api_key, Arc::new(transport)))
    }

    pub fn new_with_transport(
        domain: &str,
        api_key: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url_for(domain),
            api_key: api_key.to_string(),
            last_rate_limit: Arc::new(Mutex::new(None)),
        }
    }

    /// Base URL, e.g. `https://acme.backlog.com/api/v2`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Rate limit reported by the most recent response, if any.
    pub fn last_rate_limit(&self) -> Option<RateLimitInfo> {
        self.last_rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The authenticated user.
    pub async fn get_myself(&self) -> Result<User> {
        let response = self.get("/users/myself", &[]).await?;
        serde_json::from_value(response.body).map_err(|e| RemoteError::decode(e.to_string()))
    }

    /// Projects visible to the authenticated user.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let response = self.get("/projects", &[]).await?;
        serde_json::from_value(response.body).map_err(|e| RemoteError::decode(e.to_string()))
    }

    fn build_request(&self, request: &ApiRequest) -> Result<HttpRequest> {
        let mut query: HttpPairs = Vec::with_capacity(request.params.len() + 1);
        query.push(("apiKey".to_string(), self.api_key.clone()));
        query.extend(request.params.iter().cloned());

        let mut headers: HttpPairs = vec![("Accept".to_string(), "application/json".to_string())];
        let body = match &request.body {
            Some(body) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                serde_json::to_vec(body).map_err(|e| RemoteError::internal(e.to_string()))?
            }
            None => Vec::new(),
        };

        Ok(HttpRequest {
            method: request.method,
            url: format!("{}{}", self.base_url, request.endpoint),
            query,
            headers,
            body,
        })
    }

    fn remember_rate_limit(&self, info: &RateLimitInfo) {
        *self
            .last_rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
    }
}

/// Build the API base URL for a space domain.
///
/// Accepts a bare domain or one with a scheme and trailing slash.
pub fn base_url_for(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        format!("{domain}/api/v2")
    } else {
        format!("https://{domain}/api/v2")
    }
}

fn parse_reset(value: Option<&str>) -> Option<DateTime<Utc>> {
    let epoch = value?.trim().parse::<i64>().ok()?;
    DateTime::from_timestamp(epoch, 0)
}

/// Extract rate limit info from Backlog response headers.
pub fn parse_rate_limit_headers(response: &HttpResponse) -> Option<RateLimitInfo> {
    let limit = pair_get(&response.headers, "x-ratelimit-limit")?
        .trim()
        .parse::<u64>()
        .ok()?;
    let remaining = pair_get(&response.headers, "x-ratelimit-remaining")?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(RateLimitInfo {
        limit,
        remaining,
        reset_at: parse_reset(pair_get(&response.headers, "x-ratelimit-reset")),
    })
}

fn map_transport_error(err: HttpError) -> RemoteError {
    match err {
        HttpError::Timeout => RemoteError::Timeout { elapsed_ms: 0 },
        other => RemoteError::network(other.to_string()),
    }
}

/// Pull the first `errors[].message` out of a Backlog error body.
fn error_message(response: &HttpResponse) -> String {
    response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|v| {
            v.get("errors")?
                .get(0)?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| response.text())
}

#[async_trait]
impl RemoteApi for BacklogClient {
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let endpoint = request.endpoint.clone();
        let http_request = self.build_request(&request)?;

        let response = self
            .transport
            .send(http_request)
            .await
            .map_err(map_transport_error)?;

        let rate_limit = parse_rate_limit_headers(&response);
        if let Some(ref info) = rate_limit {
            self.remember_rate_limit(info);
        }

        if !response.is_success() {
            tracing::debug!(
                status = response.status,
                endpoint = %endpoint,
                "Backlog request failed"
            );
            if response.status == 429 {
                return Err(RemoteError::RateLimited {
                    reset_at: rate_limit.and_then(|r| r.reset_at),
                });
            }
            let message = if response.status == 404 {
                endpoint
            } else {
                error_message(&response)
            };
            return Err(RemoteError::from_status(response.status, message));
        }

        let body = response
            .json::<serde_json::Value>()
            .map_err(|e| RemoteError::decode(e.to_string()))?;

        Ok(ApiResponse {
            status: response.status,
            body,
            rate_limit,
            size_bytes: response.body.len(),
        })
    }

    async fn rate_limit_status(&self) -> Result<RateLimitInfo> {
        let response = self
            .request(ApiRequest {
                method: HttpMethod::Get,
                endpoint: "/rateLimit".to_string(),
                params: Vec::new(),
                body: None,
            })
            .await?;

        let envelope: RateLimitEnvelope = serde_json::from_value(response.body)
            .map_err(|e| RemoteError::decode(e.to_string()))?;
        let read = envelope.rate_limit.read;
        let info = RateLimitInfo {
            limit: read.limit,
            remaining: read.remaining,
            reset_at: DateTime::from_timestamp(read.reset, 0),
        };
        self.remember_rate_limit(&info);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockTransport;

    const BASE: &str = "https://acme.backlog.com/api/v2";

    fn client(transport: &MockTransport) -> BacklogClient {
        BacklogClient::new_with_transport("acme.backlog.com", "secret", Arc::new(transport.clone()))
    }

    fn response(status: u16, headers: HttpPairs, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    fn rate_headers(limit: u64, remaining: u64) -> HttpPairs {
        vec![
            ("X-RateLimit-Limit".into(), limit.to_string()),
            ("X-RateLimit-Remaining".into(), remaining.to_string()),
            ("X-RateLimit-Reset".into(), "1700000000".into()),
        ]
    }

    #[test]
    fn base_url_for_accepts_bare_and_schemed_domains() {
        assert_eq!(base_url_for("acme.backlog.com"), BASE);
        assert_eq!(base_url_for("https://acme.backlog.com/"), BASE);
        assert_eq!(
            base_url_for("http://localhost:8080"),
            "http://localhost:8080/api/v2"
        );
    }

    #[tokio::test]
    async fn request_sends_api_key_and_params_and_reads_rate_headers() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/issues"),
            response(200, rate_headers(600, 450), r#"[{"id":1}]"#),
        );

        let client = client(&transport);
        let resp = client
            .get("/issues", &[("count", "20"), ("sort", "updated")])
            .await
            .unwrap();

        assert_eq!(resp.body, serde_json::json!([{"id": 1}]));
        let info = resp.rate_limit.unwrap();
        assert_eq!((info.limit, info.remaining), (600, 450));
        assert_eq!(info.reset_at, DateTime::from_timestamp(1_700_000_000, 0));
        assert_eq!(client.last_rate_limit(), Some(info));

        let sent = &transport.requests()[0];
        assert_eq!(sent.query_value("apiKey"), Some("secret"));
        assert_eq!(sent.query_value("count"), Some("20"));
        assert_eq!(sent.query_value("sort"), Some("updated"));
    }

    #[tokio::test]
    async fn request_maps_429_to_rate_limited_with_reset() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/issues"),
            response(429, rate_headers(600, 0), r#"{"errors":[{"message":"Too Many"}]}"#),
        );

        let err = client(&transport).get("/issues", &[]).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.reset_at(), DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[tokio::test]
    async fn request_maps_error_statuses() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/projects"),
            response(401, Vec::new(), r#"{"errors":[{"message":"Authentication failure."}]}"#),
        );
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/projects"),
            response(400, Vec::new(), r#"{"errors":[{"message":"Invalid parameter"}]}"#),
        );
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/projects"),
            response(503, Vec::new(), "maintenance"),
        );

        let client = client(&transport);
        assert!(matches!(
            client.get("/projects", &[]).await.unwrap_err(),
            RemoteError::AuthRequired
        ));
        match client.get("/projects", &[]).await.unwrap_err() {
            RemoteError::Validation { message } => assert_eq!(message, "Invalid parameter"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            client.get("/projects", &[]).await.unwrap_err(),
            RemoteError::Server { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn request_without_mock_is_network_error() {
        let transport = MockTransport::new();
        let err = client(&transport).get("/projects", &[]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network { .. }));
    }

    #[tokio::test]
    async fn rate_limit_status_reads_read_bucket() {
        let transport = MockTransport::new();
        transport.push_json(
            format!("{BASE}/rateLimit"),
            serde_json::json!({
                "rateLimit": {
                    "read": {"limit": 600, "remaining": 120, "reset": 1700000000},
                    "update": {"limit": 150, "remaining": 150, "reset": 1700000000}
                }
            }),
        );

        let info = client(&transport).rate_limit_status().await.unwrap();
        assert_eq!(info.limit, 600);
        assert_eq!(info.remaining, 120);
        assert!((info.utilization() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn typed_helpers_decode_bodies() {
        let transport = MockTransport::new();
        transport.push_json(
            format!("{BASE}/users/myself"),
            serde_json::json!({"id": 7, "userId": "taro", "name": "Taro Yamada"}),
        );
        transport.push_json(
            format!("{BASE}/projects"),
            serde_json::json!([{"id": 1, "projectKey": "PROJ", "name": "Project", "archived": false}]),
        );

        let client = client(&transport);
        let me = client.get_myself().await.unwrap();
        assert_eq!(me.id, 7);
        assert_eq!(me.name, "Taro Yamada");

        let projects = client.list_projects().await.unwrap();
        assert_eq!(projects[0].project_key, "PROJ");
    }
}
