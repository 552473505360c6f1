//! Scripted in-memory [`RemoteApi`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::{RemoteError, Result};
use super::types::{ApiRequest, ApiResponse, RateLimitInfo, RemoteApi};

#[derive(Clone)]
pub(crate) struct ScriptedApi {
    inner: Arc<Mutex<ScriptedInner>>,
}

struct ScriptedInner {
    /// One-shot responses, consumed before the sticky ones.
    queued: HashMap<String, VecDeque<Result<Value>>>,
    sticky: HashMap<String, Result<Value>>,
    requests: Vec<ApiRequest>,
    rate_limit: Result<RateLimitInfo>,
    delay: Option<Duration>,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptedInner {
                queued: HashMap::new(),
                sticky: HashMap::new(),
                requests: Vec::new(),
                rate_limit: Ok(RateLimitInfo {
                    limit: 600,
                    remaining: 600,
                    reset_at: None,
                }),
                delay: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Always answer `endpoint` with `body`.
    pub(crate) fn respond(&self, endpoint: &str, body: Value) {
        self.lock().sticky.insert(endpoint.to_string(), Ok(body));
    }

    /// Always fail `endpoint` with `err`.
    pub(crate) fn fail(&self, endpoint: &str, err: RemoteError) {
        self.lock().sticky.insert(endpoint.to_string(), Err(err));
    }

    /// Answer the next call to `endpoint` with `result`.
    pub(crate) fn push(&self, endpoint: &str, result: Result<Value>) {
        self.lock()
            .queued
            .entry(endpoint.to_string())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn set_rate_limit(&self, limit: u64, remaining: u64) {
        self.lock().rate_limit = Ok(RateLimitInfo {
            limit,
            remaining,
            reset_at: None,
        });
    }

    pub(crate) fn fail_rate_limit(&self, err: RemoteError) {
        self.lock().rate_limit = Err(err);
    }

    /// Sleep this long inside every request.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.lock().requests.clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.lock().requests.len()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let (result, delay) = {
            let mut inner = self.lock();
            let endpoint = request.endpoint.clone();
            inner.requests.push(request);
            let queued = inner
                .queued
                .get_mut(&endpoint)
                .and_then(|q| q.pop_front());
            let result = match queued {
                Some(result) => result,
                None => inner
                    .sticky
                    .get(&endpoint)
                    .cloned()
                    .unwrap_or_else(|| Err(RemoteError::not_found(endpoint))),
            };
            (result, inner.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.map(ApiResponse::ok)
    }

    async fn rate_limit_status(&self) -> Result<RateLimitInfo> {
        self.lock().rate_limit.clone()
    }
}
