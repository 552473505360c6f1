//! Backlog API data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backlog issue - the fields ProjectLens reads from `/issues`.
///
/// API docs: https://developer.nulab.com/docs/backlog/api/2/get-issue-list/
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: i64,
    /// Human-readable key, e.g. `PROJ-12`.
    pub issue_key: String,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub issue_type: Option<IssueType>,
    #[serde(default)]
    pub assignee: Option<User>,
    /// Due date as sent by the API (`2024-01-31T00:00:00Z` or `2024-01-31`).
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl Issue {
    /// Project key prefix of the issue key (`PROJ` for `PROJ-12`).
    #[must_use]
    pub fn project_key(&self) -> &str {
        project_key_of(&self.issue_key)
    }
}

/// Project key prefix of an issue key.
#[must_use]
pub fn project_key_of(issue_key: &str) -> &str {
    issue_key
        .rsplit_once('-')
        .map(|(prefix, _)| prefix)
        .unwrap_or(issue_key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Priority {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueType {
    pub id: i64,
    pub name: String,
}

/// Backlog user (assignee, or `/users/myself`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Backlog project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub project_key: String,
    pub name: String,
    #[serde(default)]
    pub archived: bool,
}

/// One bucket of `/rateLimit`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitBucket {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds.
    pub reset: i64,
}

/// Response of `/rateLimit`. Only the read bucket matters for sync.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitEnvelope {
    #[serde(rename = "rateLimit")]
    pub rate_limit: RateLimitBuckets,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitBuckets {
    pub read: RateLimitBucket,
}
