//! Issue relevance scoring.
//!
//! | Signal | Points |
//! |---|---|
//! | assigned to me | 50 |
//! | assigned to me and overdue | +100 |
//! | assigned to me and due within 7 days | +50 |
//! | assigned to me and updated within 3 days | +50 |
//! | description mentions my name | +30 |

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};

use crate::backlog::{Issue, User};

/// Issues at or above this score are reported as high relevance.
pub const HIGH_RELEVANCE_SCORE: i32 = 80;

const ASSIGNED_POINTS: i32 = 50;
const OVERDUE_POINTS: i32 = 100;
const DUE_SOON_POINTS: i32 = 50;
const DUE_SOON_DAYS: i64 = 7;
const RECENT_UPDATE_POINTS: i32 = 50;
const RECENT_UPDATE_DAYS: i64 = 3;
const MENTION_POINTS: i32 = 30;

/// Parse a Backlog due date (`2024-01-31T00:00:00Z` or `2024-01-31`).
fn parse_due_date(raw: &str) -> Option<NaiveDate> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ")
        .map(|dt| dt.date())
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// Score `issue` for `me` as of `today` (local calendar date) and `now`.
pub fn calculate_score_at(issue: &Issue, me: &User, today: NaiveDate, now: DateTime<Utc>) -> i32 {
    let mut score = 0;

    if issue.assignee.as_ref().is_some_and(|a| a.id == me.id) {
        score += ASSIGNED_POINTS;

        if let Some(due) = issue.due_date.as_deref().and_then(parse_due_date) {
            let days_left = (due - today).num_days();
            if days_left < 0 {
                score += OVERDUE_POINTS;
            } else if days_left <= DUE_SOON_DAYS {
                score += DUE_SOON_POINTS;
            }
        }

        if let Some(updated) = issue.updated
            && (now - updated).num_days() <= RECENT_UPDATE_DAYS
        {
            score += RECENT_UPDATE_POINTS;
        }
    }

    if !me.name.is_empty()
        && issue
            .description
            .as_deref()
            .is_some_and(|d| d.contains(&me.name))
    {
        score += MENTION_POINTS;
    }

    score
}

/// Score `issue` for `me` using the current clock.
pub fn calculate_score(issue: &Issue, me: &User) -> i32 {
    calculate_score_at(issue, me, Local::now().date_naive(), Utc::now())
}

/// Score a raw issue payload. Returns `None` if it is not a decodable issue.
pub fn score_payload(payload: &serde_json::Value, me: &User) -> Option<i32> {
    let issue: Issue = serde_json::from_value(payload.clone()).ok()?;
    Some(calculate_score(&issue, me))
}
