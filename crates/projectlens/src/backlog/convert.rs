//! Conversion of Backlog response bodies into sync items.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::sync::SyncItem;

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert one JSON object into a [`SyncItem`].
///
/// Objects without a numeric `id` are skipped. Projects carry no `updated`
/// field, so they always diff as unchanged once stored.
pub fn to_sync_item(value: &Value) -> Option<SyncItem> {
    let id = value.get("id")?.as_i64()?;
    Some(SyncItem {
        id,
        updated: parse_timestamp(value.get("updated")),
        relevance_score: None,
        payload: value.clone(),
    })
}

/// Convert a response body (array or single object) into sync items.
pub fn body_to_items(body: &Value) -> Vec<SyncItem> {
    match body {
        Value::Array(values) => values.iter().filter_map(to_sync_item).collect(),
        Value::Object(_) => to_sync_item(body).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Issue key of an issue payload.
pub fn issue_key(payload: &Value) -> Option<&str> {
    payload.get("issueKey")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_to_items_handles_arrays_objects_and_junk() {
        let items = body_to_items(&json!([
            {"id": 1, "updated": "2024-01-01T10:00:00Z"},
            {"name": "no id"},
            {"id": 2}
        ]));
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].updated,
            Some(DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(items[1].updated, None);

        let single = body_to_items(&json!({"id": 7, "name": "me"}));
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, 7);

        assert!(body_to_items(&json!("nope")).is_empty());
    }

    #[test]
    fn unparseable_updated_is_none() {
        let item = to_sync_item(&json!({"id": 1, "updated": "yesterday"})).unwrap();
        assert_eq!(item.updated, None);
    }

    #[test]
    fn issue_key_reads_payload() {
        assert_eq!(issue_key(&json!({"issueKey": "PROJ-3"})), Some("PROJ-3"));
        assert_eq!(issue_key(&json!({"id": 1})), None);
    }
}
