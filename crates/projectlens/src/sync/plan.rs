//! Request plans for each stage.

use chrono::{DateTime, NaiveDate, Utc};

use super::types::{PAGE_SIZE, STAGE1_RECENT_ISSUES};
use crate::entity::entity_collection::EntityCollection;
use crate::remote::ApiRequest;

/// One request of a stage pass and where its items go.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub request: ApiRequest,
    pub collection: EntityCollection,
    /// Zero-based page within the collection.
    pub page: usize,
    /// Expected page size, if the request is paged.
    pub page_size: Option<usize>,
}

impl PlannedRequest {
    fn single(request: ApiRequest, collection: EntityCollection) -> Self {
        Self {
            request,
            collection,
            page: 0,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// `updatedSince` takes a calendar date.
pub fn format_since(since: DateTime<Utc>) -> String {
    since.date_naive().format("%Y-%m-%d").to_string()
}

/// Statuses worth mirroring: open, in progress and resolved.
pub const ACTIVE_STATUS_IDS: [i64; 3] = [1, 2, 3];

/// Server-side filter sent with every issue request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    /// Numeric project ids; empty asks for every project.
    pub project_ids: Vec<i64>,
}

impl IssueFilter {
    pub fn projects(project_ids: Vec<i64>) -> Self {
        Self { project_ids }
    }

    fn apply(&self, request: ApiRequest) -> ApiRequest {
        let request = self
            .project_ids
            .iter()
            .fold(request, |request, id| request.param("projectId[]", id));
        ACTIVE_STATUS_IDS
            .iter()
            .fold(request, |request, id| request.param("statusId[]", id))
    }
}

fn issues_request(filter: &IssueFilter, count: usize, offset: usize, order: SortOrder) -> ApiRequest {
    let request = ApiRequest::get(EntityCollection::Issues.endpoint())
        .param("count", count)
        .param("sort", "updated")
        .param("order", order.as_str());
    let request = if offset > 0 {
        request.param("offset", offset)
    } else {
        request
    };
    filter.apply(request)
}

/// Projects, the API key's user and the most recent issues.
pub fn stage1(filter: &IssueFilter) -> Vec<PlannedRequest> {
    vec![
        PlannedRequest::single(
            ApiRequest::get(EntityCollection::Projects.endpoint()),
            EntityCollection::Projects,
        ),
        PlannedRequest::single(
            ApiRequest::get(EntityCollection::Users.endpoint()),
            EntityCollection::Users,
        ),
        PlannedRequest {
            request: issues_request(filter, STAGE1_RECENT_ISSUES, 0, SortOrder::Desc),
            collection: EntityCollection::Issues,
            page: 0,
            page_size: Some(STAGE1_RECENT_ISSUES),
        },
    ]
}

/// Issue pages in `order`, optionally limited to changes since `since`.
///
/// Incremental passes page oldest first so a capped pass still covers a
/// contiguous range starting at `since`. With `include_projects` the project
/// list is refreshed too.
pub fn stage2(
    filter: &IssueFilter,
    since: Option<DateTime<Utc>>,
    order: SortOrder,
    pages: usize,
    include_projects: bool,
) -> Vec<PlannedRequest> {
    let mut plan = Vec::with_capacity(pages + 1);
    if include_projects {
        plan.push(PlannedRequest::single(
            ApiRequest::get(EntityCollection::Projects.endpoint()),
            EntityCollection::Projects,
        ));
    }
    for page in 0..pages.max(1) {
        let mut request = issues_request(filter, PAGE_SIZE, page * PAGE_SIZE, order);
        if let Some(since) = since {
            request = request.param("updatedSince", format_since(since));
        }
        plan.push(PlannedRequest {
            request,
            collection: EntityCollection::Issues,
            page,
            page_size: Some(PAGE_SIZE),
        });
    }
    plan
}

/// Historical issue pages, oldest first, starting at `since`.
pub fn stage3(filter: &IssueFilter, since: NaiveDate, pages: usize) -> Vec<PlannedRequest> {
    let since = since.format("%Y-%m-%d").to_string();
    (0..pages.max(1))
        .map(|page| PlannedRequest {
            request: issues_request(filter, PAGE_SIZE, page * PAGE_SIZE, SortOrder::Asc)
                .param("updatedSince", since.clone()),
            collection: EntityCollection::Issues,
            page,
            page_size: Some(PAGE_SIZE),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage1_is_small_fixed_battery() {
        let plan = stage1(&IssueFilter::default());
        assert_eq!(plan.len(), 3);
        let issues = &plan[2].request;
        assert_eq!(issues.endpoint, "/issues");
        assert_eq!(issues.param_value("count"), Some("20"));
        assert_eq!(issues.param_value("sort"), Some("updated"));
        assert_eq!(plan[1].collection, EntityCollection::Users);
    }

    #[test]
    fn test_stage2_pages_and_since() {
        let since = DateTime::parse_from_rfc3339("2024-01-05T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let plan = stage2(&IssueFilter::default(), Some(since), SortOrder::Asc, 3, true);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].collection, EntityCollection::Projects);
        assert_eq!(plan[1].request.param_value("offset"), None);
        assert_eq!(plan[3].request.param_value("offset"), Some("200"));
        assert_eq!(plan[3].request.param_value("updatedSince"), Some("2024-01-05"));
        assert_eq!(plan[3].request.param_value("order"), Some("asc"));
        assert_eq!(plan[3].page, 2);

        let narrowed = stage2(&IssueFilter::default(), None, SortOrder::Desc, 1, false);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].request.param_value("updatedSince"), None);
        assert_eq!(narrowed[0].request.param_value("order"), Some("desc"));
    }

    #[test]
    fn test_stage3_ascending_from_cutoff() {
        let plan = stage3(&IssueFilter::default(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 2);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].request.param_value("order"), Some("asc"));
        assert_eq!(plan[1].request.param_value("updatedSince"), Some("2024-01-01"));
        assert_eq!(plan[1].request.param_value("offset"), Some("100"));
    }

    #[test]
    fn test_every_issue_request_carries_status_and_project_filter() {
        let filter = IssueFilter::projects(vec![10, 20]);
        let since = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let issue_requests: Vec<ApiRequest> = stage1(&filter)
            .into_iter()
            .chain(stage2(&filter, None, SortOrder::Desc, 2, true))
            .chain(stage3(&filter, since, 1))
            .filter(|p| p.collection == EntityCollection::Issues)
            .map(|p| p.request)
            .collect();
        assert_eq!(issue_requests.len(), 4);
        for request in &issue_requests {
            assert_eq!(request.param_values("statusId[]"), vec!["1", "2", "3"]);
            assert_eq!(request.param_values("projectId[]"), vec!["10", "20"]);
        }

        let projects = &stage1(&filter)[0].request;
        assert!(projects.param_values("statusId[]").is_empty());
    }

    #[test]
    fn test_unfiltered_projects_send_no_project_ids() {
        let plan = stage1(&IssueFilter::default());
        assert!(plan[2].request.param_values("projectId[]").is_empty());
        assert_eq!(plan[2].request.param_values("statusId[]").len(), 3);
    }
}
