//! Backlog API client.
//!
//! [`BacklogClient`] implements [`crate::remote::RemoteApi`] for one space
//! over an [`crate::http::HttpTransport`]. With the `backlog` feature it can
//! be built directly on reqwest; without it callers supply a transport.
//!
//! # Module Structure
//!
//! - [`types`] - API data structures
//! - [`client`] - The client and rate limit header parsing
//! - [`convert`] - Response bodies to sync items
//!
//! # Example
//!
//! ```ignore
//! use projectlens::backlog::BacklogClient;
//! use projectlens::remote::RemoteApi;
//!
//! let client = BacklogClient::new("acme.backlog.com", "api-key", Duration::from_secs(30))?;
//! let issues = client.get("/issues", &[("count", "20")]).await?;
//! ```

mod client;
pub mod convert;
mod types;

pub use client::{BacklogClient, base_url_for, parse_rate_limit_headers};
pub use types::{Issue, IssueType, Priority, Project, Status, User, project_key_of};
