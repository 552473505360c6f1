//! ProjectLens - staged, rate-limit-aware sync of Backlog workspaces.
//!
//! This library mirrors projects, issues and the API key's user from one or
//! more Backlog spaces into a local database, in three stages of decreasing
//! priority, while keeping each space's API rate limit in check.
//!
//! # Features
//!
//! - `migrate` - Enables database migration support. When enabled, you can use
//!   [`connect_and_migrate`] to automatically run migrations on connection.
//! - `backlog` - Builds [`backlog::BacklogClient`] on reqwest.
//!
//! # Example
//!
//! ```ignore
//! use projectlens::{connect_and_migrate, sync::StageScheduler, workspace};
//!
//! let db = connect_and_migrate("sqlite://projectlens.db?mode=rwc").await?;
//! let pool = workspace::build_client_pool(&db, Duration::from_secs(30)).await?;
//!
//! let scheduler = StageScheduler::builder()
//!     .database(Arc::new(db))
//!     .clients(Arc::new(pool))
//!     .build()?;
//! let result = scheduler.execute_stage1("acme", Default::default()).await?;
//! ```

pub mod backlog;
pub mod cache;
pub mod db;
pub mod entity;
pub mod http;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scoring;
pub mod sync;
pub mod workspace;

#[cfg(feature = "migrate")]
pub mod migration;

pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use remote::{ApiRateLimiter, ClientPool, RateLimitInfo, RemoteApi, RemoteError};
pub use workspace::WorkspaceError;
