//! # Issue Sources
//!
//! Pollers read issues from an external detection API. The engine only sees
//! the [`IssueSource`] trait; [`IssueSourceConnector`] turns a poller
//! integration (base URL + credentials) into a live source.
//!
//! [`DetectorConnector`] is the HTTP implementation used in production.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Integration, Issue, IssueDetails};
use crate::Result;

pub mod detector;

pub use detector::{DetectorConnector, DetectorSource};

/// Read-only view of an issue-detection API.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Issues with an id greater than `since`, oldest first.
    ///
    /// `issue_type` of `None` (or the wildcard workflow name) applies no type filter.
    async fn fetch_issues(&self, issue_type: Option<&str>, since: &str) -> Result<Vec<Issue>>;

    async fn fetch_issue_detail(&self, issue_id: &str) -> Result<IssueDetails>;
}

/// Builds an [`IssueSource`] for a poller integration.
pub trait IssueSourceConnector: Send + Sync {
    fn connect(&self, poller: &Integration) -> Result<Arc<dyn IssueSource>>;
}
