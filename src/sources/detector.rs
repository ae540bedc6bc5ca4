//! HTTP client for the issue-detection API.
//!
//! Two endpoints are used:
//!
//! - `GET {base}/getIssues` with `issue_id_gt`, `issue_time_gt` (two months back),
//!   ascending by `issue_id`, 100 per page and an optional `issue_type`
//! - `GET {base}/getIssueDetails` with `issue_id`, up to 1000 incidents
//!
//! Both authenticate with the poller's `token` credential as a bearer token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Months, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{IssueSource, IssueSourceConnector};
use crate::models::{Integration, Issue, IssueDetails, WILDCARD_WORKFLOW};
use crate::{RemediationError, Result};

const PAGE_SIZE: &str = "100";
const DETAIL_PAGE_SIZE: &str = "1000";
const LOOKBACK_MONTHS: u32 = 2;

/// `{success, results, metadata}` envelope; only the results are used.
#[derive(Debug, Deserialize)]
struct IssuePage {
    #[serde(default)]
    results: Vec<Issue>,
}

pub struct DetectorSource {
    client: Client,
    base_url: String,
    token: String,
}

impl DetectorSource {
    pub fn new(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn lookback_floor() -> String {
        let now = Utc::now();
        now.checked_sub_months(Months::new(LOOKBACK_MONTHS))
            .unwrap_or(now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

#[async_trait]
impl IssueSource for DetectorSource {
    async fn fetch_issues(&self, issue_type: Option<&str>, since: &str) -> Result<Vec<Issue>> {
        let mut query: Vec<(&str, String)> = Vec::with_capacity(7);
        if let Some(issue_type) = issue_type.filter(|t| !t.is_empty() && *t != WILDCARD_WORKFLOW) {
            query.push(("issue_type", issue_type.to_string()));
        }
        query.push(("issue_id_gt", since.to_string()));
        query.push(("issue_time_gt", Self::lookback_floor()));
        query.push(("sort_order", "ASC".to_string()));
        query.push(("sort_by", "issue_id".to_string()));
        query.push(("from", "0".to_string()));
        query.push(("size", PAGE_SIZE.to_string()));

        let page: IssuePage = self
            .client
            .get(format!("{}/getIssues", self.base_url))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Fetched {} issue(s) after id {}", page.results.len(), since);
        Ok(page.results)
    }

    async fn fetch_issue_detail(&self, issue_id: &str) -> Result<IssueDetails> {
        let details = self
            .client
            .get(format!("{}/getIssueDetails", self.base_url))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .query(&[
                ("issue_id", issue_id),
                ("sort_order", "ASC"),
                ("sort_by", "incident_id"),
                ("from", "0"),
                ("size", DETAIL_PAGE_SIZE),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(details)
    }
}

/// Connects poller integrations to [`DetectorSource`]s sharing one HTTP client.
pub struct DetectorConnector {
    client: Client,
}

impl DetectorConnector {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl IssueSourceConnector for DetectorConnector {
    fn connect(&self, poller: &Integration) -> Result<Arc<dyn IssueSource>> {
        let token = poller
            .credentials
            .require("bearer", "token")
            .map_err(|e| RemediationError::Configuration(format!("poller {}: {}", poller.name, e)))?;
        if poller.base_url.trim().is_empty() {
            return Err(RemediationError::Configuration(format!(
                "poller {} has no base URL",
                poller.name
            )));
        }
        Ok(Arc::new(DetectorSource::new(
            self.client.clone(),
            poller.base_url.clone(),
            token,
        )))
    }
}
