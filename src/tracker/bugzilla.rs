//! Bugzilla REST adapter.
//!
//! A stored filter is a Bugzilla search URL (or its bare query string). The
//! search parameters are replayed against `/rest/bug` to collect matching ids,
//! then details are fetched page by page for the configured fields.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BugId, BugRecord, FetchError, FieldValue, TrackerAdapter};
use crate::config::TrackerConfig;

/// Parameters never taken from a stored filter; the adapter sets them itself.
const RESERVED_PARAMS: &[&str] = &["include_fields", "api_key", "id"];

#[derive(Debug, Deserialize)]
struct BugsPayload {
    #[serde(default)]
    bugs: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    error: bool,
    message: Option<String>,
}

pub struct BugzillaTracker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
}

impl BugzillaTracker {
    pub fn new(config: &TrackerConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("bugtriage/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size.max(1),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/rest/bug", self.base_url)
    }

    async fn search(&self, filter: &str) -> Result<Vec<BugId>, FetchError> {
        let mut params = search_params(filter)?;
        params.push(("include_fields".to_string(), "id".to_string()));

        let bugs = self.get_bugs(&params).await?;
        Ok(bugs
            .iter()
            .filter_map(|b| b.get("id").and_then(|v| v.as_i64()))
            .collect())
    }

    async fn get_bugs(
        &self,
        params: &[(String, String)],
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, FetchError> {
        let mut request = self.client.get(self.endpoint()).query(params);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key)]);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<BugsPayload>(&text)
                .ok()
                .and_then(|p| p.message)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, excerpt(&text)));
            return Err(if is_transient_status(status) {
                FetchError::Transient(message)
            } else {
                FetchError::Permanent(message)
            });
        }

        let payload: BugsPayload = serde_json::from_str(&text).map_err(|e| {
            FetchError::Permanent(format!("undecodable tracker response: {}", e))
        })?;
        if payload.error {
            return Err(FetchError::Permanent(
                payload.message.unwrap_or_else(|| "tracker reported an error".to_string()),
            ));
        }
        Ok(payload.bugs)
    }
}

#[async_trait::async_trait]
impl TrackerAdapter for BugzillaTracker {
    async fn fetch(&self, filter: &str, fields: &[String]) -> Result<Vec<BugRecord>, FetchError> {
        let ids = self.search(filter).await?;
        debug!(matches = ids.len(), "tracker search complete");
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // No configured columns: let the tracker return its default field set.
        let include = (!fields.is_empty()).then(|| {
            let mut include = vec!["id".to_string()];
            include.extend(fields.iter().filter(|f| f.as_str() != "id").cloned());
            include.join(",")
        });

        let mut records = Vec::with_capacity(ids.len());
        for page in ids.chunks(self.page_size) {
            let id_list = page.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            let mut params = vec![("id".to_string(), id_list)];
            if let Some(include) = &include {
                params.push(("include_fields".to_string(), include.clone()));
            }

            match self.get_bugs(&params).await {
                Ok(bugs) => records.extend(bugs.iter().filter_map(|b| to_record(b, fields))),
                Err(e) if records.is_empty() => return Err(e),
                Err(e) => {
                    warn!(obtained = records.len(), total = ids.len(), error = %e, "detail fetch interrupted");
                    return Err(FetchError::Partial { records, source: Box::new(e) });
                }
            }
        }
        Ok(records)
    }

    async fn test_filter(&self, filter: &str) -> Result<Vec<BugId>, FetchError> {
        self.search(filter).await
    }
}

/// Extract the search parameters from a stored filter. Repeated keys are kept.
fn search_params(filter: &str) -> Result<Vec<(String, String)>, FetchError> {
    let filter = filter.trim();
    let url = Url::parse(filter)
        .or_else(|_| Url::parse(&format!("http://filter.invalid/?{}", filter.trim_start_matches('?'))))
        .map_err(|e| FetchError::Permanent(format!("unparseable filter: {}", e)))?;

    let params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if params.is_empty() {
        return Err(FetchError::Permanent(
            "no valid search parameters found in the query filter".to_string(),
        ));
    }
    Ok(params)
}

fn to_record(bug: &serde_json::Map<String, serde_json::Value>, fields: &[String]) -> Option<BugRecord> {
    let bug_id = bug.get("id")?.as_i64()?;
    let mut record = BugRecord::new(bug_id);

    if fields.is_empty() {
        for (name, value) in bug.iter().filter(|(k, _)| k.as_str() != "id") {
            record.fields.insert(name.clone(), FieldValue::from_json(value));
        }
    } else {
        for name in fields {
            if let Some(value) = bug.get(name) {
                record.fields.insert(name.clone(), FieldValue::from_json(value));
            }
        }
    }
    Some(record)
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_decode() || e.is_builder() {
        FetchError::Permanent(e.to_string())
    } else {
        FetchError::Transient(e.to_string())
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}
