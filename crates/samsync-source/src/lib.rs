//! SAM.gov opportunity search client.

use async_trait::async_trait;
use samsync_core::{
    DateRange, FilterSet, Opportunity, OpportunityPage, OpportunitySource, SyncError,
};
use samsync_http::HttpClient;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "samsync-source";

pub const DEFAULT_BASE_URL: &str = "https://api.sam.gov/opportunities/v2/search";

#[derive(Debug, Clone)]
pub struct SamConfig {
    pub api_key: String,
    pub base_url: String,
}

impl SamConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Raw search response envelope. Individual records are deserialized one at
/// a time so a single malformed record cannot sink the page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SearchResponse {
    total_records: u64,
    opportunities_data: Vec<JsonValue>,
}

pub struct SamClient {
    config: SamConfig,
    http: HttpClient,
}

impl SamClient {
    pub fn new(config: SamConfig, http: HttpClient) -> Self {
        Self { config, http }
    }

    fn search_query(
        &self,
        window: &DateRange,
        filters: &FilterSet,
        offset: u64,
        limit: u64,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("api_key", self.config.api_key.clone()),
            ("postedFrom", window.posted_from()),
            ("postedTo", window.posted_to()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(department) = &filters.department {
            query.push(("deptname", department.clone()));
        }
        if let Some(naics) = &filters.naics_code {
            query.push(("ncode", naics.clone()));
        }
        query
    }

    /// Resource downloads authenticate via an api_key query parameter.
    fn resource_url_with_key(&self, url: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}api_key={}", self.config.api_key)
    }
}

/// Decode one page worth of records, dropping any that are malformed or
/// lack a notice identifier.
fn decode_page(response: SearchResponse) -> OpportunityPage {
    let mut opportunities = Vec::with_capacity(response.opportunities_data.len());
    let mut dropped = 0usize;

    for raw in response.opportunities_data {
        match serde_json::from_value::<Opportunity>(raw) {
            Ok(opportunity) if opportunity.notice_id.is_some() => {
                opportunities.push(opportunity);
            }
            Ok(opportunity) => {
                warn!(title = ?opportunity.title, "dropping record without notice identifier");
                dropped += 1;
            }
            Err(err) => {
                warn!(%err, "dropping malformed opportunity record");
                dropped += 1;
            }
        }
    }

    OpportunityPage {
        opportunities,
        total_records: response.total_records,
        dropped,
    }
}

#[async_trait]
impl OpportunitySource for SamClient {
    async fn fetch_page(
        &self,
        window: &DateRange,
        filters: &FilterSet,
        offset: u64,
        limit: u64,
    ) -> Result<OpportunityPage, SyncError> {
        let query = self.search_query(window, filters, offset, limit);
        info!(offset, limit, "fetching opportunity page");

        let response: SearchResponse = self
            .http
            .get_json(&self.config.base_url, &query, None)
            .await
            .map_err(|err| SyncError::source_unavailable(err.to_string()))?;

        let page = decode_page(response);
        info!(
            fetched = page.opportunities.len(),
            dropped = page.dropped,
            total = page.total_records,
            "opportunity page decoded"
        );
        Ok(page)
    }

    async fn download_resource(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        let url = self.resource_url_with_key(url);
        self.http
            .get_bytes(&url, None)
            .await
            .map_err(|err| SyncError::source_unavailable(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use samsync_http::HttpClientConfig;

    fn client() -> SamClient {
        SamClient::new(
            SamConfig::new("test-key"),
            HttpClient::new(HttpClientConfig::default()).expect("http client"),
        )
    }

    #[test]
    fn search_query_carries_window_and_facets() {
        let client = client();
        let window = DateRange::new(
            chrono_date(2026, 1, 1),
            chrono_date(2026, 1, 31),
        );
        let filters = FilterSet {
            department: Some("STATE, DEPARTMENT OF".to_string()),
            naics_code: Some("561210".to_string()),
        };

        let query = client.search_query(&window, &filters, 100, 50);
        assert!(query.contains(&("api_key", "test-key".to_string())));
        assert!(query.contains(&("postedFrom", "01/01/2026".to_string())));
        assert!(query.contains(&("postedTo", "01/31/2026".to_string())));
        assert!(query.contains(&("limit", "50".to_string())));
        assert!(query.contains(&("offset", "100".to_string())));
        assert!(query.contains(&("deptname", "STATE, DEPARTMENT OF".to_string())));
        assert!(query.contains(&("ncode", "561210".to_string())));
    }

    #[test]
    fn facets_are_omitted_when_unset() {
        let client = client();
        let window = DateRange::new(chrono_date(2026, 1, 1), chrono_date(2026, 1, 2));
        let query = client.search_query(&window, &FilterSet::default(), 0, 100);
        assert_eq!(query.len(), 5);
    }

    #[test]
    fn resource_url_appends_api_key() {
        let client = client();
        assert_eq!(
            client.resource_url_with_key("https://sam.gov/api/file/1"),
            "https://sam.gov/api/file/1?api_key=test-key"
        );
        assert_eq!(
            client.resource_url_with_key("https://sam.gov/api/file/1?download=true"),
            "https://sam.gov/api/file/1?download=true&api_key=test-key"
        );
    }

    #[test]
    fn decode_page_drops_records_without_notice_id() {
        let response: SearchResponse = serde_json::from_value(serde_json::json!({
            "totalRecords": 3,
            "opportunitiesData": [
                {"noticeId": "a-1", "title": "First"},
                {"title": "No identifier"},
                {"noticeId": "a-2", "title": "Second"}
            ]
        }))
        .expect("envelope");

        let page = decode_page(response);
        assert_eq!(page.total_records, 3);
        assert_eq!(page.dropped, 1);
        let ids: Vec<_> = page
            .opportunities
            .iter()
            .map(|o| o.notice_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a-1", "a-2"]);
    }

    #[test]
    fn decode_page_drops_structurally_malformed_records() {
        let response: SearchResponse = serde_json::from_value(serde_json::json!({
            "totalRecords": 2,
            "opportunitiesData": [
                {"noticeId": "a-1", "pointOfContact": "not-a-list"},
                {"noticeId": "a-2"}
            ]
        }))
        .expect("envelope");

        let page = decode_page(response);
        assert_eq!(page.dropped, 1);
        assert_eq!(page.opportunities.len(), 1);
        assert_eq!(page.opportunities[0].notice_id.as_deref(), Some("a-2"));
    }

    fn chrono_date(y: i32, m: u32, d: u32) -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }
}
