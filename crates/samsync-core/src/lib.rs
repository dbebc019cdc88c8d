//! Core domain model and trait seams for the SAM.gov to SharePoint sync.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "samsync-core";

/// Posted-date window a sync run covers, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Window ending today (UTC) and reaching `days` back.
    pub fn days_back(days: u32) -> Self {
        let to = Utc::now().date_naive();
        let from = to - Duration::days(i64::from(days));
        Self { from, to }
    }

    /// SAM.gov expects MM/DD/YYYY for postedFrom/postedTo.
    pub fn posted_from(&self) -> String {
        self.from.format("%m/%d/%Y").to_string()
    }

    pub fn posted_to(&self) -> String {
        self.to.format("%m/%d/%Y").to_string()
    }
}

/// Optional search facets forwarded to the source query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub department: Option<String>,
    pub naics_code: Option<String>,
}

/// One point of contact as delivered by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PointOfContact {
    #[serde(rename = "type")]
    pub contact_type: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
}

/// The source sometimes delivers place components as `{ "name": ... }`
/// objects and sometimes as bare strings. A bare string parses without
/// failing the record but carries no usable name; only the object form
/// contributes a place value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaceName {
    Named {
        #[serde(default)]
        name: Option<String>,
    },
    Raw(String),
}

impl PlaceName {
    pub fn name(&self) -> Option<&str> {
        match self {
            PlaceName::Named { name } => name.as_deref(),
            PlaceName::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceOfPerformance {
    pub city: Option<PlaceName>,
    pub state: Option<PlaceName>,
    pub country: Option<PlaceName>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Awardee {
    pub name: Option<String>,
    pub location: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Award {
    pub number: Option<String>,
    pub amount: Option<serde_json::Value>,
    pub date: Option<String>,
    pub awardee: Option<Awardee>,
}

/// A contract-notice record as fetched from the source search API.
///
/// Every field is optional on the wire; only a missing notice identifier
/// disqualifies a record. Immutable snapshot from the sync's perspective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Opportunity {
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub solicitation_number: Option<String>,
    pub full_parent_path_name: Option<String>,
    pub full_parent_path_code: Option<String>,
    pub posted_date: Option<String>,
    // The source spells this with a capital L.
    #[serde(rename = "responseDeadLine")]
    pub response_deadline: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub base_type: Option<String>,
    pub type_of_set_aside: Option<String>,
    pub naics_code: Option<String>,
    pub classification_code: Option<String>,
    pub active: Option<String>,
    pub organization_type: Option<String>,
    pub additional_info_link: Option<String>,
    pub ui_link: Option<String>,
    #[serde(rename = "description")]
    pub description_link: Option<String>,
    pub point_of_contact: Option<Vec<PointOfContact>>,
    pub place_of_performance: Option<PlaceOfPerformance>,
    pub award: Option<Award>,
    pub resource_links: Option<Vec<String>>,
}

impl Opportunity {
    pub fn resource_links(&self) -> &[String] {
        self.resource_links.as_deref().unwrap_or_default()
    }
}

/// Mapped destination payload; optional fields are omitted when absent
/// rather than written as nulls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    #[serde(rename = "NoticeId")]
    pub notice_id: String,
    #[serde(rename = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "SolicitationNumber", skip_serializing_if = "Option::is_none")]
    pub solicitation_number: Option<String>,
    #[serde(rename = "Department", skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(rename = "Subtier", skip_serializing_if = "Option::is_none")]
    pub subtier: Option<String>,
    #[serde(rename = "Office", skip_serializing_if = "Option::is_none")]
    pub office: Option<String>,
    #[serde(rename = "FullParentPath", skip_serializing_if = "Option::is_none")]
    pub full_parent_path: Option<String>,
    #[serde(rename = "FullParentCode", skip_serializing_if = "Option::is_none")]
    pub full_parent_code: Option<String>,
    #[serde(rename = "PostedDate", skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    #[serde(rename = "ResponseDeadline", skip_serializing_if = "Option::is_none")]
    pub response_deadline: Option<String>,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub notice_type: Option<String>,
    #[serde(rename = "BaseType", skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    #[serde(rename = "SetAsideCode", skip_serializing_if = "Option::is_none")]
    pub set_aside_code: Option<String>,
    #[serde(rename = "SetAsideDescription", skip_serializing_if = "Option::is_none")]
    pub set_aside_description: Option<String>,
    #[serde(rename = "NAICSCode", skip_serializing_if = "Option::is_none")]
    pub naics_code: Option<String>,
    #[serde(rename = "ClassificationCode", skip_serializing_if = "Option::is_none")]
    pub classification_code: Option<String>,
    #[serde(rename = "Active", skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(rename = "OrganizationType", skip_serializing_if = "Option::is_none")]
    pub organization_type: Option<String>,
    #[serde(rename = "AdditionalInfoLink", skip_serializing_if = "Option::is_none")]
    pub additional_info_link: Option<String>,
    #[serde(rename = "UILink", skip_serializing_if = "Option::is_none")]
    pub ui_link: Option<String>,
    #[serde(rename = "DescriptionLink", skip_serializing_if = "Option::is_none")]
    pub description_link: Option<String>,
    #[serde(rename = "POC_Name", skip_serializing_if = "Option::is_none")]
    pub poc_name: Option<String>,
    #[serde(rename = "POC_Email", skip_serializing_if = "Option::is_none")]
    pub poc_email: Option<String>,
    #[serde(rename = "POC_Phone", skip_serializing_if = "Option::is_none")]
    pub poc_phone: Option<String>,
    #[serde(rename = "POC_Title", skip_serializing_if = "Option::is_none")]
    pub poc_title: Option<String>,
    #[serde(rename = "PoP_City", skip_serializing_if = "Option::is_none")]
    pub pop_city: Option<String>,
    #[serde(rename = "PoP_State", skip_serializing_if = "Option::is_none")]
    pub pop_state: Option<String>,
    #[serde(rename = "PoP_Country", skip_serializing_if = "Option::is_none")]
    pub pop_country: Option<String>,
    #[serde(rename = "AwardNumber", skip_serializing_if = "Option::is_none")]
    pub award_number: Option<String>,
    #[serde(rename = "AwardAmount", skip_serializing_if = "Option::is_none")]
    pub award_amount: Option<String>,
    #[serde(rename = "AwardDate", skip_serializing_if = "Option::is_none")]
    pub award_date: Option<String>,
    #[serde(rename = "AwardeeName", skip_serializing_if = "Option::is_none")]
    pub awardee_name: Option<String>,
    #[serde(rename = "AwardeeLocation", skip_serializing_if = "Option::is_none")]
    pub awardee_location: Option<String>,
}

/// FAR set-aside code descriptions applied during field mapping.
pub fn set_aside_description(code: &str) -> Option<&'static str> {
    let description = match code {
        "SBA" => "Total Small Business Set-Aside (FAR 19.5)",
        "SBP" => "Partial Small Business Set-Aside (FAR 19.5)",
        "8A" => "8(a) Set-Aside (FAR 19.8)",
        "8AN" => "8(a) Sole Source (FAR 19.8)",
        "HZC" => "Historically Underutilized Business (HUBZone) Set-Aside (FAR 19.13)",
        "HZS" => "Historically Underutilized Business (HUBZone) Sole Source (FAR 19.13)",
        "SDVOSBC" => {
            "Service-Disabled Veteran-Owned Small Business (SDVOSB) Set-Aside (FAR 19.14)"
        }
        "SDVOSBS" => {
            "Service-Disabled Veteran-Owned Small Business (SDVOSB) Sole Source (FAR 19.14)"
        }
        "WOSB" => "Women-Owned Small Business (WOSB) Program Set-Aside (FAR 19.15)",
        "WOSBSS" => "Women-Owned Small Business (WOSB) Program Sole Source (FAR 19.15)",
        "EDWOSB" => "Economically Disadvantaged WOSB (EDWOSB) Program Set-Aside (FAR 19.15)",
        "EDWOSBSS" => "Economically Disadvantaged WOSB (EDWOSB) Program Sole Source (FAR 19.15)",
        "LAS" => "Local Area Set-Aside (FAR 26.2)",
        "IEE" => "Indian Economic Enterprise (IEE) Set-Aside",
        "ISBEE" => "Indian Small Business Economic Enterprise (ISBEE) Set-Aside",
        "BICiv" => "Buy Indian Set-Aside",
        "VSA" => "Veteran-Owned Small Business Set-Aside",
        "VSS" => "Veteran-Owned Small Business Sole source",
        _ => return None,
    };
    Some(description)
}

/// Sync error taxonomy. Only `IndexLoadFailed` aborts a run; everything
/// else is recorded per item or per page and the run continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("existing-key index load failed: {reason}")]
    IndexLoadFailed { reason: String },
    #[error("record is missing a notice identifier")]
    MappingError,
    #[error("create failed for {notice_id}: {reason}")]
    CreateFailed { notice_id: String, reason: String },
    #[error("attachment {filename} failed: {reason}")]
    AttachmentFailed { filename: String, reason: String },
}

impl SyncError {
    pub fn source_unavailable(reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn index_load(reason: impl Into<String>) -> Self {
        Self::IndexLoadFailed {
            reason: reason.into(),
        }
    }

    pub fn create_failed(notice_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CreateFailed {
            notice_id: notice_id.into(),
            reason: reason.into(),
        }
    }

    pub fn attachment_failed(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AttachmentFailed {
            filename: filename.into(),
            reason: reason.into(),
        }
    }
}

/// Which stage of the pipeline a recorded failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    Fetch,
    Mapping,
    Create,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub notice_id: Option<String>,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Partial,
    Cancelled,
}

/// Per-run report consumed by the caller and the logging layer.
///
/// `failed` counts item-level failures; attachment failures are listed in
/// `failures` with [`FailureStage::Attachment`] but tallied separately so
/// they never demote a parent record's Created outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailureRecord>,
    pub pages_fetched: usize,
    pub source_truncated: bool,
    pub attachments_added: usize,
    pub attachments_failed: usize,
}

/// One page of search results, already stripped of malformed records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityPage {
    pub opportunities: Vec<Opportunity>,
    pub total_records: u64,
    /// Records dropped at parse time for lacking a notice identifier.
    pub dropped: usize,
}

/// Paginated search over the external procurement source.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn fetch_page(
        &self,
        window: &DateRange,
        filters: &FilterSet,
        offset: u64,
        limit: u64,
    ) -> Result<OpportunityPage, SyncError>;

    /// Fetch one downloadable resource (attachment bytes) by link.
    async fn download_resource(&self, url: &str) -> Result<Vec<u8>, SyncError>;
}

/// Reference to a created destination row, used for attachment adds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub item_id: String,
}

/// Destination list operations. Create-or-skip only; never update or delete.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn load_existing_ids(&self) -> Result<HashSet<String>, SyncError>;

    async fn create_record(&self, fields: &RecordFields) -> Result<ItemRef, SyncError>;

    async fn add_attachment(
        &self,
        item: &ItemRef,
        filename: &str,
        content: &[u8],
    ) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_formats_for_source_query() {
        let window = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
        );
        assert_eq!(window.posted_from(), "01/05/2026");
        assert_eq!(window.posted_to(), "02/01/2026");
    }

    #[test]
    fn opportunity_parses_wire_shape() {
        let raw = serde_json::json!({
            "noticeId": "abc123",
            "title": "Embassy Roof Repair",
            "responseDeadLine": "2026-01-26T16:00:00-05:00",
            "type": "Solicitation",
            "baseType": "Solicitation",
            "fullParentPathName": "STATE, DEPARTMENT OF.STATE, DEPARTMENT OF.US EMBASSY BOGOTA",
            "placeOfPerformance": {
                "city": {"name": "Bogota"},
                "country": "COLOMBIA"
            },
            "pointOfContact": [
                {"type": "primary", "fullName": "Jane Roe", "email": "jane@example.gov"}
            ],
            "resourceLinks": ["https://example.gov/files/1"]
        });
        let opp: Opportunity = serde_json::from_value(raw).expect("wire shape");
        assert_eq!(opp.notice_id.as_deref(), Some("abc123"));
        assert_eq!(
            opp.response_deadline.as_deref(),
            Some("2026-01-26T16:00:00-05:00")
        );
        assert_eq!(opp.notice_type.as_deref(), Some("Solicitation"));
        let pop = opp.place_of_performance.as_ref().unwrap();
        assert_eq!(pop.city.as_ref().unwrap().name(), Some("Bogota"));
        // A bare-string component parses but yields no place value.
        assert_eq!(pop.country.as_ref().unwrap().name(), None);
        assert_eq!(opp.resource_links().len(), 1);
    }

    #[test]
    fn record_fields_omit_absent_values() {
        let fields = RecordFields {
            notice_id: "n-1".into(),
            title: Some("Test".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&fields).expect("serialize");
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["NoticeId"], "n-1");
        assert_eq!(object["Title"], "Test");
        assert!(!object.contains_key("AwardNumber"));
    }

    #[test]
    fn set_aside_lookup_covers_known_and_unknown_codes() {
        assert_eq!(
            set_aside_description("SBA"),
            Some("Total Small Business Set-Aside (FAR 19.5)")
        );
        assert_eq!(set_aside_description("NOPE"), None);
    }
}
