//! Sync orchestration: stream opportunities from the source, dedup against
//! the existing-key index, create destination records, and report per-item
//! outcomes without letting one bad record abort the batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use samsync_core::{
    set_aside_description, DateRange, Destination, FailureRecord, FailureStage, FilterSet,
    ItemRef, Opportunity, OpportunitySource, PointOfContact, RecordFields, RunStatus,
    RunSummary, SyncError,
};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "samsync-engine";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Records requested per source page.
    pub page_size: u64,
    /// Upper bound on pages fetched in one run.
    pub max_pages: u64,
    pub include_attachments: bool,
    /// Concurrent attachment downloads for an already-created record.
    pub attachment_concurrency: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 50,
            include_attachments: true,
            attachment_concurrency: 3,
        }
    }
}

/// Run-level cancellation signal, checked between items and before
/// attachment tasks. Cancelling yields a partial summary, not an error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Split `fullParentPathName` into department / subtier / office.
fn split_parent_path(path: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut parts = path.split('.').map(|part| part.to_string());
    (parts.next(), parts.next(), parts.next())
}

/// Date-only values get a midnight UTC time component; anything already
/// carrying a time is passed through untouched.
fn normalize_date(raw: &str) -> String {
    if raw.contains('T') {
        raw.to_string()
    } else {
        format!("{raw}T00:00:00Z")
    }
}

fn primary_contact(contacts: &[PointOfContact]) -> Option<&PointOfContact> {
    contacts
        .iter()
        .find(|contact| contact.contact_type.as_deref() == Some("primary"))
        .or_else(|| contacts.first())
}

fn amount_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn location_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

pub fn attachment_filename(notice_id: &str, index: usize) -> String {
    format!("{notice_id}_attachment_{index}.pdf")
}

/// Map a fetched opportunity to the destination payload. Only a missing
/// notice identifier is an error; every other absent field is omitted.
pub fn map_record(opportunity: &Opportunity) -> Result<RecordFields, SyncError> {
    let notice_id = opportunity
        .notice_id
        .clone()
        .ok_or(SyncError::MappingError)?;

    let (department, subtier, office) = match &opportunity.full_parent_path_name {
        Some(path) => split_parent_path(path),
        None => (None, None, None),
    };

    let set_aside_code = opportunity.type_of_set_aside.clone();
    let set_aside_desc = set_aside_code.as_deref().map(|code| {
        set_aside_description(code)
            .map(str::to_string)
            .unwrap_or_else(|| code.to_string())
    });

    let contact = opportunity
        .point_of_contact
        .as_deref()
        .and_then(primary_contact);
    let pop = opportunity.place_of_performance.as_ref();
    let award = opportunity.award.as_ref();
    let awardee = award.and_then(|award| award.awardee.as_ref());

    Ok(RecordFields {
        notice_id,
        title: opportunity.title.clone(),
        solicitation_number: opportunity.solicitation_number.clone(),
        department,
        subtier,
        office,
        full_parent_path: opportunity.full_parent_path_name.clone(),
        full_parent_code: opportunity.full_parent_path_code.clone(),
        posted_date: opportunity.posted_date.as_deref().map(normalize_date),
        response_deadline: opportunity.response_deadline.as_deref().map(normalize_date),
        notice_type: opportunity.notice_type.clone(),
        base_type: opportunity.base_type.clone(),
        set_aside_code,
        set_aside_description: set_aside_desc,
        naics_code: opportunity.naics_code.clone(),
        classification_code: opportunity.classification_code.clone(),
        active: opportunity.active.clone(),
        organization_type: opportunity.organization_type.clone(),
        additional_info_link: opportunity.additional_info_link.clone(),
        ui_link: opportunity.ui_link.clone(),
        description_link: opportunity.description_link.clone(),
        poc_name: contact.and_then(|c| c.full_name.clone()),
        poc_email: contact.and_then(|c| c.email.clone()),
        poc_phone: contact.and_then(|c| c.phone.clone()),
        poc_title: contact.and_then(|c| c.title.clone()),
        pop_city: pop
            .and_then(|p| p.city.as_ref())
            .and_then(|place| place.name())
            .map(str::to_string),
        pop_state: pop
            .and_then(|p| p.state.as_ref())
            .and_then(|place| place.name())
            .map(str::to_string),
        pop_country: pop
            .and_then(|p| p.country.as_ref())
            .and_then(|place| place.name())
            .map(str::to_string),
        award_number: award.and_then(|a| a.number.clone()),
        award_amount: award.and_then(|a| a.amount.as_ref()).map(amount_to_string),
        award_date: award
            .and_then(|a| a.date.as_deref())
            .map(normalize_date),
        awardee_name: awardee.and_then(|a| a.name.clone()),
        awardee_location: awardee
            .and_then(|a| a.location.as_ref())
            .and_then(location_to_string),
    })
}

#[derive(Default)]
struct RunTally {
    created: usize,
    skipped: usize,
    failed: usize,
    failures: Vec<FailureRecord>,
    attachments_added: usize,
    attachments_failed: usize,
}

impl RunTally {
    fn record_failure(&mut self, notice_id: Option<String>, stage: FailureStage, reason: String) {
        self.failed += 1;
        self.failures.push(FailureRecord {
            notice_id,
            stage,
            reason,
        });
    }
}

pub struct SyncEngine {
    source: Arc<dyn OpportunitySource>,
    destination: Arc<dyn Destination>,
    options: EngineOptions,
    cancel: CancelToken,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        destination: Arc<dyn Destination>,
        options: EngineOptions,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one sync pass. The only fatal outcome is a failed index load;
    /// every other error is recorded in the summary and the pass continues.
    pub async fn run(
        &self,
        window: &DateRange,
        filters: &FilterSet,
    ) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, from = %window.posted_from(), to = %window.posted_to(), "starting sync run");

        // Dedup cannot proceed safely without the index; creating blind
        // would risk duplicates, so this failure aborts before any write.
        let mut index = self.destination.load_existing_ids().await?;

        let mut tally = RunTally::default();
        let semaphore = Arc::new(Semaphore::new(self.options.attachment_concurrency.max(1)));
        let mut pages_fetched = 0usize;
        let mut source_truncated = false;
        let mut fetch_failed = false;
        let mut cancelled = false;
        let mut offset = 0u64;

        'run: loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let page = match self
                .source
                .fetch_page(window, filters, offset, self.options.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, offset, "page fetch failed; processing pages already fetched");
                    fetch_failed = true;
                    tally.failures.push(FailureRecord {
                        notice_id: None,
                        stage: FailureStage::Fetch,
                        reason: err.to_string(),
                    });
                    break;
                }
            };
            pages_fetched += 1;

            // Records the source had to drop still show up in the summary.
            for _ in 0..page.dropped {
                tally.record_failure(
                    None,
                    FailureStage::Mapping,
                    SyncError::MappingError.to_string(),
                );
            }

            let batch_len = page.opportunities.len();
            for opportunity in page.opportunities {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'run;
                }
                self.process_item(opportunity, &mut index, &mut tally, &semaphore)
                    .await;
            }

            offset += self.options.page_size;
            // A page can survive with zero records when every raw record
            // was dropped as malformed; only an empty raw page ends the
            // pagination.
            if batch_len + page.dropped == 0 || offset >= page.total_records {
                break;
            }
            if pages_fetched as u64 >= self.options.max_pages {
                info!(pages_fetched, "stopping at configured page limit");
                source_truncated = true;
                break;
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if fetch_failed {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            created: tally.created,
            skipped: tally.skipped,
            failed: tally.failed,
            failures: tally.failures,
            pages_fetched,
            source_truncated: source_truncated || fetch_failed,
            attachments_added: tally.attachments_added,
            attachments_failed: tally.attachments_failed,
        };
        info!(
            created = summary.created,
            skipped = summary.skipped,
            failed = summary.failed,
            status = ?summary.status,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn process_item(
        &self,
        opportunity: Opportunity,
        index: &mut HashSet<String>,
        tally: &mut RunTally,
        semaphore: &Arc<Semaphore>,
    ) {
        let Some(notice_id) = opportunity.notice_id.clone() else {
            tally.record_failure(
                None,
                FailureStage::Mapping,
                SyncError::MappingError.to_string(),
            );
            return;
        };

        if index.contains(&notice_id) {
            debug!(%notice_id, "skipping existing record");
            tally.skipped += 1;
            return;
        }

        let fields = match map_record(&opportunity) {
            Ok(fields) => fields,
            Err(err) => {
                tally.record_failure(Some(notice_id), FailureStage::Mapping, err.to_string());
                return;
            }
        };

        match self.destination.create_record(&fields).await {
            Ok(item) => {
                // Inserting now makes a later duplicate of the same id in
                // this batch land on the Skipped path.
                index.insert(notice_id.clone());
                tally.created += 1;
                info!(%notice_id, item_id = %item.item_id, "created destination record");

                let links = opportunity.resource_links();
                if self.options.include_attachments && !links.is_empty() {
                    self.attach_resources(&notice_id, &item, links, tally, semaphore)
                        .await;
                }
            }
            Err(err) => {
                warn!(%notice_id, %err, "create failed; continuing with remaining items");
                tally.record_failure(Some(notice_id), FailureStage::Create, err.to_string());
            }
        }
    }

    /// Download and attach resources for a just-created record. Failures
    /// here are reported but never demote the parent's Created outcome.
    async fn attach_resources(
        &self,
        notice_id: &str,
        item: &ItemRef,
        links: &[String],
        tally: &mut RunTally,
        semaphore: &Arc<Semaphore>,
    ) {
        let mut tasks: JoinSet<Result<String, (String, String)>> = JoinSet::new();

        for (position, link) in links.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            let source = Arc::clone(&self.source);
            let destination = Arc::clone(&self.destination);
            let item = item.clone();
            let link = link.clone();
            let filename = attachment_filename(notice_id, position + 1);

            tasks.spawn(async move {
                let _permit = permit;
                let bytes = source
                    .download_resource(&link)
                    .await
                    .map_err(|err| (filename.clone(), err.to_string()))?;
                destination
                    .add_attachment(&item, &filename, &bytes)
                    .await
                    .map_err(|err| (filename.clone(), err.to_string()))?;
                Ok(filename)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(filename)) => {
                    debug!(%filename, "attachment added");
                    tally.attachments_added += 1;
                }
                Ok(Err((filename, reason))) => {
                    warn!(%filename, %reason, "attachment failed; record stays created");
                    tally.attachments_failed += 1;
                    tally.failures.push(FailureRecord {
                        notice_id: Some(notice_id.to_string()),
                        stage: FailureStage::Attachment,
                        reason: format!("{filename}: {reason}"),
                    });
                }
                Err(join_err) => {
                    tally.attachments_failed += 1;
                    tally.failures.push(FailureRecord {
                        notice_id: Some(notice_id.to_string()),
                        stage: FailureStage::Attachment,
                        reason: join_err.to_string(),
                    });
                }
            }
        }
    }
}
