//! Data Access
//!
//! Loads proposal and follow-up records from delimited files or the CRM API.
//! Bad rows are skipped and reported; an unreadable source is an error.

pub mod crm;
pub mod store;
pub mod tabular;

pub use crm::CrmClient;
pub use store::RecordStore;

use crate::error::AssistantError;
use crate::models::{FollowUpRecord, ProposalRecord, ProposalStatus, RecordSet};
use crate::Result;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Where records come from
pub enum DataSource {
    Files {
        proposals: PathBuf,
        follow_ups: PathBuf,
        delimiter: u8,
    },
    Crm(CrmClient),
}

impl DataSource {
    pub fn describe(&self) -> String {
        match self {
            DataSource::Files {
                proposals,
                follow_ups,
                ..
            } => format!("files ({}, {})", proposals.display(), follow_ups.display()),
            DataSource::Crm(client) => format!("crm ({})", client.base_url()),
        }
    }
}

/// A row that was skipped during loading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRow {
    pub source: String,
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub proposals_loaded: usize,
    pub follow_ups_loaded: usize,
    pub malformed: Vec<SkippedRow>,
}

impl LoadReport {
    pub fn malformed_count(&self) -> usize {
        self.malformed.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub records: RecordSet,
    pub report: LoadReport,
}

/// Load every record from `source`.
///
/// Fails with `SourceUnavailable` when the source cannot be read at all.
pub async fn load_records(source: &DataSource) -> Result<LoadOutcome> {
    info!("Loading records from {}", source.describe());

    let (proposal_rows, follow_up_rows, source_names) = match source {
        DataSource::Files {
            proposals,
            follow_ups,
            delimiter,
        } => {
            let proposal_rows = tabular::read_file::<RawProposal>(proposals, *delimiter).await?;
            let follow_up_rows = tabular::read_file::<RawFollowUp>(follow_ups, *delimiter).await?;
            (
                proposal_rows,
                follow_up_rows,
                (proposals.display().to_string(), follow_ups.display().to_string()),
            )
        }
        DataSource::Crm(client) => {
            let (proposal_rows, follow_up_rows) = client.fetch_rows().await?;
            (
                proposal_rows,
                follow_up_rows,
                ("crm:Deals".to_string(), "crm:Tasks".to_string()),
            )
        }
    };

    let mut report = LoadReport::default();
    let proposals = collect_valid(proposal_rows, &source_names.0, &mut report, |row, raw| {
        raw.into_record(row)
    });
    let follow_ups = collect_valid(follow_up_rows, &source_names.1, &mut report, |row, raw| {
        raw.into_record(row)
    });

    report.proposals_loaded = proposals.len();
    report.follow_ups_loaded = follow_ups.len();

    info!(
        proposals = report.proposals_loaded,
        follow_ups = report.follow_ups_loaded,
        malformed = report.malformed_count(),
        "Records loaded"
    );

    Ok(LoadOutcome {
        records: RecordSet::new(proposals, follow_ups),
        report,
    })
}

/// Something that carries a record id, for duplicate detection
trait Keyed {
    fn id(&self) -> &str;
}

impl Keyed for ProposalRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Keyed for FollowUpRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

fn collect_valid<R, T, F>(
    rows: Vec<RawRow<R>>,
    source: &str,
    report: &mut LoadReport,
    convert: F,
) -> Vec<T>
where
    T: Keyed,
    F: Fn(usize, R) -> Result<T>,
{
    let mut seen_ids = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());

    for RawRow { row, parsed } in rows {
        let result = parsed.and_then(|raw| convert(row, raw)).and_then(|record| {
            if seen_ids.insert(record.id().to_string()) {
                Ok(record)
            } else {
                Err(AssistantError::MalformedRecord {
                    row,
                    reason: format!("duplicate id '{}'", record.id()),
                })
            }
        });

        match result {
            Ok(record) => records.push(record),
            Err(AssistantError::MalformedRecord { row, reason }) => {
                warn!(source, row, reason = %reason, "Skipping malformed record");
                report.malformed.push(SkippedRow {
                    source: source.to_string(),
                    row,
                    reason,
                });
            }
            Err(other) => {
                warn!(source, row, "Skipping unreadable record: {}", other);
                report.malformed.push(SkippedRow {
                    source: source.to_string(),
                    row,
                    reason: other.to_string(),
                });
            }
        }
    }

    records
}

/// A row as read from a source, before validation
#[derive(Debug)]
pub struct RawRow<R> {
    /// 1-based line number (files) or position (CRM)
    pub row: usize,
    pub parsed: Result<R>,
}

//
// ================= Raw rows =================
//

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawProposal {
    #[serde(alias = "ID", alias = "Id", alias = "Deal ID", alias = "record_id")]
    pub id: Option<String>,
    #[serde(alias = "Client", alias = "client_name", alias = "Client Name", alias = "Account Name")]
    pub client: Option<String>,
    #[serde(alias = "Status", alias = "Stage", alias = "stage")]
    pub status: Option<String>,
    #[serde(alias = "Owner", alias = "Deal Owner", alias = "owner_name")]
    pub owner: Option<String>,
    #[serde(alias = "Title", alias = "Deal Name", alias = "proposal")]
    pub title: Option<String>,
    #[serde(alias = "created", alias = "Created", alias = "created_date", alias = "Created Time")]
    pub created_on: Option<String>,
    #[serde(alias = "sent", alias = "Sent", alias = "sent_date")]
    pub sent_on: Option<String>,
    #[serde(alias = "decision", alias = "decision_date", alias = "Closing Date", alias = "closing_date")]
    pub decision_on: Option<String>,
    #[serde(alias = "Amount", alias = "value")]
    pub amount: Option<String>,
}

impl RawProposal {
    pub fn into_record(self, row: usize) -> Result<ProposalRecord> {
        let client = required(self.client, "client", row)?;
        let status_text = required(self.status, "status", row)?;
        let status: ProposalStatus = status_text
            .parse()
            .map_err(|reason| AssistantError::MalformedRecord { row, reason })?;
        let owner = required(self.owner, "owner", row)?;

        Ok(ProposalRecord {
            id: non_blank(self.id).unwrap_or_else(|| format!("P-{}", row)),
            client,
            status,
            owner,
            title: non_blank(self.title),
            created_on: optional_date(self.created_on, "created", row)?,
            sent_on: optional_date(self.sent_on, "sent", row)?,
            decision_on: optional_date(self.decision_on, "decision", row)?,
            amount: optional_amount(self.amount, row)?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFollowUp {
    #[serde(alias = "ID", alias = "Id", alias = "Task ID", alias = "record_id")]
    pub id: Option<String>,
    #[serde(alias = "Client", alias = "client_name", alias = "Client Name", alias = "Related To")]
    pub client: Option<String>,
    #[serde(alias = "Last Contact", alias = "last_contact_date", alias = "last_contacted")]
    pub last_contact: Option<String>,
    #[serde(alias = "Next Action", alias = "next_step", alias = "Task Subject")]
    pub next_action: Option<String>,
    #[serde(alias = "Owner", alias = "Task Owner", alias = "owner_name")]
    pub owner: Option<String>,
    #[serde(alias = "due", alias = "Due Date", alias = "due_date")]
    pub due_on: Option<String>,
}

impl RawFollowUp {
    pub fn into_record(self, row: usize) -> Result<FollowUpRecord> {
        let client = required(self.client, "client", row)?;
        let last_contact_text = required(self.last_contact, "last_contact", row)?;
        let last_contact = parse_date(&last_contact_text).ok_or_else(|| {
            AssistantError::MalformedRecord {
                row,
                reason: format!("invalid last_contact date '{}'", last_contact_text),
            }
        })?;

        Ok(FollowUpRecord {
            id: non_blank(self.id).unwrap_or_else(|| format!("F-{}", row)),
            client,
            last_contact,
            next_action: required(self.next_action, "next_action", row)?,
            owner: required(self.owner, "owner", row)?,
            due_on: optional_date(self.due_on, "due", row)?,
        })
    }
}

//
// ================= Field helpers =================
//

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str, row: usize) -> Result<String> {
    non_blank(value).ok_or_else(|| AssistantError::MalformedRecord {
        row,
        reason: format!("missing required field '{}'", field),
    })
}

fn optional_date(value: Option<String>, field: &str, row: usize) -> Result<Option<NaiveDate>> {
    match non_blank(value) {
        None => Ok(None),
        Some(text) => parse_date(&text)
            .map(Some)
            .ok_or_else(|| AssistantError::MalformedRecord {
                row,
                reason: format!("invalid {} date '{}'", field, text),
            }),
    }
}

fn optional_amount(value: Option<String>, row: usize) -> Result<Option<f64>> {
    match non_blank(value) {
        None => Ok(None),
        Some(text) => {
            let cleaned: String = text.chars().filter(|c| !matches!(c, '$' | ',' | ' ')).collect();
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(|_| AssistantError::MalformedRecord {
                    row,
                    reason: format!("invalid amount '{}'", text),
                })
        }
    }
}

/// Parse `YYYY-MM-DD`, RFC 3339 timestamps and `DD/MM/YYYY`
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(text, "%d/%m/%Y").ok())
}
