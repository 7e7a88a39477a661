//! Core record models for proposals and follow-ups

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Draft,
    Sent,
    Pending,
    Won,
    Lost,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 5] = [
        ProposalStatus::Draft,
        ProposalStatus::Sent,
        ProposalStatus::Pending,
        ProposalStatus::Won,
        ProposalStatus::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Sent => "sent",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Won => "won",
            ProposalStatus::Lost => "lost",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ProposalStatus::Won | ProposalStatus::Lost)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the plain status names as well as CRM deal stage names.
impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" | "qualification" | "needs analysis" | "value proposition"
            | "id. decision makers" | "identify decision makers" => Ok(ProposalStatus::Draft),
            "sent" | "proposal/price quote" | "proposal" | "quoted" => Ok(ProposalStatus::Sent),
            "pending" | "negotiation/review" | "negotiation" | "open" | "in progress" => {
                Ok(ProposalStatus::Pending)
            }
            "won" | "closed won" | "closed-won" => Ok(ProposalStatus::Won),
            "lost" | "closed lost" | "closed-lost" | "closed lost to competition" => {
                Ok(ProposalStatus::Lost)
            }
            other => Err(format!("unknown proposal status '{}'", other)),
        }
    }
}

/// Where a follow-up stands on a given day
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FollowUpState {
    /// Due date has passed
    Overdue,
    /// No due date, or due today or later
    Open,
}

impl FromStr for FollowUpState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overdue" | "late" => Ok(FollowUpState::Overdue),
            "open" | "upcoming" | "due" => Ok(FollowUpState::Open),
            other => Err(format!("unknown follow-up status '{}'", other)),
        }
    }
}

//
// ================= Records =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalRecord {
    pub id: String,
    pub client: String,
    pub status: ProposalStatus,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl ProposalRecord {
    /// All dates attached to the proposal, in lifecycle order
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        [self.created_on, self.sent_on, self.decision_on]
            .into_iter()
            .flatten()
    }

    /// One-line fact used in prompts
    pub fn fact_line(&self) -> String {
        let mut line = format!(
            "Proposal {} | client: {} | status: {} | owner: {}",
            self.id, self.client, self.status, self.owner
        );
        if let Some(title) = &self.title {
            line.push_str(&format!(" | title: {}", title));
        }
        if let Some(date) = self.created_on {
            line.push_str(&format!(" | created: {}", date));
        }
        if let Some(date) = self.sent_on {
            line.push_str(&format!(" | sent: {}", date));
        }
        if let Some(date) = self.decision_on {
            line.push_str(&format!(" | decision: {}", date));
        }
        if let Some(amount) = self.amount {
            line.push_str(&format!(" | amount: {:.2}", amount));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpRecord {
    pub id: String,
    pub client: String,
    pub last_contact: NaiveDate,
    pub next_action: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_on: Option<NaiveDate>,
}

impl FollowUpRecord {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.due_on.map(|due| due < today).unwrap_or(false)
    }

    pub fn fact_line(&self) -> String {
        let mut line = format!(
            "Follow-up {} | client: {} | last contact: {} | next action: {} | owner: {}",
            self.id, self.client, self.last_contact, self.next_action, self.owner
        );
        if let Some(due) = self.due_on {
            line.push_str(&format!(" | due: {}", due));
        }
        line
    }
}

//
// ================= Record Set =================
//

/// Records from a single load. Never mutated after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordSet {
    pub proposals: Vec<ProposalRecord>,
    pub follow_ups: Vec<FollowUpRecord>,
}

impl RecordSet {
    pub fn new(proposals: Vec<ProposalRecord>, follow_ups: Vec<FollowUpRecord>) -> Self {
        Self {
            proposals,
            follow_ups,
        }
    }

    pub fn len(&self) -> usize {
        self.proposals.len() + self.follow_ups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only records owned by `owner`; `None` keeps everything.
    pub fn scoped_to(&self, owner: Option<&str>) -> RecordSet {
        let Some(owner) = owner else {
            return self.clone();
        };

        RecordSet {
            proposals: self
                .proposals
                .iter()
                .filter(|p| p.owner.eq_ignore_ascii_case(owner))
                .cloned()
                .collect(),
            follow_ups: self
                .follow_ups
                .iter()
                .filter(|f| f.owner.eq_ignore_ascii_case(owner))
                .cloned()
                .collect(),
        }
    }

    pub fn proposals_for_client<'a>(
        &'a self,
        client: &'a str,
    ) -> impl Iterator<Item = &'a ProposalRecord> + 'a {
        self.proposals
            .iter()
            .filter(move |p| p.client.eq_ignore_ascii_case(client))
    }

    /// Proposals matching an optional status and owner
    pub fn proposals_with(
        &self,
        status: Option<ProposalStatus>,
        owner: Option<&str>,
    ) -> Vec<&ProposalRecord> {
        self.proposals
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .filter(|p| owner.map_or(true, |o| p.owner.eq_ignore_ascii_case(o)))
            .collect()
    }

    /// Follow-ups matching an optional state (as of `today`) and owner
    pub fn follow_ups_with(
        &self,
        state: Option<FollowUpState>,
        owner: Option<&str>,
        today: NaiveDate,
    ) -> Vec<&FollowUpRecord> {
        self.follow_ups
            .iter()
            .filter(|f| match state {
                Some(FollowUpState::Overdue) => f.is_overdue(today),
                Some(FollowUpState::Open) => !f.is_overdue(today),
                None => true,
            })
            .filter(|f| owner.map_or(true, |o| f.owner.eq_ignore_ascii_case(o)))
            .collect()
    }

    /// Distinct owner names, sorted
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .proposals
            .iter()
            .map(|p| p.owner.clone())
            .chain(self.follow_ups.iter().map(|f| f.owner.clone()))
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    pub fn summary(&self, today: NaiveDate) -> RecordSummary {
        let mut by_status: BTreeMap<ProposalStatus, usize> =
            ProposalStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut pipeline_value = 0.0;
        let mut won_value = 0.0;

        for proposal in &self.proposals {
            *by_status.entry(proposal.status).or_insert(0) += 1;
            let amount = proposal.amount.unwrap_or(0.0);
            pipeline_value += amount;
            if proposal.status == ProposalStatus::Won {
                won_value += amount;
            }
        }

        RecordSummary {
            total_proposals: self.proposals.len(),
            total_follow_ups: self.follow_ups.len(),
            won_proposals: by_status.get(&ProposalStatus::Won).copied().unwrap_or(0),
            pipeline_value,
            won_value,
            overdue_follow_ups: self
                .follow_ups
                .iter()
                .filter(|f| f.is_overdue(today))
                .count(),
            by_status,
        }
    }
}

/// Aggregate figures shown to the user and included in prompts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordSummary {
    pub total_proposals: usize,
    pub total_follow_ups: usize,
    pub by_status: BTreeMap<ProposalStatus, usize>,
    pub pipeline_value: f64,
    pub won_proposals: usize,
    pub won_value: f64,
    pub overdue_follow_ups: usize,
}

impl RecordSummary {
    pub fn to_prompt_block(&self) -> String {
        let statuses = self
            .by_status
            .iter()
            .map(|(status, count)| format!("{} {}", count, status))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "- Total proposals: {} ({})\n\
             - Total follow-ups: {} ({} overdue)\n\
             - Pipeline value: ${:.2}\n\
             - Won proposals: {} worth ${:.2}",
            self.total_proposals,
            statuses,
            self.total_follow_ups,
            self.overdue_follow_ups,
            self.pipeline_value,
            self.won_proposals,
            self.won_value
        )
    }
}
