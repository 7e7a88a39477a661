//! Record retrieval
//!
//! Picks the records relevant to a user question. The Query Handler only
//! sees the [`RecordMatcher`] trait, so the keyword heuristics here can be
//! replaced by a real index without touching it.
//!
//! Scoring (KeywordMatcher):
//! - full client name in the question, or distinctive client-name words
//! - owner name
//! - proposal status words (pending, won, ...)
//! - explicit dates and relative windows (today, this week, this month, overdue)
//! - record-kind hints ("proposal", "follow-up") only break ties, or select
//!   a whole kind when nothing more specific matched

use crate::data::parse_date;
use crate::models::{FollowUpRecord, ProposalRecord, ProposalStatus, RecordSet};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A record selected for a prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchedRecord {
    Proposal(ProposalRecord),
    FollowUp(FollowUpRecord),
}

impl MatchedRecord {
    pub fn client(&self) -> &str {
        match self {
            MatchedRecord::Proposal(p) => &p.client,
            MatchedRecord::FollowUp(f) => &f.client,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MatchedRecord::Proposal(p) => &p.id,
            MatchedRecord::FollowUp(f) => &f.id,
        }
    }

    pub fn fact_line(&self) -> String {
        match self {
            MatchedRecord::Proposal(p) => p.fact_line(),
            MatchedRecord::FollowUp(f) => f.fact_line(),
        }
    }

    fn kind_order(&self) -> u8 {
        match self {
            MatchedRecord::Proposal(_) => 0,
            MatchedRecord::FollowUp(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedRecord {
    pub score: u32,
    pub record: MatchedRecord,
}

/// Match-and-rank strategy used by the Query Handler
pub trait RecordMatcher: Send + Sync {
    /// Records relevant to `query`, best first, at most `limit` of them.
    /// An empty result means nothing matched.
    fn rank(&self, query: &str, records: &RecordSet, limit: usize) -> Vec<RankedRecord>;
}

/// Static keyword lists
const PROPOSAL_HINTS: &[&str] = &[
    "proposal", "proposals", "deal", "deals", "quote", "quotes", "pitch", "pitches", "pipeline",
];

const FOLLOW_UP_HINTS: &[&str] = &[
    "follow", "followup", "followups", "task", "tasks", "contact", "contacted", "call", "calls",
    "action", "actions", "next",
];

/// Words too common in company names to identify a client on their own
const CLIENT_NOISE: &[&str] = &[
    "corp", "corporation", "inc", "ltd", "llc", "co", "company", "group", "the", "and", "pvt",
    "limited", "solutions", "services", "technologies", "systems",
];

const STATUS_WORDS: &[(&str, ProposalStatus)] = &[
    ("draft", ProposalStatus::Draft),
    ("drafts", ProposalStatus::Draft),
    ("sent", ProposalStatus::Sent),
    ("pending", ProposalStatus::Pending),
    ("open", ProposalStatus::Pending),
    ("negotiation", ProposalStatus::Pending),
    ("won", ProposalStatus::Won),
    ("win", ProposalStatus::Won),
    ("wins", ProposalStatus::Won),
    ("lost", ProposalStatus::Lost),
    ("losses", ProposalStatus::Lost),
];

const FULL_CLIENT_SCORE: u32 = 10;
const CLIENT_WORD_SCORE: u32 = 4;
const OWNER_SCORE: u32 = 3;
const STATUS_SCORE: u32 = 3;
const EXACT_DATE_SCORE: u32 = 5;
const OVERDUE_SCORE: u32 = 4;
const WINDOW_SCORE: u32 = 2;
const KIND_HINT_SCORE: u32 = 1;

/// Keyword and date heuristics over the loaded records
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    today: Option<NaiveDate>,
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin "today" for relative date windows
    pub fn with_today(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }
}

/// Parsed view of the question
struct QueryTerms {
    /// Lowercased words joined by single spaces, padded with spaces
    padded: String,
    words: HashSet<String>,
    dates: Vec<NaiveDate>,
    statuses: HashSet<ProposalStatus>,
    wants_proposals: bool,
    wants_follow_ups: bool,
    today: bool,
    this_week: bool,
    this_month: bool,
    overdue: bool,
}

impl QueryTerms {
    fn parse(query: &str) -> Self {
        let normalized = normalize(query);
        let words: HashSet<String> = normalized.split(' ').filter(|w| !w.is_empty()).map(str::to_string).collect();

        let dates = query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
            .filter_map(parse_date)
            .collect();

        let statuses = STATUS_WORDS
            .iter()
            .filter(|(word, _)| words.contains(*word))
            .map(|(_, status)| *status)
            .collect();

        let padded = format!(" {} ", normalized);
        let has = |w: &str| words.contains(w);

        Self {
            wants_proposals: PROPOSAL_HINTS.iter().any(|h| has(h)),
            wants_follow_ups: FOLLOW_UP_HINTS.iter().any(|h| has(h)),
            today: has("today"),
            this_week: padded.contains(" this week ") || padded.contains(" next few days "),
            this_month: padded.contains(" this month "),
            overdue: has("overdue") || has("late") || padded.contains(" past due "),
            padded,
            words,
            dates,
            statuses,
        }
    }

    fn contains_phrase(&self, phrase: &str) -> bool {
        let phrase = normalize(phrase);
        !phrase.is_empty() && self.padded.contains(&format!(" {} ", phrase))
    }
}

/// Lowercase, turn every non-alphanumeric run into one space
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn week_bounds(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    (start, start + Duration::days(6))
}

impl KeywordMatcher {
    fn client_score(&self, terms: &QueryTerms, client: &str) -> u32 {
        if terms.contains_phrase(client) {
            return FULL_CLIENT_SCORE;
        }

        let distinctive = normalize(client)
            .split(' ')
            .filter(|w| w.len() >= 3 && !CLIENT_NOISE.contains(w))
            .filter(|w| terms.words.contains(*w))
            .count() as u32;

        distinctive * CLIENT_WORD_SCORE
    }

    fn owner_score(&self, terms: &QueryTerms, owner: &str) -> u32 {
        if terms.contains_phrase(owner) {
            OWNER_SCORE
        } else {
            0
        }
    }

    fn date_score(&self, terms: &QueryTerms, dates: &[NaiveDate]) -> u32 {
        let today = self.today();
        let mut score = 0;

        if terms.dates.iter().any(|d| dates.contains(d)) {
            score += EXACT_DATE_SCORE;
        }
        if terms.today && dates.contains(&today) {
            score += WINDOW_SCORE;
        }
        if terms.this_week {
            let (start, end) = week_bounds(today);
            if dates.iter().any(|d| *d >= start && *d <= end) {
                score += WINDOW_SCORE;
            }
        }
        if terms.this_month
            && dates
                .iter()
                .any(|d| d.year() == today.year() && d.month() == today.month())
        {
            score += WINDOW_SCORE;
        }

        score
    }

    fn score_proposal(&self, terms: &QueryTerms, proposal: &ProposalRecord) -> u32 {
        let dates: Vec<NaiveDate> = proposal.dates().collect();
        let mut score = self.client_score(terms, &proposal.client)
            + self.owner_score(terms, &proposal.owner)
            + self.date_score(terms, &dates);

        if terms.statuses.contains(&proposal.status) {
            score += STATUS_SCORE;
        }
        if let Some(title) = &proposal.title {
            if terms.contains_phrase(title) {
                score += FULL_CLIENT_SCORE;
            }
        }

        score
    }

    fn score_follow_up(&self, terms: &QueryTerms, follow_up: &FollowUpRecord) -> u32 {
        let dates: Vec<NaiveDate> = std::iter::once(follow_up.last_contact)
            .chain(follow_up.due_on)
            .collect();
        let mut score = self.client_score(terms, &follow_up.client)
            + self.owner_score(terms, &follow_up.owner)
            + self.date_score(terms, &dates);

        if terms.overdue && follow_up.is_overdue(self.today()) {
            score += OVERDUE_SCORE;
        }

        score
    }
}

impl RecordMatcher for KeywordMatcher {
    fn rank(&self, query: &str, records: &RecordSet, limit: usize) -> Vec<RankedRecord> {
        let terms = QueryTerms::parse(query);

        let proposal_hint = if terms.wants_proposals { KIND_HINT_SCORE } else { 0 };
        let follow_up_hint = if terms.wants_follow_ups { KIND_HINT_SCORE } else { 0 };

        // (specific score, hint score, record)
        let scored: Vec<(u32, u32, MatchedRecord)> = records
            .proposals
            .iter()
            .map(|p| {
                (
                    self.score_proposal(&terms, p),
                    proposal_hint,
                    MatchedRecord::Proposal(p.clone()),
                )
            })
            .chain(records.follow_ups.iter().map(|f| {
                (
                    self.score_follow_up(&terms, f),
                    follow_up_hint,
                    MatchedRecord::FollowUp(f.clone()),
                )
            }))
            .collect();

        let any_specific = scored.iter().any(|(specific, _, _)| *specific > 0);

        let mut ranked: Vec<RankedRecord> = scored
            .into_iter()
            .filter(|(specific, hint, _)| if any_specific { *specific > 0 } else { *hint > 0 })
            .map(|(specific, hint, record)| RankedRecord {
                score: specific + hint,
                record,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.record.kind_order().cmp(&b.record.kind_order()))
                .then_with(|| a.record.id().cmp(b.record.id()))
        });
        ranked.truncate(limit);
        ranked
    }
}
