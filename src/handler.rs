//! Query Handler
//!
//! Turns one user question into one answer:
//! match records → build prompt → call LLM → record both turns.
//!
//! Upstream failures stop here. The user gets an apology in place of the
//! answer and the transcript records exactly what they saw.

use crate::config::AppConfig;
use crate::data::RecordStore;
use crate::error::AssistantError;
use crate::llm::{LlmClient, Prompt};
use crate::memory::{ConversationTurn, SessionContext, UserProfile};
use crate::models::{RecordSet, RecordSummary};
use crate::retrieval::{MatchedRecord, RankedRecord, RecordMatcher};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_QUESTION_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// `k` in `recent(k)` when building the prompt
    pub history_turns: usize,
    pub max_matched_records: usize,
    pub llm_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            history_turns: 6,
            max_matched_records: 8,
            llm_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&AppConfig> for HandlerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            history_turns: config.prompt_history_turns,
            max_matched_records: config.max_matched_records,
            llm_timeout: config.llm.timeout,
        }
    }
}

/// Result of answering one question
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub matched_records: Vec<RankedRecord>,
    /// True when `text` is an apology rather than a model answer
    pub upstream_failed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BriefKind {
    Summary,
    Insights,
    Recommendations,
}

impl BriefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BriefKind::Summary => "summary",
            BriefKind::Insights => "insights",
            BriefKind::Recommendations => "recommendations",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            BriefKind::Summary => {
                "Write a short summary of the current pipeline: where proposals stand, \
                 what was won or lost, and which follow-ups are pending."
            }
            BriefKind::Insights => {
                "List the most notable patterns in these records, such as stalled \
                 proposals, clients with overdue follow-ups or owners carrying most of the pipeline."
            }
            BriefKind::Recommendations => {
                "Recommend concrete next actions for the sales team, most urgent first, \
                 naming the client and owner for each."
            }
        }
    }
}

impl fmt::Display for BriefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BriefKind {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "summary" => Ok(BriefKind::Summary),
            "insights" | "insight" => Ok(BriefKind::Insights),
            "recommendations" | "recommendation" => Ok(BriefKind::Recommendations),
            other => Err(AssistantError::InvalidInput(format!(
                "unknown brief kind '{}'",
                other
            ))),
        }
    }
}

/// Generated report; not part of the conversation log
#[derive(Debug, Clone, Serialize)]
pub struct Brief {
    pub kind: BriefKind,
    pub text: String,
    pub upstream_failed: bool,
}

#[derive(Clone)]
pub struct QueryHandler {
    records: RecordStore,
    matcher: Arc<dyn RecordMatcher>,
    llm: Arc<dyn LlmClient>,
    config: HandlerConfig,
}

impl QueryHandler {
    pub fn new(
        records: RecordStore,
        matcher: Arc<dyn RecordMatcher>,
        llm: Arc<dyn LlmClient>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            records,
            matcher,
            llm,
            config,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// Answer a question within a session.
    ///
    /// Fails only with `InvalidInput`; in that case nothing is recorded.
    /// LLM errors and timeouts come back as an apology with
    /// `upstream_failed` set.
    pub async fn answer(&self, text: &str, session: &mut SessionContext) -> crate::Result<Answer> {
        let question = validate_question(text)?;
        let today = Utc::now().date_naive();

        let records = self.records.snapshot().await;
        let scoped = records.scoped_to(session.profile.owner.as_deref());
        let matched = self
            .matcher
            .rank(question, &scoped, self.config.max_matched_records);

        if matched.is_empty() {
            info!(
                session_id = %session.session_id,
                "{}; forwarding question without record context",
                AssistantError::NoRelevantData
            );
        } else {
            info!(session_id = %session.session_id, matched = matched.len(), "Matched records");
        }

        let system = answer_system_prompt(&session.profile, today, &scoped.summary(today), &matched);

        // History is taken before this question is recorded
        let history = session
            .memory
            .recent(self.config.history_turns)
            .rev()
            .map(|turn| (turn.role, turn.text.clone()))
            .collect();

        let prompt = Prompt::new(system, question).with_history(history);

        let (text, upstream_failed) = match self.complete(&prompt).await {
            Ok(reply) => (reply, false),
            Err(e) => {
                warn!(session_id = %session.session_id, "LLM call failed: {}", e);
                (e.user_message(), true)
            }
        };

        session.memory.append(ConversationTurn::user(question));
        session.memory.append(ConversationTurn::assistant(text.clone()));
        session.touch();

        Ok(Answer {
            text,
            matched_records: matched,
            upstream_failed,
        })
    }

    /// Generate a summary, insights or recommendations over the session's
    /// visible records. Optional `focus` narrows the records to those it
    /// matches.
    pub async fn brief(
        &self,
        kind: BriefKind,
        focus: Option<&str>,
        session: &SessionContext,
    ) -> Brief {
        let today = Utc::now().date_naive();
        let records = self.records.snapshot().await;
        let scoped = records.scoped_to(session.profile.owner.as_deref());

        let focus = focus.map(str::trim).filter(|f| !f.is_empty());
        let highlights = match focus {
            Some(focus) => self
                .matcher
                .rank(focus, &scoped, self.config.max_matched_records)
                .into_iter()
                .map(|ranked| ranked.record)
                .collect(),
            None => open_items(&scoped, today, self.config.max_matched_records),
        };

        let system = brief_system_prompt(&session.profile, today, &scoped.summary(today), &highlights);
        let mut request = kind.instruction().to_string();
        if let Some(focus) = focus {
            request.push_str(&format!(" Focus on: {}", focus));
        }

        info!(session_id = %session.session_id, kind = %kind, "Generating brief");

        match self.complete(&Prompt::new(system, request)).await {
            Ok(text) => Brief {
                kind,
                text,
                upstream_failed: false,
            },
            Err(e) => {
                warn!(session_id = %session.session_id, kind = %kind, "Brief generation failed: {}", e);
                Brief {
                    kind,
                    text: e.user_message(),
                    upstream_failed: true,
                }
            }
        }
    }

    async fn complete(&self, prompt: &Prompt) -> crate::Result<String> {
        let timeout = self.config.llm_timeout;
        tokio::time::timeout(timeout, self.llm.complete(prompt))
            .await
            .map_err(|_| {
                AssistantError::UpstreamError(format!(
                    "{} did not answer within {}s",
                    self.llm.provider(),
                    timeout.as_secs_f32()
                ))
            })?
    }
}

fn validate_question(text: &str) -> crate::Result<&str> {
    let question = text.trim();
    if question.is_empty() {
        return Err(AssistantError::InvalidInput(
            "the message is empty".to_string(),
        ));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(AssistantError::InvalidInput(format!(
            "messages are limited to {} characters",
            MAX_QUESTION_CHARS
        )));
    }
    Ok(question)
}

/// Open proposals first, then follow-ups, soonest due first
fn open_items(records: &RecordSet, today: NaiveDate, limit: usize) -> Vec<MatchedRecord> {
    let mut follow_ups: Vec<_> = records.follow_ups.iter().collect();
    follow_ups.sort_by_key(|f| (!f.is_overdue(today), f.due_on.unwrap_or(NaiveDate::MAX)));

    records
        .proposals
        .iter()
        .filter(|p| !p.status.is_closed())
        .cloned()
        .map(MatchedRecord::Proposal)
        .chain(follow_ups.into_iter().cloned().map(MatchedRecord::FollowUp))
        .take(limit)
        .collect()
}

fn preamble(profile: &UserProfile, today: NaiveDate, summary: &RecordSummary) -> String {
    format!(
        "You are a sales CRM assistant helping {} (role: {}) with proposals and follow-ups.\n\
         Today's date is {}.\n\n\
         Record summary:\n{}",
        profile.display_name,
        profile.role(),
        today,
        summary.to_prompt_block()
    )
}

fn answer_system_prompt(
    profile: &UserProfile,
    today: NaiveDate,
    summary: &RecordSummary,
    matched: &[RankedRecord],
) -> String {
    let mut prompt = preamble(profile, today, summary);

    if matched.is_empty() {
        prompt.push_str(
            "\n\nNo records matched this question. Answer from the summary if you can, \
             otherwise say that no matching proposals or follow-ups were found.",
        );
    } else {
        prompt.push_str("\n\nRelevant records:\n");
        for ranked in matched {
            prompt.push_str("- ");
            prompt.push_str(&ranked.record.fact_line());
            prompt.push('\n');
        }
    }

    prompt.push_str(
        "\n\nGuidelines:\n\
         - Use only the records above; never invent clients, amounts or dates\n\
         - Quote statuses and dates exactly as given\n\
         - Keep answers short and specific",
    );
    prompt
}

fn brief_system_prompt(
    profile: &UserProfile,
    today: NaiveDate,
    summary: &RecordSummary,
    highlights: &[MatchedRecord],
) -> String {
    let mut prompt = preamble(profile, today, summary);

    if !highlights.is_empty() {
        prompt.push_str("\n\nKey records:\n");
        for record in highlights {
            prompt.push_str("- ");
            prompt.push_str(&record.fact_line());
            prompt.push('\n');
        }
    }

    prompt.push_str("\n\nWrite for a busy sales manager. Use short bullet points.");
    prompt
}
