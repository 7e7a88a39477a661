//! CRM REST client
//!
//! Pulls deals (proposals) and tasks (follow-ups) from a Zoho-style CRM API.
//! Access tokens come from the OAuth refresh-token grant and are refreshed
//! once when the API answers 401.

use crate::config::{CrmCredentials, Secret};
use crate::data::{RawFollowUp, RawProposal, RawRow};
use crate::error::AssistantError;
use crate::Result;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const PAGE_SIZE: u32 = 200;
const MAX_PAGES: u32 = 50;

pub struct CrmClient {
    client: Client,
    base_url: String,
    auth_url: String,
    credentials: CrmCredentials,
    access_token: RwLock<Option<Secret>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModulePage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    info: PageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct PageInfo {
    #[serde(default)]
    more_records: bool,
}

impl CrmClient {
    pub fn new(
        base_url: impl Into<String>,
        auth_url: impl Into<String>,
        credentials: CrmCredentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .build()?;

        let access_token = RwLock::new(credentials.access_token.clone());

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_url: auth_url.into(),
            credentials,
            access_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch deals and tasks as raw rows ready for validation
    pub async fn fetch_rows(&self) -> Result<(Vec<RawRow<RawProposal>>, Vec<RawRow<RawFollowUp>>)> {
        let deals = self.fetch_module("Deals").await?;
        let tasks = self.fetch_module("Tasks").await?;

        info!("Fetched {} deals and {} tasks from CRM", deals.len(), tasks.len());

        let proposals = deals
            .iter()
            .enumerate()
            .map(|(i, deal)| RawRow {
                row: i + 1,
                parsed: Ok(deal_to_raw(deal)),
            })
            .collect();

        let follow_ups = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| RawRow {
                row: i + 1,
                parsed: Ok(task_to_raw(task)),
            })
            .collect();

        Ok((proposals, follow_ups))
    }

    /// Verify credentials by fetching a single deal
    pub async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/Deals", self.base_url);
        self.get_page(&url, 1, 1).await.map(|_| ())
    }

    async fn fetch_module(&self, module: &str) -> Result<Vec<Value>> {
        let url = format!("{}/{}", self.base_url, module);
        let mut all = Vec::new();

        for page in 1..=MAX_PAGES {
            let ModulePage { data, info } = self.get_page(&url, page, PAGE_SIZE).await?;
            let fetched = data.len();
            all.extend(data);

            debug!(module, page, fetched, "CRM page fetched");

            if !info.more_records || fetched == 0 {
                return Ok(all);
            }
        }

        warn!(module, "Stopped paging after {} pages", MAX_PAGES);
        Ok(all)
    }

    async fn get_page(&self, url: &str, page: u32, per_page: u32) -> Result<ModulePage> {
        let mut refreshed = false;

        loop {
            let token = match self.current_token().await {
                Some(token) => token,
                None => {
                    refreshed = true;
                    self.refresh_access_token().await?
                }
            };

            let response = self
                .client
                .get(url)
                .header("Authorization", format!("Zoho-oauthtoken {}", token.expose()))
                .query(&[("page", page), ("per_page", per_page)])
                .send()
                .await
                .map_err(|e| AssistantError::SourceUnavailable(format!("CRM request failed: {}", e)))?;

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!("CRM answered 401, refreshing access token");
                refreshed = true;
                self.refresh_access_token().await?;
                continue;
            }

            // Zoho answers 204 for an empty module
            if status == StatusCode::NO_CONTENT {
                return Ok(ModulePage {
                    data: Vec::new(),
                    info: PageInfo::default(),
                });
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AssistantError::SourceUnavailable(format!(
                    "CRM returned {}: {}",
                    status,
                    truncate(&body, 300)
                )));
            }

            return response.json::<ModulePage>().await.map_err(|e| {
                AssistantError::SourceUnavailable(format!("CRM response was not valid JSON: {}", e))
            });
        }
    }

    async fn current_token(&self) -> Option<Secret> {
        self.access_token.read().await.clone()
    }

    async fn refresh_access_token(&self) -> Result<Secret> {
        let params = [
            ("refresh_token", self.credentials.refresh_token.expose()),
            ("client_id", self.credentials.client_id.expose()),
            ("client_secret", self.credentials.client_secret.expose()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.auth_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                AssistantError::SourceUnavailable(format!("CRM token refresh failed: {}", e.without_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::SourceUnavailable(format!(
                "CRM token refresh returned {}",
                status
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            AssistantError::SourceUnavailable(format!("CRM token response invalid: {}", e.without_url()))
        })?;

        let token = body.access_token.map(Secret::new).ok_or_else(|| {
            AssistantError::SourceUnavailable(format!(
                "CRM token refresh returned no access token ({})",
                body.error.unwrap_or_else(|| "no error given".to_string())
            ))
        })?;

        *self.access_token.write().await = Some(token.clone());
        info!("CRM access token refreshed");

        Ok(token)
    }
}

//
// ================= Field mapping =================
//

/// Lookup fields arrive either as `{ "name": .. }` objects or plain strings
fn name_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("full_name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deal_to_raw(deal: &Value) -> RawProposal {
    RawProposal {
        id: text_of(deal.get("id")),
        client: name_of(deal.get("Account_Name")).or_else(|| text_of(deal.get("Deal_Name"))),
        status: text_of(deal.get("Stage")),
        owner: name_of(deal.get("Owner")),
        title: text_of(deal.get("Deal_Name")),
        created_on: text_of(deal.get("Created_Time")),
        sent_on: None,
        decision_on: text_of(deal.get("Closing_Date")),
        amount: text_of(deal.get("Amount")),
    }
}

fn task_to_raw(task: &Value) -> RawFollowUp {
    RawFollowUp {
        id: text_of(task.get("id")),
        client: name_of(task.get("What_Id")),
        last_contact: text_of(task.get("Modified_Time")).or_else(|| text_of(task.get("Created_Time"))),
        next_action: text_of(task.get("Subject")),
        owner: name_of(task.get("Owner")),
        due_on: text_of(task.get("Due_Date")),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
