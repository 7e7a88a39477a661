//! Integration tests for the HTTP surface.
//!
//! Each test builds its own router over fixed records and a mock LLM, then
//! drives it with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::NaiveDate;
use serde_json::Value;
use tower::ServiceExt;

use crm_chat_assistant::api::{create_router, ApiState};
use crm_chat_assistant::data::RecordStore;
use crm_chat_assistant::handler::{HandlerConfig, QueryHandler};
use crm_chat_assistant::llm::{LlmClient, MockLlmClient};
use crm_chat_assistant::memory::SessionRegistry;
use crm_chat_assistant::models::{FollowUpRecord, ProposalRecord, ProposalStatus, RecordSet};
use crm_chat_assistant::retrieval::KeywordMatcher;

// =============================================================================
// Helpers
// =============================================================================

const ACME_QUESTION: &str = "What's the status of Acme Corp's proposal?";

fn proposal(id: &str, client: &str, status: ProposalStatus, owner: &str, amount: f64) -> ProposalRecord {
    ProposalRecord {
        id: id.to_string(),
        client: client.to_string(),
        status,
        owner: owner.to_string(),
        title: None,
        created_on: NaiveDate::from_ymd_opt(2024, 3, 1),
        sent_on: None,
        decision_on: None,
        amount: Some(amount),
    }
}

fn sample_records() -> RecordSet {
    RecordSet::new(
        vec![
            proposal("P-1", "Acme Corp", ProposalStatus::Pending, "Kumaran V", 25000.0),
            proposal("P-2", "Globex", ProposalStatus::Won, "Soniya M", 40000.0),
        ],
        vec![FollowUpRecord {
            id: "F-1".to_string(),
            client: "Globex".to_string(),
            last_contact: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
            next_action: "Send onboarding pack".to_string(),
            owner: "Soniya M".to_string(),
            due_on: None,
        }],
    )
}

fn make_app_with(llm: Arc<dyn LlmClient>) -> axum::Router {
    let config = HandlerConfig {
        llm_timeout: Duration::from_millis(200),
        ..HandlerConfig::default()
    };
    let handler = QueryHandler::new(
        RecordStore::from_records(sample_records()),
        Arc::new(KeywordMatcher::new()),
        llm,
        config,
    );
    let sessions = Arc::new(SessionRegistry::new(20, Duration::from_secs(3600)));
    create_router(ApiState::new(handler, sessions))
}

fn make_app(mock: &Arc<MockLlmClient>) -> axum::Router {
    make_app_with(mock.clone())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, json: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_session(app: &axum::Router, body: Value) -> String {
    let resp = app.clone().oneshot(post_json("/api/sessions", body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    json["data"]["session_id"].as_str().unwrap().to_string()
}

async fn transcript(app: &axum::Router, session_id: &str) -> Value {
    let resp = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{}/transcript", session_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_json(resp).await["data"]["turns"].clone()
}

// =============================================================================
// Health & status
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let resp = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "healthy");
}

#[tokio::test]
async fn test_status_reports_records_and_llm() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let resp = app.oneshot(get("/api/status")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["data"]["llm"]["provider"], "mock");
    assert_eq!(json["data"]["llm"]["reachable"], true);
    assert_eq!(json["data"]["records"]["proposals"], 2);
    assert_eq!(json["data"]["records"]["follow_ups"], 1);
}

// =============================================================================
// Sessions & messages
// =============================================================================

#[tokio::test]
async fn test_acme_pending_round_trip() {
    let mock = Arc::new(MockLlmClient::replying("Acme Corp's proposal is still pending."));
    let app = make_app(&mock);
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", session_id),
            serde_json::json!({ "message": ACME_QUESTION }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["text"], "Acme Corp's proposal is still pending.");
    assert_eq!(json["data"]["upstream_failed"], false);
    assert_eq!(json["data"]["matched_records"][0]["record"]["id"], "P-1");

    let prompts = mock.prompts().await;
    assert!(prompts[0].system.contains("client: Acme Corp | status: pending"));

    let turns = transcript(&app, &session_id).await;
    assert_eq!(turns.as_array().unwrap().len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[0]["text"], ACME_QUESTION);
    assert_eq!(turns[1]["role"], "assistant");
}

#[tokio::test]
async fn test_upstream_failure_returns_apology() {
    let app = make_app_with(Arc::new(MockLlmClient::failing("connection reset")));
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", session_id),
            serde_json::json!({ "message": ACME_QUESTION }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["data"]["upstream_failed"], true);
    assert!(json["data"]["text"].as_str().unwrap().contains("sorry"));
    assert!(!json.to_string().contains("connection reset"));
}

#[tokio::test]
async fn test_llm_timeout_returns_apology() {
    let app = make_app_with(Arc::new(MockLlmClient::delayed(Duration::from_secs(2), "late")));
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", session_id),
            serde_json::json!({ "message": "any pending proposals?" }),
        ))
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["data"]["upstream_failed"], true);

    let turns = transcript(&app, &session_id).await;
    assert_eq!(turns[1]["text"], json["data"]["text"]);
}

#[tokio::test]
async fn test_blank_message_is_rejected() {
    let mock = Arc::new(MockLlmClient::replying("unused"));
    let app = make_app(&mock);
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", session_id),
            serde_json::json!({ "message": "   " }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(transcript(&app, &session_id).await.as_array().unwrap().is_empty());
    assert!(mock.prompts().await.is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let resp = app
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", uuid::Uuid::new_v4()),
            serde_json::json!({ "message": "hello" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["success"], false);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let first = create_session(&app, serde_json::json!({})).await;
    let second = create_session(&app, serde_json::json!({})).await;

    app.clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", first),
            serde_json::json!({ "message": ACME_QUESTION }),
        ))
        .await
        .unwrap();

    assert_eq!(transcript(&app, &first).await.as_array().unwrap().len(), 2);
    assert!(transcript(&app, &second).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_owner_session_does_not_see_other_owners() {
    let mock = Arc::new(MockLlmClient::replying("ok"));
    let app = make_app(&mock);
    let session_id = create_session(&app, serde_json::json!({ "owner": "Soniya M" })).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/messages", session_id),
            serde_json::json!({ "message": "Is Acme Corp pending?" }),
        ))
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert!(json["data"]["matched_records"].as_array().unwrap().is_empty());
    assert!(!mock.prompts().await[0].system.contains("Acme Corp |"));
}

#[tokio::test]
async fn test_end_session_discards_memory() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{}", session_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{}/transcript", session_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(delete(&format!("/api/sessions/{}", session_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Chat endpoint
// =============================================================================

#[tokio::test]
async fn test_chat_keeps_memory_per_chat_id() {
    let mock = Arc::new(MockLlmClient::replying("noted"));
    let app = make_app(&mock);

    for question in ["first question", "second question"] {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({
                    "chat_id": "browser-tab-1",
                    "messages": [
                        { "role": "assistant", "content": "Hi!" },
                        { "role": "user", "content": question }
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["answer"], "noted");
    }

    let prompts = mock.prompts().await;
    assert_eq!(prompts[1].user, "second question");
    assert_eq!(prompts[1].history.len(), 2);
    assert_eq!(prompts[1].history[0].1, "first question");
}

#[tokio::test]
async fn test_chat_without_user_message_is_400() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let resp = app
        .oneshot(post_json(
            "/api/chat",
            serde_json::json!({ "messages": [{ "role": "assistant", "content": "Hi" }] }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chats_without_id_do_not_share_history() {
    let mock = Arc::new(MockLlmClient::replying("noted"));
    let app = make_app(&mock);

    let mut chat_ids = Vec::new();
    for (owner, question) in [("Kumaran V", "How is Acme Corp doing?"), ("Soniya M", "Any Globex follow-ups?")] {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({
                    "owner": owner,
                    "messages": [{ "role": "user", "content": question }]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        chat_ids.push(body_json(resp).await["data"]["chat_id"].as_str().unwrap().to_string());
    }

    assert_ne!(chat_ids[0], chat_ids[1]);
    let prompts = mock.prompts().await;
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].history.is_empty());
    assert!(!prompts[1].system.contains("Acme Corp"));
}

#[tokio::test]
async fn test_chat_id_reused_by_other_owner_is_409() {
    let mock = Arc::new(MockLlmClient::replying("noted"));
    let app = make_app(&mock);

    let ask = |owner: &str| {
        post_json(
            "/api/chat",
            serde_json::json!({
                "chat_id": "shared-tab",
                "owner": owner,
                "messages": [{ "role": "user", "content": "What's pending?" }]
            }),
        )
    };

    let resp = app.clone().oneshot(ask("Kumaran V")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(ask("Soniya M")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(resp).await["success"], false);
    assert_eq!(mock.prompts().await.len(), 1);
}

// =============================================================================
// Briefs & records
// =============================================================================

#[tokio::test]
async fn test_brief_generation() {
    let mock = Arc::new(MockLlmClient::replying("- Chase Acme Corp"));
    let app = make_app(&mock);
    let session_id = create_session(&app, serde_json::json!({})).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{}/briefs", session_id),
            serde_json::json!({ "kind": "recommendations" }),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["data"]["kind"], "recommendations");
    assert_eq!(json["data"]["text"], "- Chase Acme Corp");
    assert!(transcript(&app, &session_id).await.as_array().unwrap().is_empty());

    let resp = app
        .oneshot(post_json(
            &format!("/api/sessions/{}/briefs", session_id),
            serde_json::json!({ "kind": "forecast" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_records_summary() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));

    let resp = app.clone().oneshot(get("/api/records/summary")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["data"]["summary"]["total_proposals"], 2);
    assert_eq!(json["data"]["summary"]["won_proposals"], 1);

    let resp = app
        .oneshot(get("/api/records/summary?owner=Kumaran%20V"))
        .await
        .unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["data"]["summary"]["total_proposals"], 1);
    assert_eq!(json["data"]["summary"]["total_follow_ups"], 0);
}

#[tokio::test]
async fn test_records_filtered_by_kind_status_and_owner() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));

    let resp = app
        .clone()
        .oneshot(get("/api/records?kind=proposals&status=pending"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let proposals = json["data"]["proposals"].as_array().unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0]["client"], "Acme Corp");
    assert!(json["data"].get("follow_ups").is_none());

    let resp = app
        .clone()
        .oneshot(get("/api/records?kind=follow_ups&status=open&owner=Soniya%20M"))
        .await
        .unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["data"]["follow_ups"][0]["id"], "F-1");

    let resp = app.clone().oneshot(get("/api/records?owner=Kumaran%20V")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["data"]["proposals"].as_array().unwrap().len(), 1);
    assert!(json["data"]["follow_ups"].as_array().unwrap().is_empty());

    for uri in ["/api/records?kind=leads", "/api/records?status=won", "/api/records?kind=proposals&status=someday"] {
        let resp = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_reload_without_source_keeps_records() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));

    let resp = app
        .clone()
        .oneshot(Request::post("/api/records/reload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/api/status")).await.unwrap();
    assert_eq!(body_json(resp).await["data"]["records"]["proposals"], 2);
}

// =============================================================================
// HTML page
// =============================================================================

#[tokio::test]
async fn test_page_creates_session_and_posts_message() {
    let mock = Arc::new(MockLlmClient::replying("Acme Corp is pending."));
    let app = make_app(&mock);

    let resp = app.clone().oneshot(get("/?owner=Kumaran%20V")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    let location = resp.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("/?session="));
    let session_id = location.trim_start_matches("/?session=").to_string();

    let resp = app.clone().oneshot(get(&location)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let html = body_text(resp).await;
    assert!(html.contains("Kumaran V (owner)"));
    assert!(html.contains(&session_id));

    let form = format!(
        "session_id={}&message=What%27s+the+status+of+Acme+Corp%27s+proposal%3F",
        session_id
    );
    let resp = app
        .clone()
        .oneshot(
            Request::post("/chat")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[header::LOCATION], location.as_str());

    let html = body_text(app.oneshot(get(&location)).await.unwrap()).await;
    assert!(html.contains("What's the status of Acme Corp's proposal?"));
    assert!(!html.contains(r#"class="notice""#));
    assert!(html.contains("Acme Corp is pending."));
    assert_eq!(mock.prompts().await.len(), 1);
}

#[tokio::test]
async fn test_page_with_unknown_session_starts_fresh() {
    let app = make_app(&Arc::new(MockLlmClient::replying("ok")));
    let resp = app
        .oneshot(get(&format!("/?session={}", uuid::Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_page_shows_notice_for_rejected_message() {
    let mock = Arc::new(MockLlmClient::replying("unused"));
    let app = make_app(&mock);

    let resp = app.clone().oneshot(get("/")).await.unwrap();
    let location = resp.headers()[header::LOCATION].to_str().unwrap().to_string();
    let session_id = location.trim_start_matches("/?session=").to_string();

    let form = format!("session_id={}&message={}", session_id, "a".repeat(4001));
    let resp = app
        .clone()
        .oneshot(
            Request::post("/chat")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    let notice_location = resp.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(notice_location.starts_with(&location));
    assert!(notice_location.contains("&notice="));

    let html = body_text(app.clone().oneshot(get(&notice_location)).await.unwrap()).await;
    assert!(html.contains(r#"class="notice""#));
    assert!(html.contains("limited to 4000 characters"));
    assert!(transcript(&app, &session_id).await.as_array().unwrap().is_empty());
    assert!(mock.prompts().await.is_empty());
}
