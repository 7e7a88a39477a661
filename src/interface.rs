//! Browser chat page
//!
//! Server-rendered transcript with a plain form. Posting a message answers
//! it and redirects back to the page (post/redirect/get), so a refresh never
//! resubmits. A rejected message comes back as a `notice` shown above the form.

use axum::{
    extract::{Form, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use html_escape::{encode_double_quoted_attribute, encode_text};
use reqwest::Url;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{profile_from, ApiState};
use crate::memory::{ConversationTurn, TurnRole, UserProfile};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub session: Option<String>,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub notice: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatForm {
    pub session_id: String,
    #[serde(default)]
    pub message: String,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/", get(chat_page))
        .route("/chat", post(submit_message))
}

fn session_url(session_id: Uuid) -> String {
    format!("/?session={}", session_id)
}

fn session_url_with_notice(session_id: Uuid, notice: &str) -> String {
    let session = session_id.to_string();
    match Url::parse_with_params("http://localhost/", &[("session", session.as_str()), ("notice", notice)]) {
        Ok(url) => format!("/?{}", url.query().unwrap_or_default()),
        Err(_) => session_url(session_id),
    }
}

async fn chat_page(State(state): State<ApiState>, Query(query): Query<PageQuery>) -> Response {
    let existing = query
        .session
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok());

    let session = match existing {
        Some(session_id) => state.sessions.get(session_id).await,
        None => None,
    };

    let Some(session) = session else {
        let profile = profile_from(query.owner.as_deref(), query.name.as_deref());
        let session_id = state.sessions.create(profile).await;
        return Redirect::to(&session_url(session_id)).into_response();
    };

    let context = session.lock().await;
    let turns: Vec<&ConversationTurn> = context.memory.transcript().collect();
    let notice = query.notice.as_deref().map(str::trim).filter(|n| !n.is_empty());
    Html(render_page(context.session_id, &context.profile, &turns, notice)).into_response()
}

async fn submit_message(State(state): State<ApiState>, Form(form): Form<ChatForm>) -> Redirect {
    let Ok(session_id) = Uuid::parse_str(form.session_id.trim()) else {
        return Redirect::to("/");
    };
    let Some(session) = state.sessions.get(session_id).await else {
        info!(%session_id, "Chat posted to an unknown session");
        return Redirect::to("/");
    };

    if form.message.trim().is_empty() {
        return Redirect::to(&session_url(session_id));
    }

    let mut context = session.lock().await;
    match state.handler.answer(&form.message, &mut context).await {
        Ok(_) => Redirect::to(&session_url(session_id)),
        Err(e) => {
            warn!(%session_id, "Message rejected: {}", e);
            Redirect::to(&session_url_with_notice(session_id, &e.user_message()))
        }
    }
}

fn render_turn(turn: &ConversationTurn) -> String {
    let (class, speaker) = match turn.role {
        TurnRole::User => ("turn user", "You"),
        TurnRole::Assistant => ("turn assistant", "Assistant"),
    };
    format!(
        r#"<div class="{}"><div class="meta">{} · {}</div><div class="text">{}</div></div>"#,
        class,
        speaker,
        turn.timestamp.format("%H:%M"),
        encode_text(&turn.text)
    )
}

fn render_page(
    session_id: Uuid,
    profile: &UserProfile,
    turns: &[&ConversationTurn],
    notice: Option<&str>,
) -> String {
    let transcript = if turns.is_empty() {
        r#"<p class="empty">Ask about proposals, clients or follow-ups, e.g. "What's the status of Acme Corp's proposal?"</p>"#
            .to_string()
    } else {
        turns.iter().map(|turn| render_turn(turn)).collect::<Vec<_>>().join("\n")
    };
    let notice = notice
        .map(|text| format!(r#"<p class="notice" role="alert">{}</p>"#, encode_text(text)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Sales CRM Assistant</title>
<style>
  body {{ font-family: system-ui, sans-serif; max-width: 760px; margin: 0 auto; padding: 1rem; background: #f6f7f9; }}
  header h1 {{ margin: 0; font-size: 1.4rem; }}
  header p {{ margin: .25rem 0 1rem; color: #555; }}
  #transcript {{ background: #fff; border: 1px solid #ddd; border-radius: 8px; padding: 1rem; height: 60vh; overflow-y: auto; }}
  .turn {{ margin-bottom: .9rem; }}
  .turn .meta {{ font-size: .75rem; color: #888; }}
  .turn .text {{ white-space: pre-wrap; padding: .5rem .75rem; border-radius: 6px; display: inline-block; }}
  .turn.user .text {{ background: #e3effd; }}
  .turn.assistant .text {{ background: #eef0f2; }}
  .empty {{ color: #888; }}
  .notice {{ margin: .75rem 0 0; padding: .5rem .75rem; border-radius: 6px; background: #fdecea; color: #8a1c12; }}
  form {{ display: flex; gap: .5rem; margin-top: 1rem; }}
  textarea {{ flex: 1; min-height: 3rem; padding: .5rem; }}
  button {{ padding: 0 1.2rem; }}
</style>
</head>
<body>
<header>
  <h1>Sales CRM Assistant</h1>
  <p>Signed in as {name} ({role}) · <a href="/">New chat</a></p>
</header>
<div id="transcript">
{transcript}
</div>
{notice}
<form id="chat-form" method="post" action="/chat">
  <input type="hidden" name="session_id" value="{session_id}">
  <textarea name="message" placeholder="Type your question..." required autofocus></textarea>
  <button id="send" type="submit">Send</button>
</form>
<script>
  const log = document.getElementById("transcript");
  log.scrollTop = log.scrollHeight;
  document.getElementById("chat-form").addEventListener("submit", function () {{
    const button = document.getElementById("send");
    button.disabled = true;
    button.textContent = "Thinking…";
  }});
</script>
</body>
</html>
"#,
        name = encode_text(&profile.display_name),
        role = profile.role(),
        transcript = transcript,
        notice = notice,
        session_id = encode_double_quoted_attribute(&session_id.to_string()),
    )
}
