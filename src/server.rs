//! HTTP surface: the chat pipeline plus reset, status, token usage,
//! worksheet and debug routes. All tutoring-taxonomy failures (out of
//! scope, off topic, oversized input, LLM trouble) come back as HTTP 200
//! with in-character text and an `error` marker, so the frontend never has
//! to special-case transport errors for pedagogy.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::TutorConfig;
use crate::curriculum::Curriculum;
use crate::llm_client::LlmClient;
use crate::prompt;
use crate::store::{ConversationKey, SessionStore};
use crate::topic;
use crate::worksheet;

pub struct ServerState {
    pub store: SessionStore,
    pub curriculum: Curriculum,
    pub llm: Option<LlmClient>,
    pub config: TutorConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    year_level: Option<u8>,
    #[serde(default)]
    reset_context: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    year_level: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorksheetRequest {
    topic: String,
    #[serde(default = "default_difficulty")]
    difficulty: String,
    #[serde(default = "default_question_count")]
    question_count: usize,
    #[serde(default)]
    year_level: Option<u16>,
}

fn default_difficulty() -> String {
    "medium".to_string()
}

fn default_question_count() -> usize {
    5
}

pub async fn serve(state: Arc<ServerState>) -> Result<()> {
    let bind_addr = state
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}'", state.config.bind_addr))?;

    spawn_sweeper(state.clone());

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("StudyBuddy backend listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/reset", post(reset_conversation))
        .route("/api/chat/status/:user_id", get(conversation_status))
        .route("/api/user/:user_id/tokens", get(token_usage))
        .route("/api/generate-worksheet", post(generate_worksheet))
        .route("/debug", get(debug_info))
        .with_state(state)
}

/// Periodic eviction of idle conversations.
fn spawn_sweeper(state: Arc<ServerState>) {
    let interval = std::time::Duration::from_secs(state.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = state.store.sweep(Utc::now()).await;
            if evicted > 0 {
                tracing::info!("Cleaned up {} old conversations", evicted);
            }
        }
    });
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "StudyBuddy backend is running!",
        "llmConfigured": state.llm.is_some(),
        "timestamp": Utc::now().to_rfc3339(),
        "activeConversations": state.store.len().await,
        "curriculumLoaded": true,
    }))
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Json<serde_json::Value> {
    let now = Utc::now();
    let message = body.message;
    let user_id = body.user_id.unwrap_or_else(|| "anonymous".to_string());
    let year_level = body.year_level.unwrap_or(state.config.default_year_level);

    tracing::info!("Chat request from {}: {:?}", user_id, message);

    let most_recent = state.store.most_recent_for_user(&user_id).await;
    let prior_subject = most_recent.as_ref().map(|(_, record)| record.subject.as_str());

    let detected_topic = topic::resolve_topic(&message, prior_subject, &state.curriculum);
    tracing::info!("Detected topic: {}", detected_topic);

    let scope = topic::check_scope(&message, &detected_topic, &state.curriculum);

    // Definition requests for known Year 7 terms short-circuit the rest of
    // the pipeline and always file under the algebra conversation.
    if let Some(term) = &scope.definition_request {
        if let Some(definition) = topic::definition_for(term) {
            tracing::info!("Providing Socratic definition for: {}", term);

            let key = ConversationKey::new(&user_id, "Algebra & Equations", year_level);
            let mut record = match state.store.get(&key).await {
                Some(record) => record,
                None => {
                    let mut record = crate::store::ConversationRecord::new(
                        &user_id,
                        "Algebra & Equations",
                        year_level,
                        now,
                    );
                    record.curriculum_loaded = true;
                    record.last_curriculum_topic = Some("Algebra & Equations".to_string());
                    record
                }
            };
            record.append("user", &message, now);
            record.append("assistant", definition.socratic, now);
            let conversation_length = record.messages.len();
            state.store.put(record).await;

            return Json(json!({
                "response": definition.socratic,
                "subject": "Algebra & Equations",
                "detectedTopic": "Algebra & Equations",
                "yearLevel": year_level,
                "conversationLength": conversation_length,
                "conversationId": key.to_string(),
                "definitionProvided": term,
                "definitionContext": definition.context,
            }));
        }
    }

    if !scope.in_scope {
        tracing::info!("Out of Year 7 scope: {}", detected_topic);
        return Json(json!({
            "response": scope.refusal,
            "error": "out_of_scope",
            "detectedTopic": detected_topic,
            "yearLevel": year_level,
        }));
    }

    let (key, mut record) = state
        .store
        .resolve(&user_id, &detected_topic, year_level, body.reset_context, now)
        .await;

    let input_tokens = topic::estimate_tokens(&message);
    if input_tokens > state.config.max_input_tokens {
        return Json(json!({
            "response": "That's quite a lot to work with! Can you break that down and ask me about just one part of your problem? What's the main thing you're stuck on?",
            "error": "input_too_long",
        }));
    }

    if !topic::is_on_topic(&message) {
        return Json(json!({
            "response": "I'm here to help you discover answers in Year 7 mathematics! What specific math problem or concept would you like to explore? What are you curious about?",
            "error": "off_topic",
        }));
    }

    let Some(llm) = &state.llm else {
        // Offline mode still walks the fraction-conversion scaffold. The
        // fraction comes from the current message or from an earlier user
        // message in the conversation, so follow-up answers advance the
        // walk instead of restarting it; other questions get a generic
        // Socratic opener.
        let active_fraction = topic::fraction_to_decimal_request(&message).or_else(|| {
            record
                .messages
                .iter()
                .rev()
                .filter(|m| m.role == "user")
                .find_map(|m| topic::fraction_to_decimal_request(&m.content))
        });
        let response = match active_fraction {
            Some(fraction) => topic::fraction_scaffold_question(&fraction, Some(&message)),
            None => format!(
                "Great question about {}! What do you think might be the first step? What comes to mind when you look at this problem? (Configure llm_api_url for AI responses)",
                detected_topic
            ),
        };

        record.append("user", &message, now);
        record.append("assistant", &response, now);
        let conversation_length = record.messages.len();
        state.store.put(record).await;

        return Json(json!({
            "response": response,
            "fallback": true,
            "conversationLength": conversation_length,
            "conversationId": key.to_string(),
        }));
    };

    record.append("user", &message, now);
    tracing::debug!("Added message. Total messages: {}", record.messages.len());

    let wire_messages = prompt::prepare_history(&record, &detected_topic, &state.curriculum);
    record.curriculum_loaded = true;
    record.last_curriculum_topic = Some(detected_topic.clone());

    let system_prompt = prompt::build_system_prompt(&record.subject, &state.curriculum);
    tracing::debug!(
        "Sending {} messages to LLM for {}",
        wire_messages.len(),
        record.subject
    );

    let completion = match llm.generate(&system_prompt, wire_messages).await {
        Ok(completion) => completion,
        Err(error) => {
            tracing::error!("LLM error: {}", error);
            return Json(json!({
                "response": "I'm having a technical hiccup right now. While I sort this out, can you tell me what you were thinking about that problem? What approach were you considering?",
                "error": true,
                "fallback": true,
            }));
        }
    };

    let actual_input = if completion.input_tokens > 0 {
        completion.input_tokens
    } else {
        input_tokens
    };
    let actual_output = if completion.output_tokens > 0 {
        completion.output_tokens
    } else {
        topic::estimate_tokens(&completion.text)
    };

    record.append("assistant", &completion.text, now);
    record.total_tokens += actual_input + actual_output;

    let conversation_length = record.messages.len();
    let conversation_total = record.total_tokens;
    let conversation_age_minutes = (now - record.created_at).num_minutes();

    state.store.put(record).await;
    let usage = state.store.add_tokens(&user_id, actual_input + actual_output).await;
    state.store.cleanup_user(&user_id, now).await;

    tracing::info!(
        "Tokens - input: {}, output: {}, user total: {}/{}",
        actual_input,
        actual_output,
        usage.used,
        usage.limit
    );

    Json(json!({
        "response": completion.text,
        "subject": detected_topic,
        "detectedTopic": detected_topic,
        "yearLevel": year_level,
        "conversationLength": conversation_length,
        "conversationAge": conversation_age_minutes,
        "conversationId": key.to_string(),
        "tokens": {
            "input": actual_input,
            "output": actual_output,
            "conversationTotal": conversation_total,
            "totalUsed": usage.used,
            "limit": usage.limit,
        },
    }))
}

async fn reset_conversation(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ResetRequest>,
) -> Json<serde_json::Value> {
    let user_id = body.user_id.unwrap_or_else(|| "anonymous".to_string());
    let subject = body.subject.unwrap_or_else(|| topic::DEFAULT_TOPIC.to_string());
    let year_level = body.year_level.unwrap_or(state.config.default_year_level);
    let key = ConversationKey::new(&user_id, &subject, year_level);

    let existed = state.store.delete(&key).await;
    tracing::info!("Conversation reset requested for {}", key);

    Json(json!({
        "success": true,
        "message": if existed {
            "Conversation context reset - ready for a fresh start!"
        } else {
            "No existing conversation found"
        },
        "conversationId": key.to_string(),
    }))
}

async fn conversation_status(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let now = Utc::now();
    let conversations: Vec<serde_json::Value> = state
        .store
        .conversations_for_user(&user_id)
        .await
        .into_iter()
        .map(|(key, record)| {
            json!({
                "id": key.to_string(),
                "subject": record.subject,
                "yearLevel": record.year_level,
                "messageCount": record.messages.len(),
                "totalTokens": record.total_tokens,
                "createdAt": record.created_at,
                "lastActive": record.last_active,
                "ageInMinutes": (now - record.created_at).num_minutes(),
                "curriculumLoaded": record.curriculum_loaded,
                "lastCurriculumTopic": record.last_curriculum_topic,
            })
        })
        .collect();

    Json(json!({
        "totalConversations": conversations.len(),
        "conversations": conversations,
        "totalActiveConversations": state.store.len().await,
    }))
}

async fn token_usage(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let usage = state.store.usage_for(&user_id).await;
    let percentage = if usage.limit > 0 {
        (usage.used as f64 / usage.limit as f64 * 100.0).round() as u64
    } else {
        0
    };
    Json(json!({
        "tokensUsed": usage.used,
        "tokensLimit": usage.limit,
        "percentage": percentage,
    }))
}

async fn generate_worksheet(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<WorksheetRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let year_level = body
        .year_level
        .unwrap_or(state.config.default_year_level as u16);

    let latex = worksheet::generate_worksheet(
        state.llm.as_ref(),
        &state.curriculum,
        &body.topic,
        &body.difficulty,
        body.question_count,
        year_level,
    )
    .await
    .map_err(|error| {
        tracing::error!("Worksheet generation error: {}", error);
        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    })?;

    let questions = worksheet::latex_to_plain_text(&latex);

    Ok(Json(json!({
        "latex": latex,
        "questions": questions,
    })))
}

async fn debug_info(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({
        "llmConfigured": state.llm.is_some(),
        "model": state.llm.as_ref().map(|llm| llm.model().to_string()),
        "conversations": {
            "active": state.store.len().await,
            "subjects": state.store.subject_counts().await,
        },
        "curriculum": {
            "version": state.curriculum.meta.version,
            "topics": state.curriculum.topic_catalog.len(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn offline_state() -> Arc<ServerState> {
        let config = TutorConfig::default();
        Arc::new(ServerState {
            store: SessionStore::new(&config),
            curriculum: Curriculum::embedded().unwrap(),
            llm: None,
            config,
        })
    }

    fn state_with_llm(api_url: &str) -> Arc<ServerState> {
        let config = TutorConfig::default();
        Arc::new(ServerState {
            store: SessionStore::new(&config),
            curriculum: Curriculum::embedded().unwrap(),
            llm: Some(LlmClient::new(
                api_url.to_string(),
                String::new(),
                "test-model".to_string(),
                180,
            )),
            config,
        })
    }

    async fn post_json(
        state: Arc<ServerState>,
        uri: &str,
        body: serde_json::Value,
    ) -> serde_json::Value {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_json(state: Arc<ServerState>, uri: &str) -> serde_json::Value {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_routes_equation_to_algebra_and_creates_conversation() {
        let state = offline_state();
        let body = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "solve 2x + 5 = 15", "userId": "maya" }),
        )
        .await;

        assert!(body.get("error").is_none());
        assert_eq!(body["fallback"], true);
        assert!(body["response"]
            .as_str()
            .unwrap()
            .contains("Algebra & Equations"));

        let key = ConversationKey::new("maya", "Algebra & Equations", 7);
        assert!(state.store.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn chat_serves_socratic_definition() {
        let state = offline_state();
        let body = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "what is a coefficient?", "userId": "maya" }),
        )
        .await;

        assert_eq!(body["definitionProvided"], "coefficient");
        assert_eq!(body["detectedTopic"], "Algebra & Equations");
        assert_eq!(body["conversationLength"], 2);
        assert!(body["response"].as_str().unwrap().contains("3x + 5"));
        assert!(body["definitionContext"]
            .as_str()
            .unwrap()
            .contains("multiplies the variable"));
    }

    #[tokio::test]
    async fn chat_refuses_out_of_scope_requests() {
        let state = offline_state();
        let body = post_json(
            state,
            "/api/chat",
            json!({ "message": "tell me a bedtime legend", "userId": "maya" }),
        )
        .await;

        assert_eq!(body["error"], "out_of_scope");
        assert!(body["response"].as_str().unwrap().contains("Year 7"));
    }

    #[tokio::test]
    async fn chat_rejects_oversized_input_without_storing_it() {
        let state = offline_state();
        let long_message = format!("solve {}", "x + 1 = 2 and then ".repeat(300));
        let body = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": long_message, "userId": "maya" }),
        )
        .await;

        assert_eq!(body["error"], "input_too_long");

        // The resolved record exists but the oversized message was never
        // appended.
        let key = ConversationKey::new("maya", "Algebra & Equations", 7);
        let record = state.store.get(&key).await.unwrap();
        assert!(record.messages.is_empty());
    }

    #[tokio::test]
    async fn chat_deflects_off_topic_messages() {
        let state = offline_state();
        let body = post_json(
            state,
            "/api/chat",
            json!({ "message": "let's discuss politics and solve nothing", "userId": "maya" }),
        )
        .await;

        assert_eq!(body["error"], "off_topic");
    }

    #[tokio::test]
    async fn offline_chat_walks_fraction_scaffold() {
        let state = offline_state();
        let body = post_json(
            state,
            "/api/chat",
            json!({ "message": "can you convert 1/3 to a decimal", "userId": "maya" }),
        )
        .await;

        assert_eq!(body["fallback"], true);
        assert!(body["response"]
            .as_str()
            .unwrap()
            .contains("10, 100, or 1000"));
    }

    #[tokio::test]
    async fn offline_fraction_scaffold_advances_across_turns() {
        let state = offline_state();
        let first = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "can you convert 1/3 to a decimal", "userId": "maya" }),
        )
        .await;
        assert!(first["response"]
            .as_str()
            .unwrap()
            .contains("10, 100, or 1000"));
        assert_eq!(first["conversationLength"], 2);

        // The follow-up answer continues from the fraction mentioned in the
        // first turn rather than restarting the walk.
        let second = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "we use long division", "userId": "maya" }),
        )
        .await;
        assert!(second["response"]
            .as_str()
            .unwrap()
            .contains("can't divide yet"));
        assert_eq!(second["conversationLength"], 4);

        let key = ConversationKey::new("maya", "Fractions & Percentages", 7);
        let record = state.store.get(&key).await.unwrap();
        assert_eq!(record.messages.len(), 4);
        assert_eq!(record.messages[0].content, "can you convert 1/3 to a decimal");
    }

    #[tokio::test]
    async fn chat_round_trip_through_llm_updates_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": "What could you subtract from both sides first?"
                }}],
                "usage": { "prompt_tokens": 50, "completion_tokens": 12 }
            })))
            .mount(&server)
            .await;

        let state = state_with_llm(&server.uri());
        let body = post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "solve 2x + 5 = 15", "userId": "maya" }),
        )
        .await;

        assert!(body["response"].as_str().unwrap().contains("subtract"));
        assert_eq!(body["tokens"]["input"], 50);
        assert_eq!(body["tokens"]["output"], 12);
        assert_eq!(body["tokens"]["totalUsed"], 62);
        assert_eq!(body["conversationLength"], 2);

        let key = ConversationKey::new("maya", "Algebra & Equations", 7);
        let record = state.store.get(&key).await.unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.total_tokens, 62);
    }

    #[tokio::test]
    async fn llm_failure_returns_in_character_deflection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let state = state_with_llm(&server.uri());
        let body = post_json(
            state,
            "/api/chat",
            json!({ "message": "solve 2x + 5 = 15", "userId": "maya" }),
        )
        .await;

        assert_eq!(body["error"], true);
        assert_eq!(body["fallback"], true);
        assert!(body["response"].as_str().unwrap().contains("hiccup"));
    }

    #[tokio::test]
    async fn reset_endpoint_reports_whether_conversation_existed() {
        let state = offline_state();
        post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "solve 2x + 5 = 15", "userId": "maya" }),
        )
        .await;

        let body = post_json(
            state.clone(),
            "/api/chat/reset",
            json!({ "userId": "maya", "subject": "Algebra & Equations", "yearLevel": 7 }),
        )
        .await;
        assert_eq!(body["success"], true);
        assert!(body["message"].as_str().unwrap().contains("fresh start"));

        let again = post_json(
            state,
            "/api/chat/reset",
            json!({ "userId": "maya", "subject": "Algebra & Equations", "yearLevel": 7 }),
        )
        .await;
        assert_eq!(again["message"], "No existing conversation found");
    }

    #[tokio::test]
    async fn status_endpoint_lists_user_conversations() {
        let state = offline_state();
        post_json(
            state.clone(),
            "/api/chat",
            json!({ "message": "solve 2x + 5 = 15", "userId": "maya" }),
        )
        .await;

        let body = get_json(state, "/api/chat/status/maya").await;
        assert_eq!(body["totalConversations"], 1);
        assert_eq!(body["conversations"][0]["subject"], "Algebra & Equations");
    }

    #[tokio::test]
    async fn token_endpoint_reports_fresh_usage() {
        let state = offline_state();
        let body = get_json(state, "/api/user/maya/tokens").await;
        assert_eq!(body["tokensUsed"], 0);
        assert_eq!(body["tokensLimit"], 5000);
        assert_eq!(body["percentage"], 0);
    }

    #[tokio::test]
    async fn worksheet_endpoint_returns_latex_and_plain_questions() {
        let state = offline_state();
        let body = post_json(
            state,
            "/api/generate-worksheet",
            json!({ "topic": "Algebra", "difficulty": "easy", "questionCount": 3 }),
        )
        .await;

        assert!(body["latex"].as_str().unwrap().contains("\\begin{enumerate}"));
        assert_eq!(body["questions"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn health_and_debug_report_runtime_shape() {
        let state = offline_state();
        let health = get_json(state.clone(), "/").await;
        assert_eq!(health["llmConfigured"], false);
        assert_eq!(health["activeConversations"], 0);

        let debug = get_json(state, "/debug").await;
        assert_eq!(debug["curriculum"]["topics"], 7);
        assert!(debug["model"].is_null());
    }
}
