use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, patch, post},
    Json, Router,
};
use chatwave_shared::{
    AuthProfile, Chat, ChatId, ChatPatch, Message, MessageId, NewChat, NewMessage, NewUser,
    StreamEvent, User, UserId, UserPatch,
};
use chatwave_sync::suggest::{FileSuggester, SuggestRequest, SuggestResponse};
use chatwave_sync::{ChatService, Subscription};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Header carrying the id of the signed-in user, set by the auth proxy.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub suggester: Option<Arc<dyn FileSuggester>>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/session", post(create_session))
        .route("/users", post(create_user).get(list_users))
        .route("/users/stream", get(stream_users))
        .route("/users/:id", get(get_user).patch(update_user))
        .route("/chats", post(create_chat))
        .route("/chats/stream", get(stream_chats))
        .route(
            "/chats/:id",
            get(get_chat).patch(update_chat).delete(delete_chat),
        )
        .route("/chats/:id/members", axum::routing::put(set_members))
        .route("/chats/:id/messages", post(append_message))
        .route("/chats/:id/messages/stream", get(stream_messages))
        .route(
            "/chats/:id/messages/:message_id",
            patch(edit_message).delete(delete_message),
        )
        .route("/suggest/files", post(suggest_files))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

/// The signed-in user making the request.
pub struct Actor(pub UserId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Actor(UserId::from(v)))
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    subscribers: usize,
}

#[derive(Deserialize)]
struct MembersRequest {
    member_ids: BTreeSet<UserId>,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
    #[serde(default)]
    expected_version: Option<u64>,
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    since: Option<u64>,
}

fn sse_event(event: &StreamEvent) -> Event {
    let mut sse = Event::default().event(event.name());
    if let Some(cursor) = event.cursor() {
        sse = sse.id(cursor.to_string());
    }
    sse.json_data(event).unwrap_or_else(|e| {
        warn!(error = %e, "could not encode stream event");
        Event::default().comment("encoding error")
    })
}

fn into_sse(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = subscription
        .into_stream()
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(20)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subscribers: state.service.engine().subscriber_count(),
    })
}

/// Called by the auth layer after sign-in; provisions the user if new.
async fn create_session(
    State(state): State<AppState>,
    Json(profile): Json<AuthProfile>,
) -> ApiResult<Json<User>> {
    let user = state.service.ensure_user(profile).await?;
    info!(user = %user.id, "session started");
    Ok(Json(user))
}

async fn create_user(
    State(state): State<AppState>,
    Json(new): Json<NewUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state.service.create_user(new).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.service.users().await?))
}

async fn stream_users(
    State(state): State<AppState>,
    _actor: Actor,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    Ok(into_sse(state.service.list_users().await?))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<User>> {
    let id = UserId::new(id);
    let user = state
        .service
        .get_user(id.clone())
        .await?
        .ok_or_else(|| chatwave_shared::ChatError::not_found(format!("user {id}")))?;
    Ok(Json(user))
}

async fn update_user(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<String>,
    Json(patch): Json<UserPatch>,
) -> ApiResult<Json<User>> {
    let user = state
        .service
        .update_user(actor, UserId::new(id), patch)
        .await?;
    Ok(Json(user))
}

async fn create_chat(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(new): Json<NewChat>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let chat = state.service.create_chat(actor, new).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn stream_chats(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    Ok(into_sse(state.service.list_chats_for_user(actor).await?))
}

async fn get_chat(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(state.service.get_chat(actor, id).await?))
}

async fn update_chat(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
    Json(patch): Json<ChatPatch>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(state.service.update_details(actor, id, patch).await?))
}

async fn set_members(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
    Json(body): Json<MembersRequest>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(
        state
            .service
            .update_members(actor, id, body.member_ids)
            .await?,
    ))
}

async fn delete_chat(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
) -> ApiResult<StatusCode> {
    state.service.delete_chat(actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn append_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
    Json(new): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state.service.append(actor, id, new).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn edit_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
    Json(body): Json<EditRequest>,
) -> ApiResult<Json<Message>> {
    let message = state
        .service
        .edit(actor, chat_id, message_id, body.content, body.expected_version)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
) -> ApiResult<StatusCode> {
    state
        .service
        .delete_message(actor, chat_id, message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `?since=` wins over a reconnecting browser's `Last-Event-ID`.
async fn stream_messages(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<ChatId>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let since = query.since.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    });
    Ok(into_sse(
        state.service.stream_messages(actor, id, since).await?,
    ))
}

async fn suggest_files(
    State(state): State<AppState>,
    _actor: Actor,
    Json(mut request): Json<SuggestRequest>,
) -> ApiResult<Json<SuggestResponse>> {
    let suggester = state
        .suggester
        .as_ref()
        .ok_or(ApiError::SuggestionsDisabled)?;
    if request.available_files.is_empty() {
        request.available_files = state.config.available_files.clone();
    }

    let suggested_files = suggester
        .suggest(&request)
        .await
        .map_err(|e| ApiError::Suggestion(e.to_string()))?;
    Ok(Json(SuggestResponse { suggested_files }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
