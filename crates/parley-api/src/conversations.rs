use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use parley_types::api::{Claims, MessageQuery, SendMessageRequest, StartConversationRequest};
use parley_types::models::{Conversation, Message, UserId};

use crate::{ApiError, AppState, blocking};

/// `GET /conversations`: the caller's inbox.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let conversations = state.stores.conversations.clone();
    let list = blocking(move || conversations.list_conversations(claims.sub)).await?;
    Ok(Json(list))
}

/// `POST /conversations`: resolve a partner by email. Nothing is persisted
/// until the first message is sent.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let conversations = state.stores.conversations.clone();
    let user = claims.sub;
    let conversation = blocking(move || conversations.start_conversation(user, &req.email)).await?;
    info!("{} opened conversation with {}", claims.email, conversation.partner_id);
    Ok(Json(conversation))
}

/// `GET /conversations/{partner_id}/messages?after_id=`
pub async fn list_messages(
    State(state): State<AppState>,
    Path(partner_id): Path<UserId>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.stores.messages.clone();
    let list =
        blocking(move || messages.list_conversation_after(claims.sub, partner_id, query.after_id)).await?;
    Ok(Json(list))
}

/// `POST /conversations/{partner_id}/messages`
pub async fn send_message(
    State(state): State<AppState>,
    Path(partner_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.stores.messages.clone();
    let message = blocking(move || messages.send(claims.sub, partner_id, &req.content)).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// `POST /conversations/{partner_id}/read`: returns the messages that changed.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(partner_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.stores.messages.clone();
    let changed = blocking(move || messages.mark_conversation_read(claims.sub, partner_id)).await?;
    Ok(Json(changed))
}
