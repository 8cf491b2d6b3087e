use axum::{
    Extension, Json,
    extract::{Path, State},
};

use parley_types::api::Claims;
use parley_types::models::{Message, MessageId};

use crate::{ApiError, AppState, blocking};

/// `POST /messages/{id}/read`. Only the receiver may mark a message read;
/// repeating the call returns the stored message unchanged.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Message>, ApiError> {
    let messages = state.stores.messages.clone();
    let message = blocking(move || messages.mark_read(message_id, claims.sub)).await?;
    Ok(Json(message))
}
