use axum::{
    Json,
    extract::{Path, State},
};

use parley_types::ChatError;
use parley_types::models::{Presence, UserId};

use crate::{ApiError, AppState, blocking};

/// `GET /presence/{user_id}`
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Presence>, ApiError> {
    let presence = state.stores.presence.clone();
    let record = blocking(move || presence.get(user_id))
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("no presence recorded for {}", user_id)))?;
    Ok(Json(record))
}
