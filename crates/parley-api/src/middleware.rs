use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};

use parley_gateway::connection::verify_token;
use parley_types::ChatError;

use crate::{ApiError, AppState};

/// Extract and validate the bearer JWT, then expose its `Claims` as an extension.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ChatError::Unauthorized)?;

    let claims = verify_token(&state.jwt_secret, bearer.token())?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
