use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use parley_types::{ChatError, ChatResult};

use crate::{ApiError, AppState, blocking};

const TOKEN_LIFETIME_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 8;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ChatError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        ))
        .into());
    }

    let users = state.stores.users.clone();
    let user = blocking(move || {
        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| ChatError::Internal(format!("password hashing failed: {}", e)))?
            .to_string();
        users.create(&req.email, &req.display_name, &password_hash)
    })
    .await?;

    let token = create_token(&state.jwt_secret, user.id, &user.email)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let users = state.stores.users.clone();
    let user = blocking(move || {
        let row = users
            .credentials_by_email(&req.email)?
            .ok_or(ChatError::Unauthorized)?;

        let parsed_hash = PasswordHash::new(&row.password)
            .map_err(|e| ChatError::Internal(format!("stored password hash is invalid: {}", e)))?;
        if Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .is_err()
        {
            warn!("Failed login for {}", row.email);
            return Err(ChatError::Unauthorized);
        }
        row.to_user()
    })
    .await?;

    let token = create_token(&state.jwt_secret, user.id, &user.email)?;
    info!("{} ({}) logged in", user.email, user.id);
    Ok(Json(LoginResponse {
        user_id: user.id,
        display_name: user.display_name,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, email: &str) -> ChatResult<String> {
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ChatError::Internal(format!("token encoding failed: {}", e)))
}
