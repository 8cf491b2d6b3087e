use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_api::middleware::require_auth;
use parley_api::{ApiError, AppState, AppStateInner, auth, conversations, messages, presence};
use parley_db::{Database, Stores};
use parley_gateway::connection::{self, GatewayContext};
use parley_gateway::Broker;
use parley_types::events::ChangeSink;

pub mod config;

use config::ServerConfig;

#[derive(Clone)]
pub struct ServerState {
    pub app: AppState,
    pub gateway: GatewayContext,
}

impl ServerState {
    /// Wire stores to a fresh broker over `db`.
    pub fn new(db: Arc<Database>, config: &ServerConfig) -> Self {
        let broker = Broker::new(config.subscriber_queue);
        let sink: Arc<dyn ChangeSink> = Arc::new(broker.clone());
        let stores = Stores::new(db, sink);

        Self {
            app: Arc::new(AppStateInner {
                stores: stores.clone(),
                jwt_secret: config.jwt_secret.clone(),
            }),
            gateway: GatewayContext {
                broker,
                stores,
                jwt_secret: Arc::from(config.jwt_secret.as_str()),
                heartbeat_interval: config.heartbeat_interval,
            },
        }
    }
}

pub fn build_router(state: ServerState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.app.clone());

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route(
            "/conversations/{partner_id}/messages",
            get(conversations::list_messages).post(conversations::send_message),
        )
        .route("/conversations/{partner_id}/read", post(conversations::mark_conversation_read))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route("/presence/{user_id}", get(presence::get_presence))
        .layer(middleware::from_fn_with_state(state.app.clone(), require_auth))
        .with_state(state.app.clone());

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// With `?token=` the upgrade itself is authenticated; otherwise the client
/// must send `Identify` on the open socket.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match query.token {
        Some(token) => match connection::verify_token(&state.gateway.jwt_secret, &token) {
            Ok(claims) => ws
                .on_upgrade(move |socket| connection::handle_connection_authenticated(socket, state.gateway, claims))
                .into_response(),
            Err(e) => ApiError(e).into_response(),
        },
        None => ws
            .on_upgrade(move |socket| connection::handle_connection(socket, state.gateway))
            .into_response(),
    }
}
