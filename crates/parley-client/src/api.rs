use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use parley_types::api::{ErrorBody, LoginResponse, RegisterResponse};
use parley_types::error::ErrorKind;
use parley_types::models::{Conversation, Message, MessageId, Presence, UserId};
use parley_types::{ChatError, ChatResult};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed client for the REST surface.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> ChatResult<Self> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Internal(format!("http client setup failed: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// True when the server answers `/health`.
    pub async fn health(&self) -> ChatResult<bool> {
        let response = self.http.get(self.url("/health")).send().await.map_err(transport_error)?;
        Ok(response.status().is_success())
    }

    // -- Auth --

    pub async fn register(&self, email: &str, password: &str, display_name: &str) -> ChatResult<RegisterResponse> {
        let body = json!({ "email": email, "password": password, "display_name": display_name });
        self.execute(self.http.post(self.url("/auth/register")).json(&body)).await
    }

    /// Log in and keep the returned token for later calls.
    pub async fn login(&mut self, email: &str, password: &str) -> ChatResult<LoginResponse> {
        let body = json!({ "email": email, "password": password });
        let response: LoginResponse = self.execute(self.http.post(self.url("/auth/login")).json(&body)).await?;
        self.token = Some(response.token.clone());
        Ok(response)
    }

    // -- Conversations --

    pub async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        self.execute(self.authed(self.http.get(self.url("/conversations")))?).await
    }

    pub async fn start_conversation(&self, partner_email: &str) -> ChatResult<Conversation> {
        let req = self.http.post(self.url("/conversations")).json(&json!({ "email": partner_email }));
        self.execute(self.authed(req)?).await
    }

    /// Full history with a partner, or only messages after `after_id`.
    pub async fn list_conversation(&self, partner: UserId, after_id: Option<MessageId>) -> ChatResult<Vec<Message>> {
        let mut req = self.http.get(self.url(&format!("/conversations/{}/messages", partner)));
        if let Some(after_id) = after_id {
            req = req.query(&[("after_id", after_id)]);
        }
        self.execute(self.authed(req)?).await
    }

    pub async fn send_message(&self, partner: UserId, content: &str) -> ChatResult<Message> {
        let req = self
            .http
            .post(self.url(&format!("/conversations/{}/messages", partner)))
            .json(&json!({ "content": content }));
        self.execute(self.authed(req)?).await
    }

    pub async fn mark_read(&self, message_id: MessageId) -> ChatResult<Message> {
        let req = self.http.post(self.url(&format!("/messages/{}/read", message_id)));
        self.execute(self.authed(req)?).await
    }

    pub async fn mark_conversation_read(&self, partner: UserId) -> ChatResult<Vec<Message>> {
        let req = self.http.post(self.url(&format!("/conversations/{}/read", partner)));
        self.execute(self.authed(req)?).await
    }

    /// `None` when the user has never connected.
    pub async fn presence(&self, user: UserId) -> ChatResult<Option<Presence>> {
        let req = self.http.get(self.url(&format!("/presence/{}", user)));
        match self.execute(self.authed(req)?).await {
            Ok(presence) => Ok(Some(presence)),
            Err(ChatError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> ChatResult<RequestBuilder> {
        let token = self.token.as_deref().ok_or(ChatError::Unauthorized)?;
        Ok(req.bearer_auth(token))
    }

    async fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> ChatResult<T> {
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(transport_error);
        }

        let text = response.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ChatError::from_kind(body.error, body.message),
            Err(_) => ChatError::from_kind(kind_for_status(status), text),
        };
        debug!("Request failed with {}: {}", status, err);
        Err(err)
    }
}

/// Fallback when the server did not send an error body.
pub fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::Validation,
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
        StatusCode::FORBIDDEN => ErrorKind::Forbidden,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorKind::Transient,
        s if s.is_server_error() && s != StatusCode::INTERNAL_SERVER_ERROR => ErrorKind::Transient,
        _ => ErrorKind::Internal,
    }
}

fn transport_error(e: reqwest::Error) -> ChatError {
    if e.is_decode() {
        warn!("Undecodable response: {}", e);
        return ChatError::Internal(e.to_string());
    }
    // Timeouts, refused connections, and resets are all worth retrying
    ChatError::Transient(e.to_string())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        assert_eq!(kind_for_status(StatusCode::BAD_REQUEST), ErrorKind::Validation);
        assert_eq!(kind_for_status(StatusCode::CONFLICT), ErrorKind::Conflict);
        assert_eq!(kind_for_status(StatusCode::SERVICE_UNAVAILABLE), ErrorKind::Transient);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::Transient);
        assert_eq!(kind_for_status(StatusCode::INTERNAL_SERVER_ERROR), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn calls_without_a_token_fail_locally() {
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();
        let err = client.list_conversations().await.unwrap_err();
        assert_eq!(err, ChatError::Unauthorized);
    }

    #[tokio::test]
    async fn unresponsive_server_times_out_as_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client = ApiClient::with_timeout(format!("http://{}", addr), Duration::from_millis(200)).unwrap();
        client.set_token("token");
        let err = client.send_message(Uuid::new_v4(), "hello").await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ApiClient::new(format!("http://{}", addr)).unwrap();
        let err = client.register("ada@example.com", "password", "Ada").await.unwrap_err();
        assert!(matches!(err, ChatError::Transient(_)), "{:?}", err);
    }
}
