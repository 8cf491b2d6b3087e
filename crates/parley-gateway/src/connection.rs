use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use parley_db::Stores;
use parley_types::api::Claims;
use parley_types::error::ErrorKind;
use parley_types::events::{ChangeEvent, GatewayCommand, GatewayEvent};
use parley_types::models::{MessageId, MessageStatus, UserId};
use parley_types::{ChatError, ChatResult};

use crate::broker::{Broker, ConnectionId};

/// How long an unauthenticated socket may take to send `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive unanswered pings before the socket is dropped.
const MAX_MISSED_HEARTBEATS: u8 = 2;

/// Everything a gateway connection needs, cloned once per socket.
#[derive(Clone)]
pub struct GatewayContext {
    pub broker: Broker,
    pub stores: Stores,
    pub jwt_secret: Arc<str>,
    pub heartbeat_interval: Duration,
}

/// Validate a bearer token and return its claims.
pub fn verify_token(jwt_secret: &str, token: &str) -> ChatResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Token rejected: {}", e);
        ChatError::Unauthorized
    })
}

/// Handle a socket whose token was already checked on the HTTP upgrade.
pub async fn handle_connection_authenticated(socket: WebSocket, ctx: GatewayContext, claims: Claims) {
    let (mut sender, receiver) = socket.split();
    info!("{} ({}) connected to gateway (pre-authenticated)", claims.email, claims.sub);

    if !send_ready(&mut sender, &claims).await {
        return;
    }
    run_connection_loop(sender, receiver, ctx, claims).await;
}

/// Handle a socket that must authenticate with an `Identify` command first.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match wait_for_identify(&mut receiver, &ctx.jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let _ = send_event(
                &mut sender,
                &GatewayEvent::Error {
                    kind: ErrorKind::Unauthorized,
                    message: "identify failed".into(),
                },
            )
            .await;
            return;
        }
    };
    info!("{} ({}) connected to gateway", claims.email, claims.sub);

    if !send_ready(&mut sender, &claims).await {
        return;
    }
    run_connection_loop(sender, receiver, ctx, claims).await;
}

async fn send_ready(sender: &mut SplitSink<WebSocket, Message>, claims: &Claims) -> bool {
    let ready = GatewayEvent::Ready {
        user_id: claims.sub,
        email: claims.email.clone(),
    };
    send_event(sender, &ready).await
}

/// Serialize and send one event. Returns false when the socket is gone.
async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            // Unencodable events are skipped, the socket stays up
            warn!("Failed to encode gateway event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    ctx: GatewayContext,
    claims: Claims,
) {
    let user_id = claims.sub;
    let email = claims.email;

    let (conn_id, mut deliveries) = ctx.broker.connect(user_id);

    let presence = ctx.stores.presence.clone();
    if let Err(e) = blocking(move || presence.set_online(user_id, true)).await {
        warn!("Failed to mark {} online: {}", user_id, e);
    }

    // Replies to commands, interleaved with deliveries by the send task
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let send_ctx = ctx.clone();
    let heartbeat_interval = ctx.heartbeat_interval;
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else { break };
                    let undelivered = newly_received(user_id, &delivery.event);
                    let event = GatewayEvent::Change {
                        subscription: delivery.subscription,
                        event: delivery.event,
                    };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                    if let Some(id) = undelivered {
                        acknowledge_delivery(&send_ctx, user_id, id);
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if !send_event(&mut sender, &reply).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                            warn!("Heartbeat timeout for {} (missed {} pongs), dropping connection", user_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_ctx = ctx.clone();
    let email_recv = email.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_ctx, conn_id, user_id, cmd, &reply_tx).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            email_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let _ = reply_tx.send(GatewayEvent::Error {
                            kind: ErrorKind::Validation,
                            message: format!("bad command: {}", e),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    let presence = recv_ctx.stores.presence.clone();
                    let result = blocking(move || {
                        // Swept while the socket was still alive
                        if !presence.heartbeat(user_id)? {
                            presence.set_online(user_id, true)?;
                        }
                        Ok(())
                    })
                    .await;
                    if let Err(e) = result {
                        debug!("Presence heartbeat for {} failed: {}", user_id, e);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    teardown(&ctx, conn_id, user_id).await;
    info!("{} ({}) disconnected from gateway", email, user_id);
}

/// Drop broker state and, when this was the user's last socket, their
/// presence and typing state.
async fn teardown(ctx: &GatewayContext, conn_id: ConnectionId, user_id: UserId) {
    ctx.broker.disconnect(conn_id);
    if ctx.broker.connections_of(user_id) > 0 {
        debug!("{} still has live connections", user_id);
        return;
    }

    let stores = ctx.stores.clone();
    let result = blocking(move || {
        let cleared = stores.typing.clear_all_for(user_id)?;
        stores.presence.set_online(user_id, false)?;
        stores.conversations.forget(user_id);
        Ok(cleared.len())
    })
    .await;
    match result {
        Ok(cleared) => trace!("{} offline, cleared {} typing indicators", user_id, cleared),
        Err(e) => warn!("Failed to clean up after {}: {}", user_id, e),
    }
}

/// A message pushed to its receiver moves from sent to delivered.
/// Id of a message pushed to its receiver for the first time.
fn newly_received(user_id: UserId, event: &ChangeEvent) -> Option<MessageId> {
    let ChangeEvent::MessageInserted { message } = event else {
        return None;
    };
    (message.receiver_id == user_id && message.status == MessageStatus::Sent).then_some(message.id)
}

fn acknowledge_delivery(ctx: &GatewayContext, user_id: UserId, id: MessageId) {
    let messages = ctx.stores.messages.clone();
    tokio::spawn(async move {
        if let Err(e) = blocking(move || messages.mark_delivered(id, user_id)).await {
            debug!("Failed to mark message {} delivered: {}", id, e);
        }
    });
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Claims> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg
                && let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text)
            {
                return verify_token(jwt_secret, &token).ok();
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

async fn handle_command(
    ctx: &GatewayContext,
    conn_id: ConnectionId,
    user_id: UserId,
    cmd: GatewayCommand,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
) {
    let response = match execute_command(ctx, conn_id, user_id, cmd).await {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => GatewayEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        },
    };
    let _ = reply.send(response);
}

/// Run one command and produce the reply, if it has one.
pub(crate) async fn execute_command(
    ctx: &GatewayContext,
    conn_id: ConnectionId,
    user_id: UserId,
    cmd: GatewayCommand,
) -> ChatResult<Option<GatewayEvent>> {
    match cmd {
        GatewayCommand::Identify { .. } => Ok(None), // Already handled

        GatewayCommand::Subscribe { filter } => {
            if !filter.authorized_for(user_id) {
                return Err(ChatError::Forbidden(format!(
                    "{} may not subscribe to {:?}",
                    user_id, filter
                )));
            }
            let subscription = ctx.broker.subscribe(conn_id, filter.clone())?;
            Ok(Some(GatewayEvent::Subscribed { subscription, filter }))
        }

        GatewayCommand::Unsubscribe { subscription } => {
            // Handles held by other connections are treated as unknown
            if ctx.broker.owner_of(subscription) == Some(conn_id) {
                ctx.broker.unsubscribe(subscription);
            }
            Ok(Some(GatewayEvent::Unsubscribed { subscription }))
        }

        GatewayCommand::SetTyping { partner_id, is_typing } => {
            let typing = ctx.stores.typing.clone();
            match blocking(move || typing.set_typing(user_id, partner_id, is_typing)).await {
                Ok(_) => Ok(None),
                Err(e @ ChatError::Validation(_)) => Err(e),
                Err(e) => {
                    // Typing is best effort
                    debug!("Typing update from {} dropped: {}", user_id, e);
                    Ok(None)
                }
            }
        }
    }
}

/// Run a synchronous store call off the async executor.
pub(crate) async fn blocking<F, T>(f: F) -> ChatResult<T>
where
    F: FnOnce() -> ChatResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Internal(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use parley_db::Database;
    use parley_types::events::{ChangeSink, SubscriptionFilter};

    use super::*;

    fn context() -> GatewayContext {
        let broker = Broker::new(64);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sink: Arc<dyn ChangeSink> = Arc::new(broker.clone());
        GatewayContext {
            broker,
            stores: Stores::new(db, sink),
            jwt_secret: Arc::from("test-secret"),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    fn token(secret: &str, sub: UserId, exp: usize) -> String {
        use jsonwebtoken::{EncodingKey, Header, encode};
        let claims = Claims { sub, email: "ada@example.com".into(), exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn verify_token_checks_signature_and_expiry() {
        let user = uuid::Uuid::new_v4();
        let future = (chrono::Utc::now().timestamp() + 3600) as usize;

        let claims = verify_token("s3cret", &token("s3cret", user, future)).unwrap();
        assert_eq!(claims.sub, user);

        let err = verify_token("other", &token("s3cret", user, future)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = verify_token("s3cret", &token("s3cret", user, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn only_fresh_incoming_messages_need_acknowledging() {
        let (ada, bob) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let message = |status| parley_types::models::Message {
            id: 5,
            sender_id: bob,
            receiver_id: ada,
            content: "hi".into(),
            status,
            created_at: chrono::Utc::now(),
            read_at: None,
        };

        let inserted = ChangeEvent::MessageInserted { message: message(MessageStatus::Sent) };
        assert_eq!(newly_received(ada, &inserted), Some(5));
        assert_eq!(newly_received(bob, &inserted), None);

        let updated = ChangeEvent::MessageUpdated { message: message(MessageStatus::Sent) };
        assert_eq!(newly_received(ada, &updated), None);
        let delivered = ChangeEvent::MessageInserted { message: message(MessageStatus::Delivered) };
        assert_eq!(newly_received(ada, &delivered), None);
    }

    #[tokio::test]
    async fn subscribe_rejects_foreign_filters() {
        let ctx = context();
        let (me, other) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let (conn, _rx) = ctx.broker.connect(me);

        let err = execute_command(
            &ctx,
            conn,
            me,
            GatewayCommand::Subscribe { filter: SubscriptionFilter::Incoming { user_id: other } },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(ctx.broker.subscriptions_of(conn).is_empty());

        let reply = execute_command(
            &ctx,
            conn,
            me,
            GatewayCommand::Subscribe { filter: SubscriptionFilter::Presence },
        )
        .await
        .unwrap();
        assert!(matches!(reply, Some(GatewayEvent::Subscribed { filter: SubscriptionFilter::Presence, .. })));
    }

    #[tokio::test]
    async fn unsubscribe_ignores_handles_of_other_connections() {
        let ctx = context();
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let (conn_a, _rx_a) = ctx.broker.connect(a);
        let (conn_b, _rx_b) = ctx.broker.connect(b);
        let handle = ctx.broker.subscribe(conn_a, SubscriptionFilter::Presence).unwrap();

        let reply = execute_command(&ctx, conn_b, b, GatewayCommand::Unsubscribe { subscription: handle })
            .await
            .unwrap();
        assert!(matches!(reply, Some(GatewayEvent::Unsubscribed { .. })));
        assert_eq!(ctx.broker.owner_of(handle), Some(conn_a));

        execute_command(&ctx, conn_a, a, GatewayCommand::Unsubscribe { subscription: handle })
            .await
            .unwrap();
        assert_eq!(ctx.broker.owner_of(handle), None);
    }

    #[tokio::test]
    async fn self_typing_is_reported() {
        let ctx = context();
        let me = uuid::Uuid::new_v4();
        let (conn, _rx) = ctx.broker.connect(me);

        let err = execute_command(&ctx, conn, me, GatewayCommand::SetTyping { partner_id: me, is_typing: true })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
