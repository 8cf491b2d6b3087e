use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::error::ErrorKind;
use parley_types::events::{ChangeEvent, GatewayCommand, GatewayEvent, SubscriptionFilter, SubscriptionHandle};
use parley_types::models::UserId;

use crate::typing::TypingOutbox;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, WsMessage>;

/// Delay before reconnect attempt `attempt` (0-based): doubling, capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// What a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { user_id: UserId },
    Change { subscription: SubscriptionHandle, event: ChangeEvent },
    /// Events may have been missed while offline. Reload the history with
    /// `partner`, or the conversation list when `None`.
    Resync { partner: Option<UserId> },
    Error { kind: ErrorKind, message: String },
    Disconnected,
}

enum Outgoing {
    Subscribe(SubscriptionFilter),
    Unsubscribe(SubscriptionFilter),
    Typing { partner: UserId, is_typing: bool },
}

/// A gateway connection that survives drops.
///
/// Filters passed to `subscribe` are remembered and re-registered after every
/// reconnect. Deliveries lost in between are not replayed; a `Resync` event
/// is emitted instead so the caller can reload from the REST API.
#[derive(Clone)]
pub struct GatewaySession {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    filters: Arc<Mutex<Vec<SubscriptionFilter>>>,
    shutdown: CancellationToken,
}

impl GatewaySession {
    /// Start connecting to `url` (e.g. `ws://host:3000/gateway`) in the background.
    pub fn connect(url: impl Into<String>, token: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            outgoing,
            filters: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
        };

        let url = format!("{}?token={}", url.into(), token.into());
        tokio::spawn(run(
            url,
            session.filters.clone(),
            outgoing_rx,
            events_tx,
            session.shutdown.clone(),
        ));
        (session, events_rx)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) {
        let mut filters = lock(&self.filters);
        if !filters.contains(&filter) {
            filters.push(filter.clone());
            let _ = self.outgoing.send(Outgoing::Subscribe(filter));
        }
    }

    pub fn unsubscribe(&self, filter: &SubscriptionFilter) {
        let mut filters = lock(&self.filters);
        let before = filters.len();
        filters.retain(|f| f != filter);
        if filters.len() != before {
            let _ = self.outgoing.send(Outgoing::Unsubscribe(filter.clone()));
        }
    }

    pub fn filters(&self) -> Vec<SubscriptionFilter> {
        lock(&self.filters).clone()
    }

    /// Stop reconnecting and close the socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl TypingOutbox for GatewaySession {
    fn set_typing(&self, partner: UserId, is_typing: bool) {
        let _ = self.outgoing.send(Outgoing::Typing { partner, is_typing });
    }
}

fn lock(filters: &Mutex<Vec<SubscriptionFilter>>) -> MutexGuard<'_, Vec<SubscriptionFilter>> {
    filters.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(
    url: String,
    filters: Arc<Mutex<Vec<SubscriptionFilter>>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut resumed = false;

    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((socket, _)) => {
                debug!("Gateway socket open");
                let outcome = drive(socket, &filters, &mut outgoing, &events, &shutdown, resumed).await;
                if outcome.ready {
                    attempt = 0;
                    resumed = true;
                }
                let _ = events.send(SessionEvent::Disconnected);
                if outcome.stop {
                    break;
                }
            }
            Err(e) => warn!("Gateway connect failed: {}", e),
        }

        if events.is_closed() {
            break;
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        info!("Gateway reconnecting in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Gateway session finished");
}

struct Outcome {
    /// The server accepted the connection
    ready: bool,
    /// The owner is gone or asked to close
    stop: bool,
}

async fn drive(
    socket: Socket,
    filters: &Mutex<Vec<SubscriptionFilter>>,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    shutdown: &CancellationToken,
    resumed: bool,
) -> Outcome {
    let (mut sink, mut stream) = socket.split();
    let mut outcome = Outcome { ready: false, stop: false };
    let mut handles: HashMap<SubscriptionFilter, SubscriptionHandle> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                outcome.stop = true;
                break;
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Gateway read error: {}", e);
                        break;
                    }
                };
                let event = match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Ignoring undecodable gateway event: {}", e);
                        continue;
                    }
                };

                match event {
                    GatewayEvent::Ready { user_id, email } => {
                        info!("Gateway ready as {} ({})", email, user_id);
                        outcome.ready = true;
                        let _ = events.send(SessionEvent::Connected { user_id });

                        // Queued subscription changes are superseded by the
                        // remembered filters. Typing state still has to reach
                        // the server, latest per partner.
                        let mut typing: BTreeMap<UserId, bool> = BTreeMap::new();
                        let remembered = {
                            let filters = lock(filters);
                            while let Ok(cmd) = outgoing.try_recv() {
                                if let Outgoing::Typing { partner, is_typing } = cmd {
                                    typing.insert(partner, is_typing);
                                }
                            }
                            filters.clone()
                        };
                        for filter in &remembered {
                            if !send_command(&mut sink, &GatewayCommand::Subscribe { filter: filter.clone() }).await {
                                return outcome;
                            }
                        }
                        for (partner_id, is_typing) in typing {
                            if !send_command(&mut sink, &GatewayCommand::SetTyping { partner_id, is_typing }).await {
                                return outcome;
                            }
                        }
                        if resumed {
                            let _ = events.send(SessionEvent::Resync { partner: None });
                            let partners: BTreeSet<UserId> = remembered.iter().filter_map(|f| f.partner()).collect();
                            for partner in partners {
                                let _ = events.send(SessionEvent::Resync { partner: Some(partner) });
                            }
                        }
                    }
                    GatewayEvent::Subscribed { subscription, filter } => {
                        let wanted = lock(filters).contains(&filter);
                        if wanted && !handles.contains_key(&filter) {
                            handles.insert(filter, subscription);
                        } else {
                            // Dropped while the reply was in flight, or a duplicate
                            if !send_command(&mut sink, &GatewayCommand::Unsubscribe { subscription }).await {
                                break;
                            }
                        }
                    }
                    GatewayEvent::Unsubscribed { subscription } => {
                        handles.retain(|_, handle| *handle != subscription);
                    }
                    GatewayEvent::Change { subscription, event } => {
                        let _ = events.send(SessionEvent::Change { subscription, event });
                    }
                    GatewayEvent::Error { kind, message } => {
                        warn!("Gateway error ({:?}): {}", kind, message);
                        let _ = events.send(SessionEvent::Error { kind, message });
                    }
                }
            }
            cmd = outgoing.recv(), if outcome.ready => {
                let Some(cmd) = cmd else {
                    outcome.stop = true;
                    break;
                };
                let command = match cmd {
                    Outgoing::Subscribe(filter) => GatewayCommand::Subscribe { filter },
                    Outgoing::Unsubscribe(filter) => match handles.remove(&filter) {
                        Some(subscription) => GatewayCommand::Unsubscribe { subscription },
                        None => continue,
                    },
                    Outgoing::Typing { partner, is_typing } => GatewayCommand::SetTyping { partner_id: partner, is_typing },
                };
                if !send_command(&mut sink, &command).await {
                    break;
                }
            }
        }
    }
    outcome
}

async fn send_command(sink: &mut SocketSink, command: &GatewayCommand) -> bool {
    match serde_json::to_string(command) {
        Ok(text) => sink.send(WsMessage::text(text)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode gateway command: {}", e);
            true
        }
    }
}
