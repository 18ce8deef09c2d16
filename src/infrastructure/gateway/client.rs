//! Gateway client: a single authenticated duplex connection to the
//! execution backend.
//!
//! Modeled as a state machine (disconnected, dialing, authenticating,
//! authenticated, reconnecting) driven by one supervisor task. RPCs are
//! correlated by client-generated request ids and survive reconnects:
//! in-flight requests are re-sent (idempotent by id) and requests issued
//! while the link is down queue up to a bounded depth, beyond which calls
//! fail fast.

use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::GatewayConfig;
use crate::domain::models::{Event, EventPayload};
use crate::services::backoff::RetryPolicy;
use crate::services::event_bus::EventBus;

use super::protocol::{
    ClientFrame, HistoryMessage, RequestOp, SendAccepted, ServerFrame, SessionInfo, SpawnParams,
    SpawnedSession,
};

const SOURCE: &str = "gateway";

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    Authenticating,
    Authenticated,
    Reconnecting,
}

/// A server-pushed event forwarded to the runtime layer.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub seq: u64,
    pub class: String,
    pub body: serde_json::Value,
}

struct Pending {
    frame: ClientFrame,
    tx: Option<oneshot::Sender<CoreResult<serde_json::Value>>>,
    sent: bool,
}

#[derive(Default)]
struct Shared {
    pending: HashMap<Uuid, Pending>,
    /// Request ids not yet written to the wire, FIFO.
    queue: VecDeque<Uuid>,
    writer: Option<mpsc::UnboundedSender<ClientFrame>>,
}

enum ConnectionEnd {
    /// Authentication rejected; never retried.
    AuthFatal(String),
    /// Transport lost after a successful handshake.
    DroppedAfterAuth(String),
    /// Dial or handshake failed before authentication.
    FailedBeforeAuth(String),
}

/// The shared gateway client.
pub struct GatewayClient {
    me: Weak<GatewayClient>,
    config: GatewayConfig,
    bus: Arc<EventBus>,
    state: std::sync::Mutex<ConnectionState>,
    shared: std::sync::Mutex<Shared>,
    last_seq: std::sync::Mutex<Option<u64>>,
    events_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<GatewayEvent>>>,
    shutdown: AtomicBool,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            bus,
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            shared: std::sync::Mutex::new(Shared::default()),
            last_seq: std::sync::Mutex::new(None),
            events_tx: std::sync::Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Receive server-pushed events. Call before `connect`.
    pub fn take_event_stream(&self) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Start the supervisor task that owns dial, auth, pump, reconnect.
    pub fn connect(&self) -> Option<tokio::task::JoinHandle<()>> {
        let client = self.me.upgrade()?;
        Some(tokio::spawn(async move { client.run().await }))
    }

    async fn run(self: Arc<Self>) {
        let policy =
            RetryPolicy::reconnect(self.config.reconnect_base_ms, self.config.reconnect_cap_ms);
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if attempt > 0 {
                self.set_state(ConnectionState::Reconnecting);
                if self.config.max_reconnect_attempts != 0
                    && attempt > self.config.max_reconnect_attempts
                {
                    tracing::error!("gateway reconnect attempts exhausted");
                    break;
                }
                let delay = policy.delay(attempt - 1);
                self.bus
                    .publish(Event::new(
                        SOURCE,
                        EventPayload::GatewayReconnecting {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        },
                    ))
                    .await;
                tokio::time::sleep(delay).await;
            } else {
                self.set_state(ConnectionState::Dialing);
            }

            match self.connect_once().await {
                ConnectionEnd::AuthFatal(reason) => {
                    tracing::error!("gateway authentication rejected: {reason}");
                    self.bus
                        .publish(Event::new(SOURCE, EventPayload::GatewayDisconnected { reason }))
                        .await;
                    break;
                }
                ConnectionEnd::DroppedAfterAuth(reason) => {
                    tracing::warn!("gateway connection lost: {reason}");
                    self.clear_writer();
                    self.bus
                        .publish(Event::new(SOURCE, EventPayload::GatewayDisconnected { reason }))
                        .await;
                    attempt = 1;
                }
                ConnectionEnd::FailedBeforeAuth(reason) => {
                    tracing::warn!("gateway dial failed: {reason}");
                    self.clear_writer();
                    attempt += 1;
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.fail_all_pending("gateway client stopped");
    }

    async fn connect_once(&self) -> ConnectionEnd {
        let dial = tokio::time::timeout(
            Duration::from_secs(self.config.dial_timeout_secs),
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        )
        .await;
        let ws = match dial {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return ConnectionEnd::FailedBeforeAuth(e.to_string()),
            Err(_) => return ConnectionEnd::FailedBeforeAuth("dial timeout".to_string()),
        };
        let (mut sink, mut stream) = ws.split();
        self.set_state(ConnectionState::Authenticating);

        // Challenge -> connect -> hello_ok.
        let nonce = match read_frame(&mut stream, self.config.rpc_timeout_secs).await {
            Ok(ServerFrame::Challenge { nonce }) => nonce,
            Ok(other) => {
                return ConnectionEnd::FailedBeforeAuth(format!("expected challenge, got {other:?}"))
            }
            Err(e) => return ConnectionEnd::FailedBeforeAuth(e),
        };
        let connect = ClientFrame::Connect {
            token: self.config.token.clone(),
            client_id: self.config.client_id.clone(),
            scopes: self.config.scopes.clone(),
            nonce,
        };
        if let Err(e) = send_frame(&mut sink, &connect).await {
            return ConnectionEnd::FailedBeforeAuth(e);
        }
        let (connection_id, protocol_version) =
            match read_frame(&mut stream, self.config.rpc_timeout_secs).await {
                Ok(ServerFrame::HelloOk { connection_id, protocol_version }) => {
                    (connection_id, protocol_version)
                }
                Ok(ServerFrame::HelloErr { reason }) => return ConnectionEnd::AuthFatal(reason),
                Ok(other) => {
                    return ConnectionEnd::FailedBeforeAuth(format!(
                        "expected hello_ok, got {other:?}"
                    ))
                }
                Err(e) => return ConnectionEnd::FailedBeforeAuth(e),
            };

        // Subscribe before flushing so no pushed event is missed.
        let last_seq = *self.last_seq.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let subscribe =
            ClientFrame::Subscribe { classes: self.config.scopes.clone(), last_seq };
        if let Err(e) = send_frame(&mut sink, &subscribe).await {
            return ConnectionEnd::FailedBeforeAuth(e);
        }

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ClientFrame>();
        self.install_writer(writer_tx);
        self.set_state(ConnectionState::Authenticated);
        self.bus
            .publish(Event::new(
                SOURCE,
                EventPayload::GatewayConnected { connection_id, protocol_version },
            ))
            .await;
        self.flush_backlog();

        // Pump until the transport drops.
        loop {
            tokio::select! {
                outgoing = writer_rx.recv() => {
                    let Some(frame) = outgoing else {
                        return ConnectionEnd::DroppedAfterAuth("writer closed".to_string());
                    };
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        return ConnectionEnd::DroppedAfterAuth(e);
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => self.handle_server_frame(frame, last_seq).await,
                                Err(e) => {
                                    return ConnectionEnd::DroppedAfterAuth(format!(
                                        "unrecoverable framing error: {e}"
                                    ));
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            return ConnectionEnd::DroppedAfterAuth("connection closed".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ConnectionEnd::DroppedAfterAuth(e.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn handle_server_frame(&self, frame: ServerFrame, resumed_from: Option<u64>) {
        match frame {
            ServerFrame::Response { request_id, ok, body, error, error_kind } => {
                let reply = classify_response(ok, body, error, error_kind);
                let entry = {
                    let mut shared =
                        self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    shared.pending.remove(&request_id)
                };
                match entry {
                    Some(mut pending) => {
                        if let Some(tx) = pending.tx.take() {
                            let _ = tx.send(reply);
                        }
                    }
                    None => {
                        tracing::debug!(%request_id, "response for unknown or timed-out request");
                    }
                }
            }
            ServerFrame::SubscribeOk { resume_supported, next_seq } => {
                if let Some(last) = resumed_from {
                    let gap_start = last + 1;
                    if !resume_supported || next_seq > gap_start {
                        self.bus
                            .publish(Event::new(
                                SOURCE,
                                EventPayload::GatewayResyncGap {
                                    from_seq: gap_start,
                                    to_seq: next_seq.saturating_sub(1).max(gap_start),
                                },
                            ))
                            .await;
                    }
                }
            }
            ServerFrame::Event { seq, class, body } => {
                *self.last_seq.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(seq);
                let tx = self
                    .events_tx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                if let Some(tx) = tx {
                    let _ = tx.send(GatewayEvent { seq, class, body });
                }
            }
            other => {
                tracing::debug!("unexpected frame after auth: {other:?}");
            }
        }
    }

    // -------------------------------------------------------------------
    // RPC surface
    // -------------------------------------------------------------------

    pub async fn sessions_list(&self, filter: Option<String>) -> CoreResult<Vec<SessionInfo>> {
        let body = self.call(RequestOp::SessionsList { filter }, self.rpc_timeout()).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn sessions_spawn(&self, params: SpawnParams) -> CoreResult<SpawnedSession> {
        let body = self.call(RequestOp::SessionsSpawn { params }, self.rpc_timeout()).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Send a message into a session. Fails `NotFound` when the session
    /// does not exist.
    pub async fn sessions_send(
        &self,
        session_key: &str,
        message: &str,
        timeout: Duration,
    ) -> CoreResult<SendAccepted> {
        let op = RequestOp::SessionsSend {
            session_key: session_key.to_string(),
            message: message.to_string(),
            attachments: Vec::new(),
        };
        let body = self.call(op, timeout).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn sessions_history(
        &self,
        session_key: &str,
        limit: Option<u32>,
    ) -> CoreResult<Vec<HistoryMessage>> {
        let op = RequestOp::SessionsHistory { session_key: session_key.to_string(), limit };
        let body = self.call(op, self.rpc_timeout()).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Kill a session. Idempotent: killing an unknown session succeeds.
    pub async fn sessions_kill(&self, session_key: &str) -> CoreResult<()> {
        let op = RequestOp::SessionsKill { session_key: session_key.to_string() };
        match self.call(op, self.rpc_timeout()).await {
            Ok(_) | Err(CoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.config.rpc_timeout_secs)
    }

    /// Issue one correlated request. A fresh request id is allocated per
    /// call and retired only when its response, timeout, or terminal
    /// failure arrives, so an id is never reused while pending.
    async fn call(&self, op: RequestOp, timeout: Duration) -> CoreResult<serde_json::Value> {
        let request_id = Uuid::new_v4();
        let frame = ClientFrame::Request { request_id, op };
        let (tx, rx) = oneshot::channel();

        {
            let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match shared.writer.clone() {
                Some(writer) => {
                    shared.pending.insert(
                        request_id,
                        Pending { frame: frame.clone(), tx: Some(tx), sent: true },
                    );
                    if writer.send(frame).is_err() {
                        // Writer raced a disconnect; leave it pending for
                        // the reconnect flush.
                        if let Some(pending) = shared.pending.get_mut(&request_id) {
                            pending.sent = false;
                            shared.queue.push_back(request_id);
                        }
                    }
                }
                None => {
                    if shared.queue.len() >= self.config.reconnect_queue_depth {
                        return Err(CoreError::Transient(
                            "gateway disconnected and the call queue is full".to_string(),
                        ));
                    }
                    shared.pending.insert(request_id, Pending { frame, tx: Some(tx), sent: false });
                    shared.queue.push_back(request_id);
                }
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CoreError::Transient("gateway request abandoned".to_string())),
            Err(_) => {
                let mut shared =
                    self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                shared.pending.remove(&request_id);
                Err(CoreError::Transient("gateway rpc timeout".to_string()))
            }
        }
    }

    // -------------------------------------------------------------------
    // Connection bookkeeping
    // -------------------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    fn install_writer(&self, writer: mpsc::UnboundedSender<ClientFrame>) {
        let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        shared.writer = Some(writer);
    }

    fn clear_writer(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        shared.writer = None;
        for pending in shared.pending.values_mut() {
            // Everything sent but unanswered will be replayed on the next
            // successful handshake.
            if pending.sent {
                pending.sent = false;
                // keep order stable: replayed ahead of newly queued calls
            }
        }
    }

    /// Replay unanswered requests and drain the queue, FIFO.
    fn flush_backlog(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(writer) = shared.writer.clone() else { return };

        // Requests that were on the wire when the link dropped, oldest
        // request-id first for a stable replay order.
        let mut replay: Vec<(Uuid, ClientFrame)> = shared
            .pending
            .iter()
            .filter(|(id, p)| !p.sent && !shared.queue.contains(id))
            .map(|(id, p)| (*id, p.frame.clone()))
            .collect();
        replay.sort_by_key(|(id, _)| *id);
        for (id, frame) in replay {
            if writer.send(frame).is_ok() {
                if let Some(pending) = shared.pending.get_mut(&id) {
                    pending.sent = true;
                }
            }
        }

        while let Some(id) = shared.queue.pop_front() {
            let Some(pending) = shared.pending.get_mut(&id) else { continue };
            if writer.send(pending.frame.clone()).is_ok() {
                pending.sent = true;
            }
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let mut shared = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        shared.queue.clear();
        for (_, mut pending) in shared.pending.drain() {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Err(CoreError::Fatal(reason.to_string())));
            }
        }
    }

    #[cfg(test)]
    fn queued_count(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queue
            .len()
    }
}

fn classify_response(
    ok: bool,
    body: serde_json::Value,
    error: Option<String>,
    error_kind: Option<String>,
) -> CoreResult<serde_json::Value> {
    if ok {
        return Ok(body);
    }
    let message = error.unwrap_or_else(|| "unspecified gateway error".to_string());
    match error_kind.as_deref() {
        Some("not_found") => Err(CoreError::NotFound { entity: "session", id: message }),
        Some("invalid_input") => Err(CoreError::InvalidInput(message)),
        Some("fatal") => Err(CoreError::Fatal(message)),
        _ => Err(CoreError::Transient(message)),
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), String>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text)).await.map_err(|e| e.to_string())
}

async fn read_frame<S>(stream: &mut S, timeout_secs: u64) -> Result<ServerFrame, String>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = Duration::from_secs(timeout_secs);
    loop {
        match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).map_err(|e| e.to_string());
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(_))) => return Err("unexpected binary frame during handshake".to_string()),
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(None) => return Err("connection closed during handshake".to_string()),
            Err(_) => return Err("handshake timeout".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBus;

    fn client_with_depth(depth: usize) -> Arc<GatewayClient> {
        let config = GatewayConfig { reconnect_queue_depth: depth, ..Default::default() };
        GatewayClient::new(config, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_disconnected_calls_queue_then_fail_fast() {
        let client = client_with_depth(2);

        // Two calls fit the queue; they will time out since nothing
        // drains them, so use a short timeout.
        for _ in 0..2 {
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client
                    .call(
                        RequestOp::SessionsList { filter: None },
                        Duration::from_millis(200),
                    )
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.queued_count(), 2);

        // The third call overflows the queue and fails immediately.
        let err = client
            .call(RequestOp::SessionsList { filter: None }, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));
        assert_eq!(client.queued_count(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_request_is_retired() {
        let client = client_with_depth(8);
        let err = client
            .call(RequestOp::SessionsList { filter: None }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));
        let shared = client.shared.lock().unwrap();
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn test_classify_response() {
        assert!(classify_response(true, serde_json::json!({}), None, None).is_ok());
        assert!(matches!(
            classify_response(false, serde_json::Value::Null, Some("gone".into()), Some("not_found".into())),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            classify_response(false, serde_json::Value::Null, Some("boom".into()), None),
            Err(CoreError::Transient(_))
        ));
        assert!(matches!(
            classify_response(false, serde_json::Value::Null, Some("denied".into()), Some("fatal".into())),
            Err(CoreError::Fatal(_))
        ));
    }

    #[test]
    fn test_initial_state_disconnected() {
        let client = client_with_depth(4);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
