use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobline_types::api::ConversationSummary;
use jobline_types::events::{GatewayCommand, GatewayEvent};
use jobline_types::models::Message;

use crate::state::ClientState;

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST base, e.g. `http://localhost:3000`
    pub base_url: String,
    /// WebSocket endpoint, e.g. `ws://localhost:3000/gateway`
    pub gateway_url: String,
    /// Identity provider token; used for both REST and the subscribe frame
    pub token: String,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl SyncConfig {
    pub fn new(
        base_url: impl Into<String>,
        gateway_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            gateway_url: gateway_url.into(),
            token: token.into(),
            poll_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Keeps a `ClientState` consistent with the server over whichever channel
/// is available. The push socket is preferred; when it cannot be opened
/// (or dies) the driver polls on a fixed interval until a reconnect
/// succeeds. Handoff overlap between the two is harmless because every
/// update lands in the same idempotent merge.
pub struct SyncDriver {
    config: SyncConfig,
    http: reqwest::Client,
    state: Arc<Mutex<ClientState>>,
    live: AtomicBool,
}

impl SyncDriver {
    pub fn new(user_id: Uuid, config: SyncConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            state: Arc::new(Mutex::new(ClientState::new(user_id))),
            live: AtomicBool::new(false),
        }
    }

    /// Shared handle to the mirrored state, for rendering.
    pub fn state(&self) -> Arc<Mutex<ClientState>> {
        self.state.clone()
    }

    /// Degraded-mode indicator: true while the push channel is open.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Run until cancelled. Alternates between live sessions and polling
    /// windows; neither mode surfaces transport failures to the caller.
    pub async fn run(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match timeout(
                self.config.connect_timeout,
                connect_async(self.config.gateway_url.as_str()),
            )
            .await
            {
                Ok(Ok((socket, _response))) => {
                    attempt = 0;
                    if let Err(e) = self.live_session(socket).await {
                        warn!("push channel closed: {}", e);
                    }
                    self.live.store(false, Ordering::Release);
                }
                Ok(Err(e)) => warn!("push channel unavailable: {}", e),
                Err(_) => warn!("push channel connect timed out"),
            }

            attempt = attempt.saturating_add(1);
            let window = reconnect_backoff(attempt);
            debug!("polling for {:?} before reconnecting", window);
            self.poll_for(window).await;
        }
    }

    /// Open the event stream: subscribe, wait for Ready, then merge every
    /// event as it arrives. Returns when the socket closes.
    async fn live_session(&self, socket: WsSocket) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        let subscribe = GatewayCommand::Subscribe {
            token: self.config.token.clone(),
        };
        sink.send(WsMessage::Text(serde_json::to_string(&subscribe)?.into()))
            .await?;

        while let Some(frame) = stream.next().await {
            match frame? {
                WsMessage::Text(text) => match serde_json::from_str::<GatewayEvent>(text.as_str())
                {
                    Ok(GatewayEvent::Ready { user_id }) => {
                        info!("live channel open for {}", user_id);
                        self.live.store(true, Ordering::Release);
                        // Catch up on anything committed before the
                        // subscription registered; merges are idempotent,
                        // so overlapping with the stream is fine.
                        self.poll_once().await;
                    }
                    Ok(event) => {
                        self.state
                            .lock()
                            .expect("client state lock poisoned")
                            .apply_event(event);
                    }
                    Err(e) => warn!("bad gateway frame: {}", e),
                },
                WsMessage::Ping(payload) => sink.send(WsMessage::Pong(payload)).await?,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }

    /// Poll on the configured interval (with jitter) until the window
    /// elapses.
    async fn poll_for(&self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            self.poll_once().await;

            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            let next = tokio::time::Instant::now() + self.config.poll_interval + jitter;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                return;
            }
            tokio::time::sleep_until(next).await;
        }
    }

    /// One full refetch: the conversation list, plus the open thread if
    /// any. Failures are logged and retried on the next tick, never fatal.
    async fn poll_once(&self) {
        match self.fetch_conversations().await {
            Ok(snapshot) => {
                self.state
                    .lock()
                    .expect("client state lock poisoned")
                    .apply_conversation_snapshot(snapshot, true);
            }
            Err(e) => warn!("conversation poll failed: {}", e),
        }

        let active = self
            .state
            .lock()
            .expect("client state lock poisoned")
            .active_thread()
            .map(|thread| thread.conversation_id);

        if let Some(conversation_id) = active {
            match self.fetch_messages(conversation_id).await {
                Ok(messages) => {
                    self.state
                        .lock()
                        .expect("client state lock poisoned")
                        .apply_thread_snapshot(conversation_id, messages, true);
                }
                Err(e) => warn!("thread poll failed: {}", e),
            }
        }
    }

    /// Open a thread: mirror it locally, backfill its history, and tell
    /// the server it has been read.
    pub async fn open_thread(&self, conversation_id: Uuid) {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .open_thread(conversation_id);

        match self.fetch_messages(conversation_id).await {
            Ok(messages) => {
                self.state
                    .lock()
                    .expect("client state lock poisoned")
                    .apply_thread_snapshot(conversation_id, messages, true);
            }
            Err(e) => warn!("thread backfill failed: {}", e),
        }

        let url = format!(
            "{}/conversations/{}/read",
            self.config.base_url, conversation_id
        );
        if let Err(e) = self
            .http
            .post(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
        {
            warn!("mark-read failed: {}", e);
        }
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let url = format!("{}/conversations?include_archived=true", self.config.base_url);
        let rows = self
            .http
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.config.base_url, conversation_id
        );
        let rows = self
            .http
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }
}

/// Capped exponential backoff between reconnect attempts; the gaps double
/// up to ~32s, each with up to half a second of jitter so a fleet of
/// clients does not reconnect in lockstep.
fn reconnect_backoff(attempt: u32) -> Duration {
    let exp = attempt.min(5);
    let base = Duration::from_secs(1u64 << exp);
    let jitter = Duration::from_millis(rand::rng().random_range(0..500));
    base + jitter
}
