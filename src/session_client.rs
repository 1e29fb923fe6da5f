//! Session Client (SC) — §4.3.
//!
//! Owns the full-duplex websocket session to the streaming recognition
//! backend: connection state machine, frame forwarding, server-message
//! dispatch, keep-alive, and linear-backoff reconnection. Structured after
//! the reader/writer task split used for provider websockets elsewhere in
//! this codebase, generalized from one hardcoded provider to the
//! configurable endpoint/auth scheme this crate's callers select.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{CoreConfig, KeepAliveMode};
use crate::error::{SessionError, SessionResult};
use crate::message::{ClientControlMessage, SessionState, Transcript, Word, WireMessage};

/// Events the Session Client raises for its caller (§4.3, §6 callbacks).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Interim(Transcript),
    Final(Transcript),
    SpeechStarted,
    UtteranceEnd,
    Error { message: String, recoverable: bool },
}

/// Endpoint and credential for one session (§4.1 → §4.3 handoff: the
/// Credential Store resolves the key, the caller passes it here).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub api_key: String,
}

/// Browser full-duplex APIs forbid custom headers, so the credential rides
/// the `Sec-WebSocket-Protocol` negotiation as a `["token", "<API-KEY>"]`
/// pair instead of an `Authorization` header (§4.3, §6 "Recognition-service
/// wire" — contrast with the HTTP auth-check endpoint, which does use a
/// header, since it isn't subject to that restriction).
fn build_request(endpoint: &Endpoint) -> SessionResult<tokio_tungstenite::tungstenite::http::Request<()>> {
    let mut req = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::WebSocketOpenFailed(e.to_string()))?;
    req.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        format!("token, {}", endpoint.api_key)
            .parse()
            .map_err(|_| SessionError::AuthFailed)?,
    );
    Ok(req)
}

fn parse_words(words: &[crate::message::WireWord]) -> Vec<Word> {
    words
        .iter()
        .map(|w| Word {
            text: w.word.clone(),
            start_sec: w.start,
            end_sec: w.end,
        })
        .collect()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn dispatch(msg: WireMessage) -> Option<SessionEvent> {
    match msg {
        WireMessage::Results { channel, is_final } => {
            let alt = channel.alternatives.into_iter().next()?;
            if alt.transcript.trim().is_empty() {
                return None;
            }
            let transcript = Transcript {
                text: alt.transcript,
                is_final,
                confidence: alt.confidence,
                words: parse_words(&alt.words),
                recv_timestamp_ms: now_ms(),
            };
            Some(if is_final {
                SessionEvent::Final(transcript)
            } else {
                SessionEvent::Interim(transcript)
            })
        }
        WireMessage::SpeechStarted => Some(SessionEvent::SpeechStarted),
        WireMessage::UtteranceEnd => Some(SessionEvent::UtteranceEnd),
        WireMessage::Error { message } => Some(SessionEvent::Error {
            message,
            recoverable: false,
        }),
        WireMessage::Metadata | WireMessage::Unknown => None,
    }
}

struct ActiveSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    stop_tx: oneshot::Sender<()>,
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Session-lifetime counters, surfaced for diagnostics (SPEC_FULL.md §3),
/// mirroring the introspection style of a connection-manager's own
/// connection-count accessor.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub reconnect_count: AtomicU64,
    pub frames_dropped: AtomicU64,
}

/// Drives one recognition websocket session end-to-end: open, forward
/// audio frames, dispatch server messages, keep-alive, and reconnect
/// (§4.3 state machine).
pub struct SessionClient {
    config: CoreConfig,
    events_tx: mpsc::Sender<SessionEvent>,
    active: Mutex<Option<ActiveSession>>,
    state: Mutex<SessionState>,
    stats: Arc<SessionStats>,
    /// Set by an explicit [`SessionClient::close`] so a disconnect racing
    /// with it is treated as clean shutdown rather than triggering the
    /// reconnect supervisor (§4.3 "Cancellation").
    closing: Arc<AtomicBool>,
}

impl SessionClient {
    pub fn new(config: CoreConfig, events_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            config,
            events_tx,
            active: Mutex::new(None),
            state: Mutex::new(SessionState::Disconnected),
            stats: Arc::new(SessionStats::default()),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    async fn set_state(&self, new_state: SessionState) {
        *self.state.lock().await = new_state;
        let _ = self.events_tx.send(SessionEvent::StateChanged(new_state)).await;
    }

    /// Opens the session, retrying with linear backoff up to
    /// `reconnect_max_retries` (§4.3 "Reconnection policy"). A session that
    /// later drops with a non-clean close is reconnected the same way by a
    /// background supervisor spawned from the reader task — `open` itself
    /// only covers the initial handshake.
    pub async fn open(self: &Arc<Self>, endpoint: Endpoint) -> SessionResult<()> {
        self.closing.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Connecting).await;
        self.connect_with_retry(endpoint, 0).await
    }

    async fn connect_with_retry(self: &Arc<Self>, endpoint: Endpoint, mut attempt: u32) -> SessionResult<()> {
        loop {
            match self.clone().connect_once(endpoint.clone()).await {
                Ok(()) => {
                    self.set_state(SessionState::Connected).await;
                    return Ok(());
                }
                Err(e) if e.is_recoverable_for_reconnect() && attempt < self.config.reconnect_max_retries => {
                    attempt += 1;
                    self.stats.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.reconnect_base_delay_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    self.set_state(SessionState::Errored).await;
                    return Err(e);
                }
            }
        }
    }

    async fn connect_once(self: Arc<Self>, endpoint: Endpoint) -> SessionResult<()> {
        let session_id = {
            let n = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
            format!("sc-{}-{}", now_ms(), n)
        };

        let request = build_request(&endpoint)?;
        let (ws_stream, _response) = tokio::time::timeout(
            Duration::from_secs(10),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::WebSocketOpenFailed(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (reader_done_tx, reader_done_rx) = oneshot::channel::<()>();

        {
            let mut active = self.active.lock().await;
            *active = Some(ActiveSession { audio_tx, stop_tx });
        }

        let keep_alive_mode = self.config.keep_alive_mode;
        let keep_alive_interval_ms = self.config.keep_alive_interval_ms;

        // Writer task: audio frames + keep-alive frames -> websocket.
        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            let mut reader_done_rx = reader_done_rx;
            let mut ticker = interval(Duration::from_millis(keep_alive_interval_ms.max(1)));
            ticker.tick().await; // first tick fires immediately; discard it

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    _ = &mut reader_done_rx => { break; }
                    _ = ticker.tick(), if keep_alive_mode == KeepAliveMode::TextPing => {
                        let ping = serde_json::to_string(&ClientControlMessage::KeepAlive)
                            .expect("ClientControlMessage always serializes");
                        if ws_write.send(Message::Text(ping)).await.is_err() {
                            break;
                        }
                    }
                    chunk = audio_rx.recv() => {
                        match chunk {
                            Some(data) => {
                                if ws_write.send(Message::Binary(data)).await.is_err() {
                                    break;
                                }
                                // Audio bytes are the keep-alive; push the
                                // next ping out while frames keep flowing
                                // (§4.3 "while frames flow, no text-based
                                // ping is required").
                                ticker.reset();
                            }
                            None => {
                                let _ = ws_write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        let events_tx = self.events_tx.clone();
        let this = self.clone();
        let reconnect_endpoint = endpoint.clone();

        // Reader task: websocket messages -> SessionEvent dispatch.
        tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                        Ok(wire) => {
                            if let Some(event) = dispatch(wire) {
                                let _ = events_tx.send(event).await;
                            }
                        }
                        Err(e) => {
                            let _ = events_tx
                                .send(SessionEvent::Error {
                                    message: format!("malformed server message: {}", e),
                                    recoverable: false,
                                })
                                .await;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "connection closed by server".to_string());
                        let _ = events_tx
                            .send(SessionEvent::Error {
                                message: reason,
                                recoverable: true,
                            })
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = events_tx
                            .send(SessionEvent::Error {
                                message: format!("websocket error: {}", e),
                                recoverable: true,
                            })
                            .await;
                        break;
                    }
                    Ok(Message::Binary(_)) => {}
                    _ => {}
                }
            }
            *this.active.lock().await = None;

            if this.closing.load(Ordering::SeqCst) {
                this.set_state(SessionState::Disconnected).await;
            } else {
                // Non-clean close while autoreconnect is enabled (§4.3
                // "Reconnection"): hand off to a fresh attempt loop rather
                // than just reporting Disconnected.
                this.set_state(SessionState::Errored).await;
                let supervisor = this.clone();
                tokio::spawn(async move {
                    let _ = supervisor.connect_with_retry(reconnect_endpoint, 0).await;
                });
            }
            let _ = reader_done_tx.send(());
        });

        let _ = session_id;
        Ok(())
    }

    /// Forwards one PCM frame's bytes to the writer task (§4.3 "Frame
    /// forwarding"). Silently drops the frame if no session is open,
    /// mirroring the audio pipeline's backpressure-drop policy.
    pub async fn send_frame(&self, payload: Vec<u8>) -> SessionResult<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) => {
                let len = payload.len() as u64;
                session.audio_tx.send(payload).await.map_err(|_| {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    SessionError::Cancelled
                })?;
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Idempotent close: no-ops if already closed (§4.3 "Close is
    /// idempotent"). Marks the session as intentionally closing first, so
    /// the reader task's exit is not mistaken for a non-clean close and
    /// does not trigger the reconnect supervisor.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let session = self.active.lock().await.take();
        if let Some(session) = session {
            let _ = session.stop_tx.send(());
        }
        self.set_state(SessionState::Closing).await;
    }
}

trait ReconnectableError {
    fn is_recoverable_for_reconnect(&self) -> bool;
}

impl ReconnectableError for SessionError {
    fn is_recoverable_for_reconnect(&self) -> bool {
        matches!(self, SessionError::WebSocketOpenFailed(_) | SessionError::Timeout)
    }
}
