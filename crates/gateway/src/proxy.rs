//! Attach state machine and bidirectional byte proxy.
//!
//! Received → Verified → Consumed → Resolved → Proxying. Verification and
//! consumption run inside the accepted socket so denials arrive as close
//! frames the browser can read; the atomic `jti` delete in the store is
//! what makes two concurrent upgrades with one token race to exactly one
//! winner.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, interval};
use tokio_tungstenite::tungstenite::Message as WorkerMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WorkerCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use tether_core::config::ProxyConfig;
use tether_core::error::StoreError;
use tether_core::store::SessionStore;
use tether_core::token::TokenError;

use crate::keys::KeySource;
use crate::web::AppState;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

/// Poll cadence while waiting for a pending endpoint on attach.
const ENDPOINT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Budget for the worker-side WebSocket handshake.
const WORKER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type WorkerStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WorkerSink = SplitSink<WorkerStream, WorkerMessage>;
type WorkerSource = SplitStream<WorkerStream>;

/// Why an attach was refused, and the close code it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Denial {
    /// Token or claim problem: close 1008
    Policy(&'static str),
    /// Session or worker problem: close 1011
    Unavailable(&'static str),
}

impl Denial {
    pub(crate) fn code(&self) -> u16 {
        match self {
            Denial::Policy(_) => CLOSE_POLICY,
            Denial::Unavailable(_) => CLOSE_INTERNAL,
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Denial::Policy(r) | Denial::Unavailable(r) => r,
        }
    }
}

/// Run the pre-proxy states: verify the token, consume its single-use
/// record, and resolve the worker endpoint (polling briefly if the
/// controller has not filled it in yet).
pub(crate) async fn authorize(
    store: &dyn SessionStore,
    keys: &KeySource,
    session_id: Uuid,
    token: &str,
    resolve_budget: Duration,
    poll_interval: Duration,
) -> Result<String, Denial> {
    // Received → Verified
    let claims = match keys.verify(token).await {
        Ok(claims) => claims,
        Err(TokenError::Expired) => return Err(Denial::Policy("expired")),
        Err(_) => return Err(Denial::Policy("invalid token")),
    };
    if claims.sid != session_id.to_string() {
        return Err(Denial::Policy("session mismatch"));
    }
    let token_id = match Uuid::parse_str(&claims.jti) {
        Ok(id) => id,
        Err(_) => return Err(Denial::Policy("invalid token")),
    };

    // Verified → Consumed. The delete-returning is atomic: of any number
    // of racing upgrades, one consumes and the rest see the row gone.
    match store.consume_token(token_id).await {
        Ok(sid) if sid == session_id => {}
        Ok(_) => return Err(Denial::Policy("session mismatch")),
        Err(StoreError::Absent) => return Err(Denial::Policy("replayed")),
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "token consumption failed");
            return Err(Denial::Unavailable("store unavailable"));
        }
    }

    // Consumed → Resolved
    let deadline = Instant::now() + resolve_budget;
    loop {
        match store.get_session(session_id).await {
            Ok(row) => {
                if Utc::now() >= row.expires_at {
                    return Err(Denial::Unavailable("session expired"));
                }
                if let Some(endpoint) = row.worker_endpoint {
                    return Ok(endpoint);
                }
            }
            Err(StoreError::Absent) => return Err(Denial::Unavailable("unknown session")),
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "session lookup failed");
                return Err(Denial::Unavailable("store unavailable"));
            }
        }
        if Instant::now() >= deadline {
            return Err(Denial::Unavailable("worker not ready"));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Entry point from the upgrade handler: authorize, dial the worker's
/// terminal server, then relay until either side goes away.
pub(crate) async fn attach(
    mut client: WebSocket,
    state: Arc<AppState>,
    session_id: Uuid,
    token: String,
) {
    let cfg = state.config.proxy.clone();
    let endpoint = match authorize(
        state.store.as_ref(),
        &state.keys,
        session_id,
        &token,
        Duration::from_secs(cfg.attach_resolve_secs),
        ENDPOINT_POLL_INTERVAL,
    )
    .await
    {
        Ok(endpoint) => endpoint,
        Err(denial) => {
            tracing::info!(%session_id, reason = denial.reason(), "attach denied");
            close_client(&mut client, denial.code(), denial.reason()).await;
            return;
        }
    };

    let url = format!("ws://{endpoint}/ws");
    let worker = match tokio::time::timeout(
        WORKER_DIAL_TIMEOUT,
        tokio_tungstenite::connect_async(&url),
    )
    .await
    {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            tracing::warn!(%session_id, %endpoint, "worker dial failed: {e}");
            close_client(&mut client, CLOSE_INTERNAL, "worker unreachable").await;
            return;
        }
        Err(_) => {
            tracing::warn!(%session_id, %endpoint, "worker dial timed out");
            close_client(&mut client, CLOSE_INTERNAL, "worker unreachable").await;
            return;
        }
    };

    tracing::info!(%session_id, %endpoint, "proxying");
    tracing::info!(target: "audit", event = "session_attached", %session_id, "Terminal attached");
    proxy(client, worker, session_id, &cfg).await;
    tracing::info!(%session_id, "proxy session ended");
}

/// Relay bytes unmodified in both directions, enforcing the keepalive,
/// idle, and backpressure discipline.
async fn proxy(mut client: WebSocket, worker: WorkerStream, session_id: Uuid, cfg: &ProxyConfig) {
    let (mut worker_tx, mut worker_rx): (WorkerSink, WorkerSource) = worker.split();

    let pong_timeout = Duration::from_secs(cfg.pong_timeout_secs);
    let idle_timeout = Duration::from_secs(cfg.idle_timeout_secs);
    let stall = Duration::from_secs(cfg.stall_timeout_secs);

    let mut ping_interval = interval(Duration::from_secs(cfg.ping_interval_secs));
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_client_pong = Instant::now();
    let mut last_worker_pong = Instant::now();
    let mut last_data = Instant::now();

    loop {
        tokio::select! {
            // Keepalive, idle and liveness checks
            _ = ping_interval.tick() => {
                if last_data.elapsed() >= idle_timeout {
                    tracing::info!(%session_id, "idle timeout");
                    close_client(&mut client, CLOSE_GOING_AWAY, "idle timeout").await;
                    close_worker(&mut worker_tx, CLOSE_GOING_AWAY, "idle timeout").await;
                    break;
                }
                if last_client_pong.elapsed() >= pong_timeout
                    || last_worker_pong.elapsed() >= pong_timeout
                {
                    let side = if last_client_pong.elapsed() >= pong_timeout { "client" } else { "worker" };
                    tracing::info!(%session_id, side, "ping timeout");
                    close_client(&mut client, CLOSE_INTERNAL, "ping timeout").await;
                    close_worker(&mut worker_tx, CLOSE_INTERNAL, "ping timeout").await;
                    break;
                }
                if client.send(Message::Ping(Bytes::new())).await.is_err() {
                    close_worker(&mut worker_tx, CLOSE_NORMAL, "client gone").await;
                    break;
                }
                if worker_tx.send(WorkerMessage::Ping(Bytes::new())).await.is_err() {
                    close_client(&mut client, CLOSE_INTERNAL, "worker gone").await;
                    break;
                }
            }
            // Client → worker
            msg = client.recv() => {
                match msg {
                    Some(Ok(msg)) => {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                last_data = Instant::now();
                                let Some(forward) = client_to_worker(msg) else { continue };
                                match timed_send_worker(&mut worker_tx, forward, stall).await {
                                    Forward::Done => {}
                                    Forward::PeerGone => {
                                        close_client(&mut client, CLOSE_INTERNAL, "worker disconnected").await;
                                        break;
                                    }
                                    Forward::Stalled => {
                                        tracing::warn!(%session_id, side = "worker", "backpressure stall");
                                        close_client(&mut client, CLOSE_INTERNAL, "backpressure").await;
                                        close_worker(&mut worker_tx, CLOSE_INTERNAL, "backpressure").await;
                                        break;
                                    }
                                }
                            }
                            Message::Pong(_) => {
                                last_client_pong = Instant::now();
                            }
                            // axum answers client pings automatically
                            Message::Ping(_) => {}
                            Message::Close(_) => {
                                tracing::info!(%session_id, "client closed");
                                close_worker(&mut worker_tx, CLOSE_NORMAL, "client closed").await;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, "client socket error: {e}");
                        close_worker(&mut worker_tx, CLOSE_NORMAL, "client closed").await;
                        break;
                    }
                    None => {
                        close_worker(&mut worker_tx, CLOSE_NORMAL, "client closed").await;
                        break;
                    }
                }
            }
            // Worker → client
            msg = worker_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        match msg {
                            WorkerMessage::Text(_) | WorkerMessage::Binary(_) => {
                                last_data = Instant::now();
                                let Some(forward) = worker_to_client(msg) else { continue };
                                match timed_send_client(&mut client, forward, stall).await {
                                    Forward::Done => {}
                                    Forward::PeerGone => {
                                        close_worker(&mut worker_tx, CLOSE_NORMAL, "client gone").await;
                                        break;
                                    }
                                    Forward::Stalled => {
                                        tracing::warn!(%session_id, side = "client", "backpressure stall");
                                        close_client(&mut client, CLOSE_INTERNAL, "backpressure").await;
                                        close_worker(&mut worker_tx, CLOSE_INTERNAL, "backpressure").await;
                                        break;
                                    }
                                }
                            }
                            WorkerMessage::Pong(_) => {
                                last_worker_pong = Instant::now();
                            }
                            WorkerMessage::Ping(payload) => {
                                let _ = worker_tx.send(WorkerMessage::Pong(payload)).await;
                            }
                            WorkerMessage::Close(frame) => {
                                // The worker's close code travels to the client
                                let (code, reason) = match frame {
                                    Some(f) => (u16::from(f.code), f.reason.as_str().to_string()),
                                    None => (CLOSE_NORMAL, String::new()),
                                };
                                tracing::info!(%session_id, code, "worker closed");
                                let _ = client
                                    .send(Message::Close(Some(CloseFrame {
                                        code,
                                        reason: reason.into(),
                                    })))
                                    .await;
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%session_id, "worker socket error: {e}");
                        close_client(&mut client, CLOSE_INTERNAL, "worker disconnected").await;
                        break;
                    }
                    None => {
                        close_client(&mut client, CLOSE_INTERNAL, "worker disconnected").await;
                        break;
                    }
                }
            }
        }
    }
}

enum Forward {
    Done,
    PeerGone,
    Stalled,
}

async fn timed_send_worker(tx: &mut WorkerSink, msg: WorkerMessage, stall: Duration) -> Forward {
    match tokio::time::timeout(stall, tx.send(msg)).await {
        Ok(Ok(())) => Forward::Done,
        Ok(Err(_)) => Forward::PeerGone,
        Err(_) => Forward::Stalled,
    }
}

async fn timed_send_client(client: &mut WebSocket, msg: Message, stall: Duration) -> Forward {
    match tokio::time::timeout(stall, client.send(msg)).await {
        Ok(Ok(())) => Forward::Done,
        Ok(Err(_)) => Forward::PeerGone,
        Err(_) => Forward::Stalled,
    }
}

/// Payload frames pass through unmodified; control frames stay local.
fn client_to_worker(msg: Message) -> Option<WorkerMessage> {
    match msg {
        Message::Text(text) => Some(WorkerMessage::text(text.as_str().to_string())),
        Message::Binary(data) => Some(WorkerMessage::Binary(data)),
        _ => None,
    }
}

fn worker_to_client(msg: WorkerMessage) -> Option<Message> {
    match msg {
        WorkerMessage::Text(text) => Some(Message::Text(text.as_str().to_string().into())),
        WorkerMessage::Binary(data) => Some(Message::Binary(data)),
        _ => None,
    }
}

pub(crate) async fn close_client(client: &mut WebSocket, code: u16, reason: &str) {
    let _ = client
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn close_worker(tx: &mut WorkerSink, code: u16, reason: &str) {
    let frame = WorkerCloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = tx.send(WorkerMessage::Close(Some(frame))).await;
}
