//! WebSocket gateway: authenticate, admit, then pump frames through the wizard.
//!
//! Each connection runs as its own task. Inbound frames are handled strictly
//! one at a time; replies go out through the connection's own handle, so a
//! result that finishes after the connection was superseded or closed is
//! persisted but never delivered.

pub mod auth;
pub mod rate_limit;
pub mod registry;

use std::future;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::error::{WizardError, with_timeout};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::wizard::{SessionManager, TurnOutcome};

use rate_limit::SimpleRateLimiter;
use registry::{
    CLOSE_COMPLETE, CLOSE_RATE_LIMITED, ConnectionHandle, ConnectionRegistry, Outbound,
};

/// Close code used when no session could be loaded for a new connection.
pub const CLOSE_SESSION_UNAVAILABLE: u16 = 1011;

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 32;

/// Per-connection inbound budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub messages_per_second: f32,
    pub burst_size: f32,
}

/// Runs admitted connections against the session manager.
#[derive(Debug)]
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
    rate_limit: Option<RateLimit>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionManager>,
        rate_limit: Option<RateLimit>,
    ) -> Self {
        Self {
            registry,
            sessions,
            rate_limit,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Drive one authenticated connection until it closes.
    ///
    /// `frames` yields inbound text frames and ends when the peer goes away.
    /// The handle's receiver gets every outbound message followed, for
    /// server-initiated closes, by an [`Outbound::Close`].
    pub async fn drive<S>(&self, handle: ConnectionHandle, mut frames: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        let user_id = handle.user_id().to_string();
        self.registry.admit(&user_id, handle.clone());
        info!(
            name: "gateway.connection.admitted",
            user_id = %user_id,
            connection = %handle.id(),
            "Connection admitted"
        );

        match self.sessions.resume_or_create(&user_id).await {
            Ok((session_id, greeting)) => {
                handle.send(greeting).await;
                self.pump(&handle, &session_id, &mut frames).await;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Could not load a session for connection");
                handle.send(ServerMessage::error(None, &e)).await;
                handle.close(CLOSE_SESSION_UNAVAILABLE, "session unavailable");
            }
        }

        self.registry.remove_connection(&user_id, handle.id());
        info!(
            name: "gateway.connection.closed",
            user_id = %user_id,
            connection = %handle.id(),
            "Connection closed"
        );
    }

    async fn pump<S>(&self, handle: &ConnectionHandle, session_id: &str, frames: &mut S)
    where
        S: Stream<Item = String> + Unpin,
    {
        let mut limiter = self
            .rate_limit
            .map(|r| SimpleRateLimiter::new(r.messages_per_second, r.burst_size));

        loop {
            let frame = tokio::select! {
                biased;
                () = handle.closed() => break,
                next = frames.next() => match next {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let content = match ClientMessage::parse(&frame) {
                Ok(ClientMessage::UserMessage { content }) => content,
                Err(e) => {
                    debug!(session_id, error = %e, "Ignoring client frame");
                    continue;
                }
            };

            if limiter.as_mut().is_some_and(|l| !l.check()) {
                warn!(session_id, user_id = %handle.user_id(), "Inbound rate limit exceeded");
                if report_error(handle, session_id, &WizardError::RateLimited).await {
                    break;
                }
                continue;
            }

            match self.sessions.handle_user_message(session_id, &content).await {
                Ok(TurnOutcome::Reply(msg)) => {
                    handle.send(msg).await;
                }
                Ok(TurnOutcome::Complete(msg)) => {
                    handle.send(msg).await;
                    handle.close(CLOSE_COMPLETE, "session complete");
                    break;
                }
                Err(e) => {
                    warn!(session_id, error = %e, "Turn failed");
                    if report_error(handle, session_id, &e).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Send `err` as an error frame, closing the connection when the error calls
/// for it. Returns whether the connection was closed.
async fn report_error(handle: &ConnectionHandle, session_id: &str, err: &WizardError) -> bool {
    handle.send(ServerMessage::error(Some(session_id), err)).await;
    if !err.closes_connection() {
        return false;
    }
    // Exhausting the message budget is the only error that ends a connection.
    handle.close(CLOSE_RATE_LIMITED, "rate limit exceeded");
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade.
///
/// The credential comes from `?token=` or, failing that, a bearer header.
/// Nothing is created for a request that fails authentication.
pub async fn ws_handler(
    State(state): State<AppState>,
    params: Result<Query<ConnectParams>, QueryRejection>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let from_query = params
        .ok()
        .and_then(|Query(p)| p.token)
        .filter(|t| !t.trim().is_empty());
    let credential =
        from_query.or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()));

    let Some(credential) = credential else {
        return (StatusCode::UNAUTHORIZED, "missing credential").into_response();
    };

    let user_id = match with_timeout(
        "identity",
        state.config.resilience.service_timeout(),
        state.identity.validate(&credential),
    )
    .await
    {
        Ok(user_id) => user_id,
        Err(WizardError::Authentication(reason)) => {
            warn!(reason = %reason, "Rejected connection credential");
            return (StatusCode::UNAUTHORIZED, "invalid credential").into_response();
        }
        Err(e) => {
            error!(error = %e, "Identity provider failed");
            return (StatusCode::SERVICE_UNAVAILABLE, e.client_message()).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let gateway = Arc::clone(&state.gateway);
    upgrade.on_upgrade(move |socket| serve_socket(gateway, socket, user_id))
}

async fn serve_socket(gateway: Arc<Gateway>, socket: WebSocket, user_id: String) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_outbound(sink, rx));

    let frames = stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });
    let frames = std::pin::pin!(frames);

    gateway
        .drive(ConnectionHandle::new(user_id, tx), frames)
        .await;

    if let Err(e) = writer.await {
        error!("Connection writer task failed: {:?}", e);
    }
}

async fn write_outbound(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(msg) => {
                let frame = match msg.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(kind = msg.kind(), "Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
