//! MCP Streamable HTTP endpoint handlers.
//!
//! Implements the MCP 2025-03-26 Streamable HTTP transport.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - Send JSON-RPC requests (returns JSON or SSE)
//! - `GET /mcp` - Open the session event stream, resumable via `Last-Event-ID`
//! - `DELETE /mcp` - Terminate a session
//!
//! The response mode for POST is negotiated from the `Accept` header: a
//! client accepting only `application/json` gets one buffered response;
//! a client accepting `text/event-stream` gets an SSE channel carrying
//! the request's notification events followed by the terminal response
//! event. Every SSE data event carries its store sequence as the SSE id,
//! which is what makes `Last-Event-ID` resumption work.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use sluss_types::rpc::code;
use sluss_types::{
    JsonRpcRequest, JsonRpcResponse, StreamEvent, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::config::BusyPolicy;
use crate::dispatch::Dispatcher;
use crate::session::{DispatchPermit, Session};
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// What the client is willing to receive, per its `Accept` header.
#[derive(Clone, Copy)]
struct Accepts {
    json: bool,
    sse: bool,
}

fn negotiate(headers: &HeaderMap) -> Accepts {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");

    let mut accepts = Accepts {
        json: false,
        sse: false,
    };
    for part in accept.split(',') {
        let mime = part.split(';').next().unwrap_or("").trim();
        match mime {
            "*/*" => {
                accepts.json = true;
                accepts.sse = true;
            }
            "application/json" | "application/*" => accepts.json = true,
            "text/event-stream" | "text/*" => accepts.sse = true,
            _ => {}
        }
    }
    accepts
}

/// Extract the session ID from headers.
fn get_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn not_acceptable() -> Response {
    (
        StatusCode::NOT_ACCEPTABLE,
        Json(json!({"error": "Client must accept application/json or text/event-stream"})),
    )
        .into_response()
}

fn session_required() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Mcp-Session-Id header required"})),
    )
        .into_response()
}

/// Unknown or expired session: tell the client to start over with
/// `initialize` instead of silently creating a fresh session.
fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Session not found; re-initialize to start a new session"})),
    )
        .into_response()
}

/// Build a buffered JSON response, attaching the session ID header.
fn json_response(response: &JsonRpcResponse, session_id: Option<&str>) -> Response {
    let body = serde_json::to_string(response).unwrap_or_default();
    let mut resp = (StatusCode::OK, body).into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(sid) = session_id {
        if let Ok(hv) = HeaderValue::from_str(sid) {
            resp.headers_mut()
                .insert(HeaderName::from_static(SESSION_ID_HEADER), hv);
        }
    }
    resp
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .data(serde_json::to_string(&event.payload).unwrap_or_default())
}

/// POST /mcp - Handle JSON-RPC requests.
///
/// `initialize` creates a session and returns the `Mcp-Session-Id`
/// header; all other methods require that header. Client notifications
/// are acknowledged with 202.
pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let accepts = negotiate(&headers);
    if !accepts.json && !accepts.sse {
        return not_acceptable();
    }

    // Transport-level rejection: the body must be a JSON-RPC envelope.
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid JSON-RPC envelope: {}", e)})),
            )
                .into_response();
        }
    };

    debug!(
        "MCP POST: method={}, session={:?}",
        request.method,
        get_session_id(&headers)
    );

    // initialize creates the session; the response is always buffered
    // JSON so the client can read the session header before streaming.
    if request.method == "initialize" {
        let session = state.sessions().create_session().await;
        info!("New session initialized: {}", session.id());
        return match Dispatcher::dispatch(&state, &session, request).await {
            Some(response) => json_response(&response, Some(session.id())),
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
    }

    let session_id = match get_session_id(&headers) {
        Some(id) => id,
        None => return session_required(),
    };
    let session = match state.sessions().get(&session_id).await {
        Some(session) => session,
        None => return session_not_found(),
    };
    session.touch().await;

    if request.is_notification() {
        // Fire-and-forget; errors for notifications are not reported.
        Dispatcher::dispatch(&state, &session, request).await;
        return StatusCode::ACCEPTED.into_response();
    }

    // One in-flight request per session.
    let permit = match state.options().busy_policy {
        BusyPolicy::Queue => session.begin_dispatch().await,
        BusyPolicy::Reject => match session.try_begin_dispatch() {
            Some(permit) => permit,
            None => {
                let response = JsonRpcResponse::error(
                    request.id.clone(),
                    code::SESSION_BUSY,
                    "Another request is in flight on this session",
                );
                return json_response(&response, Some(&session_id));
            }
        },
    };

    if accepts.sse && !state.options().json_only {
        stream_request(state, session, request, permit)
    } else {
        let response = Dispatcher::dispatch(&state, &session, request).await;
        drop(permit);
        match response {
            Some(response) => json_response(&response, Some(&session_id)),
            None => StatusCode::ACCEPTED.into_response(),
        }
    }
}

/// Cancels the in-flight request if the client disconnects before the
/// terminal response was delivered.
struct DisconnectGuard {
    session: Session,
    request_id: Value,
    done: Arc<AtomicBool>,
}

impl DisconnectGuard {
    fn complete(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            let session = self.session.clone();
            let request_id = self.request_id.clone();
            tokio::spawn(async move {
                if session.cancel_request(&request_id).await {
                    debug!("Client disconnected, cancelled request {}", request_id);
                }
            });
        }
    }
}

/// Run a request while streaming its events over SSE.
///
/// The subscription is taken before the handler starts, so every event
/// the handler emits is observed. The stream ends right after the
/// terminal response event; the spawned task holds the dispatch permit
/// until the handler is done.
fn stream_request(
    state: AppState,
    session: Session,
    request: JsonRpcRequest,
    permit: DispatchPermit,
) -> Response {
    let request_id = request.id.clone().unwrap_or(Value::Null);
    let rx = session.subscribe();

    let guard = DisconnectGuard {
        session: session.clone(),
        request_id: request_id.clone(),
        done: Arc::new(AtomicBool::new(false)),
    };

    let task_session = session.clone();
    let task_request_id = request_id.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if let Some(response) = Dispatcher::dispatch(&state, &task_session, request).await {
            // Record the response in the event log so a resuming client
            // still receives it, then let the stream pick it up.
            if let Err(e) = task_session
                .notifier()
                .response(Some(task_request_id), &response)
                .await
            {
                warn!("Failed to record response event: {}", e);
            }
        }
    });

    let stream = stream::unfold(
        (rx, guard, false),
        move |(mut rx, guard, done)| {
            let request_id = request_id.clone();
            async move {
                if done {
                    return None;
                }
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if event.related_request_id.as_ref() != Some(&request_id) {
                                continue;
                            }
                            let is_response = event.is_response();
                            if is_response {
                                guard.complete();
                            }
                            return Some((
                                Ok::<_, Infallible>(sse_event(&event)),
                                (rx, guard, is_response),
                            ));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("SSE consumer lagged, skipped {} events", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        },
    );

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}

/// GET /mcp - Open the session-wide SSE stream.
///
/// With `Last-Event-ID: N` the retained tail after `N` is replayed
/// before live delivery, with no duplicate and no gap between them: the
/// live subscription is taken before the replay snapshot, and live
/// events at or below the replayed tail are dropped.
pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let accepts = negotiate(&headers);

    let session_id = match get_session_id(&headers) {
        Some(id) => id,
        None => return session_required(),
    };
    let session = match state.sessions().get(&session_id).await {
        Some(session) => session,
        None => return session_not_found(),
    };
    if !accepts.sse {
        return not_acceptable();
    }
    session.touch().await;

    let after = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    // Subscribe first; anything emitted from here on reaches the live
    // receiver, anything earlier is in the replay snapshot.
    let rx = session.subscribe();
    let replay = match state
        .store()
        .replay_from(&session_id, after.unwrap_or(0))
        .await
    {
        Ok(replay) => replay,
        Err(_) => return session_not_found(),
    };

    info!(
        "SSE stream opened for session {} (resume after {:?}, replaying {})",
        session_id,
        after,
        replay.events.len()
    );

    let boundary = replay
        .events
        .last()
        .map(|e| e.sequence)
        .unwrap_or(after.unwrap_or(0));

    // An explicit gap marker instead of silently skipping evicted events.
    let gap = replay.truncated.map(|oldest| {
        Ok::<_, Infallible>(
            Event::default()
                .event("gap")
                .data(json!({ "oldestRetained": oldest }).to_string()),
        )
    });

    let replayed: Vec<_> = replay
        .events
        .iter()
        .map(|event| Ok::<_, Infallible>(sse_event(event)))
        .collect();

    let stream = stream::iter(gap)
        .chain(stream::iter(replayed))
        .chain(live_stream(rx, boundary));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}

/// Live tail of a session stream, deduplicated against a replayed prefix.
fn live_stream(
    rx: broadcast::Receiver<StreamEvent>,
    boundary: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |result| {
        future::ready(match result {
            Ok(event) if event.sequence > boundary => Some(Ok(sse_event(&event))),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("SSE subscriber lagged, skipped {} events", skipped);
                None
            }
        })
    })
}

/// DELETE /mcp - Terminate a session.
///
/// Terminates the session identified by the `Mcp-Session-Id` header and
/// drops its event log.
pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = match get_session_id(&headers) {
        Some(id) => id,
        None => return session_required(),
    };

    if state.sessions().terminate(&session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        session_not_found()
    }
}
