use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{json, Value};
use uuid::Uuid;

use super::AppState;

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().to_string();
    let mut rx = state.sink.register(session_id.clone());

    if socket
        .send(Message::Text(json!({"type": "connected", "session_id": session_id}).to_string()))
        .await
        .is_err()
    {
        state.sink.unregister(&session_id);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some((name, payload)) => {
                        let frame = json!({ "type": name, "payload": payload });
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &mut socket, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    disconnect(&state, &session_id).await;
}

async fn handle_client_message(state: &Arc<AppState>, socket: &mut WebSocket, text: &str) {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if msg.get("type").and_then(|v| v.as_str()) != Some("get_queue_position") {
        return;
    }
    let Some(job_id) = msg.get("id").and_then(|v| v.as_str()) else {
        return;
    };

    let response = match state.get_job(job_id) {
        None => json!({ "status": "unknown" }),
        Some(job) => {
            if job.status() == crate::job::JobStatus::Waiting {
                json!({ "status": "waiting", "position": state.queue.get_position(job_id) })
            } else {
                json!({ "status": format!("{:?}", job.status()).to_lowercase() })
            }
        }
    };

    let _ = socket
        .send(Message::Text(json!({ "type": "queue_position", "payload": response }).to_string()))
        .await;
}

/// Unregisters the session's sink and, if it was bound to a job, removes the
/// Observer from both the registry and the job without affecting its
/// progress.
async fn disconnect(state: &Arc<AppState>, session_id: &str) {
    state.sink.unregister(session_id);
    if let Some(binding) = state.registry.unbind_session(session_id) {
        if let Some(job) = state.get_job(&binding.job_id) {
            job.unregister_observer(&binding.observer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_frame_serializes_with_session_id() {
        let frame = json!({"type": "connected", "session_id": "abc"});
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["session_id"], "abc");
    }
}
