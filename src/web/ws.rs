//! Signaling WebSocket endpoint
//!
//! Maps axum WebSocket frames onto the transport-agnostic connection loop
//! in [`crate::signaling::session`]. Ping/pong control frames are answered
//! by axum; binary frames carry no signaling and are ignored.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::signaling::{run_connection, ConnectParams, Frame};
use crate::state::AppState;

/// WebSocket upgrade handler
///
/// Connect parameters (`role`, `user_id`, `user_name`, `broadcaster_id`)
/// come from the query string; validation happens after the upgrade so a
/// rejected client still receives an `error` frame.
pub async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    debug!(
        role = ?params.role,
        user_id = ?params.user_id,
        broadcaster_id = ?params.broadcaster_id,
        "Signaling upgrade requested"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();

    let frames = receiver.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            Ok(Message::Binary(data)) => {
                debug!("Ignoring binary frame ({} bytes)", data.len());
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });

    let sink = sender.with(|frame: Frame| {
        future::ready(Ok::<_, axum::Error>(match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Close => Message::Close(None),
        }))
    });

    run_connection(state.hub.clone(), params, Box::pin(frames), Box::pin(sink)).await;
}
