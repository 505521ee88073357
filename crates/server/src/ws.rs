// WebSocket endpoint for the sync protocol.
//
// One socket per client. Inbound frames dispatch through the session layer;
// replies and subscription fan-out share the connection's outbound channel,
// drained here into the socket.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::session::{self, Session, SyncState};

pub fn router(state: SyncState) -> Router {
    Router::new().route("/sync", get(sync_ws_route)).with_state(state)
}

pub async fn serve(listener: TcpListener, state: SyncState) -> Result<()> {
    axum::serve(listener, router(state)).await.context("sync websocket server failed")
}

async fn sync_ws_route(
    ws: WebSocketUpgrade,
    State(state): State<SyncState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SyncState) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(outbound_tx);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                match message {
                    WsMessage::Text(payload) => {
                        session::handle_frame(&state, &mut session, payload.as_bytes()).await;
                    }
                    WsMessage::Binary(payload) => {
                        session::handle_frame(&state, &mut session, payload.as_ref()).await;
                    }
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    break;
                };
                let Ok(encoded) = serde_json::to_string(&frame) else {
                    break;
                };
                if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session::disconnect(&state, &session).await;
}
