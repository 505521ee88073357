// WebSocket connection actor.
//
// One task owns the socket. Handles talk to it over a command channel;
// request ids correlate replies back to oneshot senders, and `change`
// frames route to per-subscription channels. The actor also answers the
// heartbeat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use trellis_common::protocol::message::{ChangeEvent, ClientMessage, ServerMessage};
use trellis_common::types::ClientId;
use uuid::Uuid;

use crate::config::ClientConfig;

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake rejected ({code}): {message}")]
    Handshake { code: i32, message: String },
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// One subscription event as delivered to consumers.
#[derive(Debug, Clone)]
pub struct ChangeMessage {
    pub subscription_id: Uuid,
    pub collection: String,
    pub updated_by: Option<ClientId>,
    pub event: ChangeEvent,
}

pub(crate) enum Command {
    Request {
        id: u64,
        frame: ClientMessage,
        reply: oneshot::Sender<Result<ServerMessage, ClientError>>,
    },
    Subscribe {
        id: u64,
        frame: ClientMessage,
        reply: oneshot::Sender<Result<SubscriptionHandle, ClientError>>,
    },
    Unsubscribe {
        subscription_id: Uuid,
    },
}

pub(crate) struct SubscriptionHandle {
    pub subscription_id: Uuid,
    pub receiver: mpsc::UnboundedReceiver<ChangeMessage>,
}

enum Pending {
    Plain(oneshot::Sender<Result<ServerMessage, ClientError>>),
    Subscribe(oneshot::Sender<Result<SubscriptionHandle, ClientError>>),
    /// Reply is irrelevant (actor-originated unsubscribes).
    Ignore,
}

/// Dial the server and complete the hello handshake.
pub(crate) async fn connect(config: &ClientConfig) -> Result<(Socket, ClientId), ClientError> {
    let url = url::Url::parse(&config.url)?;
    let (mut socket, _) = connect_async(url.as_str()).await?;

    let hello = ClientMessage::Hello { token: config.token.clone(), client_id: config.client_id };
    send_frame(&mut socket, &hello).await?;

    loop {
        let Some(frame) = socket.next().await else {
            return Err(ClientError::ConnectionClosed);
        };
        match frame? {
            tungstenite::Message::Text(payload) => {
                let message: ServerMessage = serde_json::from_str(payload.as_str())
                    .map_err(|error| ClientError::Protocol(error.to_string()))?;
                match message {
                    ServerMessage::HelloAck { client_id, .. } => return Ok((socket, client_id)),
                    ServerMessage::Error { code, message, .. } => {
                        return Err(ClientError::Handshake { code, message });
                    }
                    other => {
                        return Err(ClientError::Protocol(format!(
                            "unexpected handshake reply: {other:?}"
                        )));
                    }
                }
            }
            tungstenite::Message::Close(_) => return Err(ClientError::ConnectionClosed),
            _ => continue,
        }
    }
}

pub(crate) struct ConnectionActor {
    socket: Socket,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: HashMap<u64, Pending>,
    routes: HashMap<Uuid, mpsc::UnboundedSender<ChangeMessage>>,
    request_ids: Arc<AtomicU64>,
    heartbeat: Duration,
}

impl ConnectionActor {
    /// Take ownership of the socket and run until it closes or every
    /// handle is gone.
    pub(crate) fn spawn(
        socket: Socket,
        heartbeat: Duration,
        request_ids: Arc<AtomicU64>,
    ) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Self {
            socket,
            commands: rx,
            pending: HashMap::new(),
            routes: HashMap::new(),
            request_ids,
            heartbeat,
        };
        tokio::spawn(actor.run());
        tx
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if self.handle_command(command).await.is_err() {
                        break;
                    }
                }
                frame = self.socket.next() => {
                    let Some(Ok(frame)) = frame else {
                        break;
                    };
                    if self.handle_frame(frame).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if send_frame(&mut self.socket, &ClientMessage::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.fail_all();
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ()> {
        match command {
            Command::Request { id, frame, reply } => {
                self.pending.insert(id, Pending::Plain(reply));
                self.send(&frame).await
            }
            Command::Subscribe { id, frame, reply } => {
                self.pending.insert(id, Pending::Subscribe(reply));
                self.send(&frame).await
            }
            Command::Unsubscribe { subscription_id } => {
                self.routes.remove(&subscription_id);
                self.send_unsubscribe(subscription_id).await
            }
        }
    }

    async fn handle_frame(&mut self, frame: tungstenite::Message) -> Result<(), ()> {
        let message = match frame {
            tungstenite::Message::Text(payload) => {
                match serde_json::from_str::<ServerMessage>(payload.as_str()) {
                    Ok(message) => message,
                    Err(parse_error) => {
                        warn!(%parse_error, "dropping unreadable server frame");
                        return Ok(());
                    }
                }
            }
            tungstenite::Message::Close(_) => return Err(()),
            _ => return Ok(()),
        };

        match message {
            ServerMessage::Change { subscription_id, collection, updated_by, event } => {
                self.route_change(subscription_id, collection, updated_by, event).await
            }
            ServerMessage::Pong => Ok(()),
            ServerMessage::Error { id: None, code, message, .. } => {
                warn!(code, %message, "connection-level server error");
                Ok(())
            }
            reply => {
                let Some(request_id) = reply.request_id() else {
                    debug!(?reply, "ignoring unsolicited frame");
                    return Ok(());
                };
                let Some(pending) = self.pending.remove(&request_id) else {
                    return Ok(());
                };
                match pending {
                    Pending::Plain(sender) => {
                        let _ = sender.send(unwrap_reply(reply));
                    }
                    Pending::Subscribe(sender) => match unwrap_reply(reply) {
                        Ok(ServerMessage::SubscribeResult { subscription_id, .. }) => {
                            let (tx, rx) = mpsc::unbounded_channel();
                            self.routes.insert(subscription_id, tx);
                            let _ = sender
                                .send(Ok(SubscriptionHandle { subscription_id, receiver: rx }));
                        }
                        Ok(other) => {
                            let _ = sender.send(Err(ClientError::Protocol(format!(
                                "subscribe answered with {other:?}"
                            ))));
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error));
                        }
                    },
                    Pending::Ignore => {}
                }
                Ok(())
            }
        }
    }

    async fn route_change(
        &mut self,
        subscription_id: Uuid,
        collection: String,
        updated_by: Option<ClientId>,
        event: ChangeEvent,
    ) -> Result<(), ()> {
        let stale = match self.routes.get(&subscription_id) {
            Some(route) => route
                .send(ChangeMessage { subscription_id, collection, updated_by, event })
                .is_err(),
            // Frames can race an unsubscribe; drop them quietly.
            None => false,
        };
        if stale {
            // Receiver dropped without an explicit unsubscribe.
            self.routes.remove(&subscription_id);
            return self.send_unsubscribe(subscription_id).await;
        }
        Ok(())
    }

    async fn send_unsubscribe(&mut self, subscription_id: Uuid) -> Result<(), ()> {
        let id = self.request_ids.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(id, Pending::Ignore);
        self.send(&ClientMessage::Unsubscribe { id, subscription_id }).await
    }

    async fn send(&mut self, frame: &ClientMessage) -> Result<(), ()> {
        send_frame(&mut self.socket, frame).await.map_err(|_| ())
    }

    /// Reject every pending request and close every subscription stream.
    /// In-flight writes are not retried.
    fn fail_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Plain(sender) => {
                    let _ = sender.send(Err(ClientError::ConnectionClosed));
                }
                Pending::Subscribe(sender) => {
                    let _ = sender.send(Err(ClientError::ConnectionClosed));
                }
                Pending::Ignore => {}
            }
        }
        self.routes.clear();
    }
}

fn unwrap_reply(reply: ServerMessage) -> Result<ServerMessage, ClientError> {
    match reply {
        ServerMessage::Error { code, message, .. } => Err(ClientError::Server { code, message }),
        other => Ok(other),
    }
}

async fn send_frame(socket: &mut Socket, frame: &ClientMessage) -> Result<(), ClientError> {
    let encoded = serde_json::to_string(frame)
        .map_err(|error| ClientError::Protocol(error.to_string()))?;
    socket.send(tungstenite::Message::Text(encoded.into())).await?;
    Ok(())
}
