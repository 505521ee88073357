use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream};
use trellis_common::protocol::error::{PARSE_ERROR, TRANSACTION_FAILED};
use trellis_common::protocol::message::{ChangeEvent, ClientMessage, ServerMessage, TxOperation};
use trellis_common::types::{ClientId, DocPath, FieldValue, Fields, LockMode};
use trellis_server::persist::SnapshotDb;
use trellis_server::session::SyncState;
use trellis_server::ws;
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(state: SyncState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let task = tokio::spawn(async move {
        ws::serve(listener, state).await.expect("sync server should run");
    });
    (format!("ws://{addr}/sync"), task)
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.expect("client should connect");
    socket
}

async fn send(socket: &mut Socket, frame: &ClientMessage) {
    let encoded = serde_json::to_string(frame).expect("frame should serialize");
    socket.send(WsFrame::Text(encoded.into())).await.expect("frame should send");
}

async fn send_raw(socket: &mut Socket, raw: &str) {
    socket.send(WsFrame::Text(raw.to_string().into())).await.expect("frame should send");
}

async fn recv(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("server should reply in time")
            .expect("socket should stay open")
            .expect("frame should read");
        match frame {
            WsFrame::Text(payload) => {
                return serde_json::from_str(payload.as_str()).expect("frame should parse");
            }
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn hello(socket: &mut Socket) -> ClientId {
    send(socket, &ClientMessage::Hello { token: None, client_id: None }).await;
    match recv(socket).await {
        ServerMessage::HelloAck { client_id, .. } => client_id,
        other => panic!("expected helloAck, got {other:?}"),
    }
}

fn title_fields(title: &str) -> Fields {
    BTreeMap::from([("title".to_string(), FieldValue::from(title))])
}

fn create_op(path: DocPath, fields: Fields) -> ClientMessage {
    ClientMessage::Transaction {
        id: 1,
        operations: vec![TxOperation::Create { path, data: fields }],
    }
}

#[tokio::test]
async fn snapshot_then_live_changes_reach_other_clients() {
    let (url, server) = start_server(SyncState::new()).await;

    let mut writer = connect(&url).await;
    let writer_id = hello(&mut writer).await;
    send(&mut writer, &create_op(DocPath::new("p", "page-1"), title_fields("First"))).await;
    assert!(matches!(recv(&mut writer).await, ServerMessage::TransactionResult { .. }));

    let mut reader = connect(&url).await;
    hello(&mut reader).await;
    send(
        &mut reader,
        &ClientMessage::Subscribe { id: 10, collection: "p".into(), query: Default::default() },
    )
    .await;
    let ServerMessage::SubscribeResult { subscription_id, .. } = recv(&mut reader).await else {
        panic!("expected subscribeResult before the snapshot");
    };

    // Snapshot semantics: the existing document arrives as a synthetic add.
    let ServerMessage::Change { subscription_id: sub, event, .. } = recv(&mut reader).await
    else {
        panic!("expected snapshot change");
    };
    assert_eq!(sub, subscription_id);
    assert!(matches!(event, ChangeEvent::Added { doc } if doc.id == "page-1"));

    // A live update fans out, stamped with the writer's identity.
    send(
        &mut writer,
        &ClientMessage::Transaction {
            id: 2,
            operations: vec![TxOperation::Update {
                path: DocPath::new("p", "page-1"),
                data: title_fields("Renamed"),
            }],
        },
    )
    .await;
    assert!(matches!(recv(&mut writer).await, ServerMessage::TransactionResult { .. }));

    let ServerMessage::Change { updated_by, event, .. } = recv(&mut reader).await else {
        panic!("expected live change");
    };
    assert_eq!(updated_by, Some(writer_id));
    let ChangeEvent::Modified { doc } = event else {
        panic!("expected modified event");
    };
    assert_eq!(doc.fields.get("title"), Some(&FieldValue::from("Renamed")));

    // Deletion arrives as `removed` with no payload.
    send(
        &mut writer,
        &ClientMessage::Transaction {
            id: 3,
            operations: vec![TxOperation::Delete { path: DocPath::new("p", "page-1") }],
        },
    )
    .await;
    assert!(matches!(recv(&mut writer).await, ServerMessage::TransactionResult { .. }));
    let ServerMessage::Change { event, .. } = recv(&mut reader).await else {
        panic!("expected removal change");
    };
    assert!(matches!(event, ChangeEvent::Removed { doc_id } if doc_id == "page-1"));

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn hard_lock_excludes_until_disconnect() {
    let (url, server) = start_server(SyncState::new()).await;
    let path = DocPath::new("b", "block-1");

    let mut holder = connect(&url).await;
    let holder_id = hello(&mut holder).await;
    send(&mut holder, &ClientMessage::Lock { id: 1, path: path.clone(), mode: LockMode::Hard })
        .await;
    assert!(matches!(recv(&mut holder).await, ServerMessage::LockResult { locked: true, .. }));

    let mut waiter = connect(&url).await;
    hello(&mut waiter).await;
    send(&mut waiter, &ClientMessage::Lock { id: 2, path: path.clone(), mode: LockMode::Soft })
        .await;
    let ServerMessage::LockResult { locked, holder: blocked_by, mode, .. } =
        recv(&mut waiter).await
    else {
        panic!("expected lock result");
    };
    assert!(!locked);
    assert_eq!(blocked_by, Some(holder_id));
    assert_eq!(mode, Some(LockMode::Hard));

    // Dropping the holder's socket releases its locks server-side.
    drop(holder);
    let mut granted = false;
    for attempt in 0..50u64 {
        send(
            &mut waiter,
            &ClientMessage::Lock { id: 100 + attempt, path: path.clone(), mode: LockMode::Hard },
        )
        .await;
        if matches!(recv(&mut waiter).await, ServerMessage::LockResult { locked: true, .. }) {
            granted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(granted, "lock should be granted after the holder disconnected");

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn failed_transaction_applies_nothing() {
    let (url, server) = start_server(SyncState::new()).await;
    let mut client = connect(&url).await;
    hello(&mut client).await;

    let path = DocPath::new("p", "page-1");
    send(&mut client, &create_op(path.clone(), title_fields("Original"))).await;
    assert!(matches!(recv(&mut client).await, ServerMessage::TransactionResult { .. }));

    send(
        &mut client,
        &ClientMessage::Transaction {
            id: 2,
            operations: vec![
                TxOperation::Replace { path: path.clone(), data: title_fields("Clobbered") },
                TxOperation::Create { path: path.clone(), data: title_fields("Dup") },
            ],
        },
    )
    .await;
    let ServerMessage::Error { id, code, details, .. } = recv(&mut client).await else {
        panic!("expected transaction error");
    };
    assert_eq!(id, Some(2));
    assert_eq!(code, TRANSACTION_FAILED);
    assert_eq!(details.expect("details should name the op")["failedOperation"], 1);

    send(&mut client, &ClientMessage::Get { id: 3, path }).await;
    let ServerMessage::GetResult { document, .. } = recv(&mut client).await else {
        panic!("expected get result");
    };
    assert_eq!(
        document.expect("document should survive").fields.get("title"),
        Some(&FieldValue::from("Original"))
    );

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn heartbeats_and_malformed_frames_keep_the_connection_alive() {
    let (url, server) = start_server(SyncState::new()).await;
    let mut client = connect(&url).await;
    hello(&mut client).await;

    send(&mut client, &ClientMessage::Ping).await;
    assert!(matches!(recv(&mut client).await, ServerMessage::Pong));

    send_raw(&mut client, "{definitely not json").await;
    let ServerMessage::Error { id, code, .. } = recv(&mut client).await else {
        panic!("expected parse error");
    };
    assert_eq!(id, None);
    assert_eq!(code, PARSE_ERROR);

    // The connection still works afterwards.
    send(&mut client, &ClientMessage::Ping).await;
    assert!(matches!(recv(&mut client).await, ServerMessage::Pong));

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn documents_survive_a_server_restart() {
    let dir = tempfile::tempdir().expect("temp dir should create");
    let db_path = dir.path().join("trellis.db");

    let state = SyncState::with_persistence(SnapshotDb::open(&db_path).expect("db should open"))
        .expect("state should load");
    let (url, server) = start_server(state).await;

    let mut client = connect(&url).await;
    hello(&mut client).await;
    send(&mut client, &create_op(DocPath::new("p", "page-1"), title_fields("Durable"))).await;
    assert!(matches!(recv(&mut client).await, ServerMessage::TransactionResult { .. }));

    drop(client);
    server.abort();
    let _ = server.await;

    let reopened =
        SyncState::with_persistence(SnapshotDb::open(&db_path).expect("db should reopen"))
            .expect("state should reload");
    assert_eq!(reopened.document_count().await, 1);

    let (url, server) = start_server(reopened).await;
    let mut client = connect(&url).await;
    hello(&mut client).await;
    send(&mut client, &ClientMessage::Get { id: 1, path: DocPath::new("p", "page-1") }).await;
    let ServerMessage::GetResult { document, .. } = recv(&mut client).await else {
        panic!("expected get result");
    };
    assert_eq!(
        document.expect("document should persist").fields.get("title"),
        Some(&FieldValue::from("Durable"))
    );

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn rejoining_client_keeps_its_identity() {
    let (url, server) = start_server(SyncState::new()).await;

    let mut client = connect(&url).await;
    let supplied = Uuid::new_v4();
    send(&mut client, &ClientMessage::Hello { token: None, client_id: Some(supplied) }).await;
    let ServerMessage::HelloAck { client_id, .. } = recv(&mut client).await else {
        panic!("expected helloAck");
    };
    assert_eq!(client_id, supplied);

    server.abort();
    let _ = server.await;
}
