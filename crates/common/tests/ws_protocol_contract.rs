use std::collections::BTreeMap;

use trellis_common::protocol::message::{ChangeEvent, ClientMessage, ServerMessage};
use trellis_common::protocol::CURRENT_PROTOCOL_VERSION;
use trellis_common::query::{AggregateResult, QuerySpec};
use trellis_common::types::{DocPath, Document, LockMode};
use uuid::Uuid;

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/ws-protocol.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn contract_strings(contract: &serde_json::Value, key: &str) -> Vec<String> {
    contract[key]
        .as_array()
        .unwrap_or_else(|| panic!("{key} should be an array"))
        .iter()
        .map(|v| v.as_str().expect("entry should be a string").to_string())
        .collect()
}

fn type_tag(value: &impl serde::Serialize) -> String {
    let encoded = serde_json::to_value(value).expect("message should serialize");
    encoded["type"].as_str().expect("message should carry a type tag").to_string()
}

fn sample_doc() -> Document {
    Document::new("d-1", BTreeMap::new())
}

fn sample_aggregate() -> AggregateResult {
    AggregateResult { groups: Vec::new(), size: 0, empty: true }
}

#[test]
fn current_version_matches_contract() {
    let contract = load_contract();
    let expected =
        contract["current_version"].as_str().expect("current_version should be a string");
    assert_eq!(CURRENT_PROTOCOL_VERSION, expected);
}

#[test]
fn client_message_tags_match_contract() {
    let sub = Uuid::nil();
    let frames = vec![
        ClientMessage::Hello { token: None, client_id: None },
        ClientMessage::Query { id: 1, collection: "p".into(), query: QuerySpec::default() },
        ClientMessage::Get { id: 2, path: DocPath::new("p", "d-1") },
        ClientMessage::Subscribe { id: 3, collection: "p".into(), query: QuerySpec::default() },
        ClientMessage::Unsubscribe { id: 4, subscription_id: sub },
        ClientMessage::Transaction { id: 5, operations: Vec::new() },
        ClientMessage::Lock { id: 6, path: DocPath::new("p", "d-1"), mode: LockMode::Soft },
        ClientMessage::Unlock { id: 7, path: DocPath::new("p", "d-1") },
        ClientMessage::CreateIndex { id: 8, collection: "p".into(), fields: Vec::new() },
        ClientMessage::Ping,
    ];

    let actual: Vec<String> = frames.iter().map(type_tag).collect();
    assert_eq!(actual, contract_strings(&load_contract(), "client_messages"));
}

#[test]
fn server_message_tags_match_contract() {
    let sub = Uuid::nil();
    let client = Uuid::nil();
    let frames = vec![
        ServerMessage::HelloAck { client_id: client, server_time: chrono::Utc::now() },
        ServerMessage::QueryResult { id: 1, documents: Some(Vec::new()), aggregate: None },
        ServerMessage::GetResult { id: 2, document: None },
        ServerMessage::SubscribeResult { id: 3, subscription_id: sub },
        ServerMessage::UnsubscribeResult { id: 4 },
        ServerMessage::TransactionResult { id: 5, applied: 0 },
        ServerMessage::LockResult { id: 6, locked: true, holder: None, mode: None },
        ServerMessage::UnlockResult { id: 7 },
        ServerMessage::CreateIndexResult { id: 8, created: true },
        ServerMessage::error(Some(9), 4004, "missing"),
        ServerMessage::Change {
            subscription_id: sub,
            collection: "p".into(),
            updated_by: None,
            event: ChangeEvent::Added { doc: sample_doc() },
        },
        ServerMessage::Pong,
    ];

    let actual: Vec<String> = frames.iter().map(type_tag).collect();
    assert_eq!(actual, contract_strings(&load_contract(), "server_messages"));
}

#[test]
fn change_kinds_match_contract() {
    let events = vec![
        ChangeEvent::Added { doc: sample_doc() },
        ChangeEvent::Modified { doc: sample_doc() },
        ChangeEvent::Removed { doc_id: "d-1".into() },
        ChangeEvent::Aggregate { result: sample_aggregate() },
    ];

    let actual: Vec<String> = events
        .iter()
        .map(|event| {
            let encoded = serde_json::to_value(event).expect("event should serialize");
            encoded["kind"].as_str().expect("event should carry a kind tag").to_string()
        })
        .collect();
    assert_eq!(actual, contract_strings(&load_contract(), "change_kinds"));
}

#[test]
fn round_trip_preserves_every_request() {
    let frames = vec![
        ClientMessage::Hello { token: Some("bearer-x".into()), client_id: Some(Uuid::new_v4()) },
        ClientMessage::Lock { id: 1, path: DocPath::new("b", "block-9"), mode: LockMode::Hard },
    ];
    for frame in frames {
        let encoded = serde_json::to_string(&frame).expect("frame should serialize");
        let decoded: ClientMessage = serde_json::from_str(&encoded).expect("frame should parse");
        assert_eq!(decoded, frame);
    }
}
