use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use trellis_client::sync::{CollectionSync, EditorChange, EntityPhase, SyncUpdate};
use trellis_client::tree::{NavigationOutcome, TreeLoader};
use trellis_client::{Client, ClientConfig};
use trellis_common::protocol::message::ChangeEvent;
use trellis_common::types::{
    FieldValue, Fields, LockMode, HAS_CHILDREN_FIELD, PARENT_FIELD, ROOT_SENTINEL,
};
use trellis_server::session::SyncState;
use trellis_server::ws;

async fn start_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let task = tokio::spawn(async move {
        ws::serve(listener, SyncState::new()).await.expect("sync server should run");
    });
    (format!("ws://{addr}/sync"), task)
}

async fn connect(url: &str) -> Client {
    Client::connect(ClientConfig::new(url).with_debounce_millis(150))
        .await
        .expect("client should connect")
}

fn block(content: &str, kind: &str) -> Fields {
    BTreeMap::from([
        ("content".to_string(), FieldValue::from(content)),
        ("kind".to_string(), FieldValue::from(kind)),
    ])
}

fn page_fields(parent: &str, order: f64, has_children: bool) -> Fields {
    BTreeMap::from([
        (PARENT_FIELD.to_string(), FieldValue::from(parent)),
        ("order".to_string(), FieldValue::Number(order)),
        (HAS_CHILDREN_FIELD.to_string(), FieldValue::from(has_children)),
    ])
}

#[tokio::test]
async fn own_echo_is_invisible_while_other_clients_see_the_write() {
    let (url, server) = start_server().await;
    let writer = connect(&url).await;
    let observer = connect(&url).await;

    let mut writer_sync =
        CollectionSync::attach(writer.clone(), "b", "content").await.expect("attach");
    let mut observer_sync =
        CollectionSync::attach(observer.clone(), "b", "content").await.expect("attach");

    writer_sync
        .edit(vec![EditorChange::Insert { id: "b1".into(), fields: block("hello", "text") }])
        .await;

    // The observer reconciles the remote write.
    let update = timeout(Duration::from_secs(5), observer_sync.next_update())
        .await
        .expect("observer should hear the write")
        .expect("stream should stay open");
    assert_eq!(update, SyncUpdate::Applied { id: "b1".into(), fields: block("hello", "text") });

    // The writer's own echo is suppressed: no visible update arrives.
    let echo = timeout(Duration::from_millis(500), writer_sync.next_update()).await;
    assert!(echo.is_err(), "writer should not see its own round-tripped write");

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn rapid_content_edits_collapse_into_one_write() {
    let (url, server) = start_server().await;
    let writer = connect(&url).await;
    let observer = connect(&url).await;

    let mut writer_sync =
        CollectionSync::attach(writer.clone(), "b", "content").await.expect("attach");
    let mut watched = observer.collection("b").subscribe().await.expect("subscribe");

    writer_sync
        .edit(vec![EditorChange::Insert { id: "b1".into(), fields: block("", "text") }])
        .await;
    let first = timeout(Duration::from_secs(5), watched.next())
        .await
        .expect("observer should see the create")
        .expect("stream should stay open");
    assert!(matches!(first.event, ChangeEvent::Added { .. }));

    // A typing burst: content-only edits within the debounce window.
    for text in ["h", "he", "hel", "hell", "hello"] {
        writer_sync
            .edit(vec![EditorChange::Update { id: "b1".into(), fields: block(text, "text") }])
            .await;
    }

    // Let the writer's timer fire (its own echoes stay suppressed).
    let _ = timeout(Duration::from_secs(1), writer_sync.next_update()).await;

    // Exactly one consolidated modification lands, carrying the final text.
    let burst = timeout(Duration::from_secs(5), watched.next())
        .await
        .expect("observer should see the consolidated write")
        .expect("stream should stay open");
    let ChangeEvent::Modified { doc } = burst.event else {
        panic!("expected one modified event, got {:?}", burst.event);
    };
    assert_eq!(doc.fields.get("content"), Some(&FieldValue::from("hello")));

    let extra = timeout(Duration::from_millis(500), watched.next()).await;
    assert!(extra.is_err(), "the burst must collapse into a single write");

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn discrete_edit_preempts_the_debounce_timer() {
    let (url, server) = start_server().await;
    let writer = connect(&url).await;
    let observer = connect(&url).await;

    let mut writer_sync =
        CollectionSync::attach(writer.clone(), "b", "content").await.expect("attach");
    let mut watched = observer.collection("b").subscribe().await.expect("subscribe");

    writer_sync
        .edit(vec![EditorChange::Insert { id: "b1".into(), fields: block("draft", "text") }])
        .await;
    let _ = timeout(Duration::from_secs(5), watched.next()).await.expect("create should arrive");

    // Content edit starts the timer; the kind change must not wait for it.
    writer_sync
        .edit(vec![EditorChange::Update { id: "b1".into(), fields: block("draft2", "text") }])
        .await;
    writer_sync
        .edit(vec![EditorChange::Update { id: "b1".into(), fields: block("draft2", "heading") }])
        .await;

    let immediate = timeout(Duration::from_secs(5), watched.next())
        .await
        .expect("discrete change should arrive without the debounce delay")
        .expect("stream should stay open");
    let ChangeEvent::Modified { doc } = immediate.event else {
        panic!("expected modified event");
    };
    assert_eq!(doc.fields.get("kind"), Some(&FieldValue::from("heading")));
    assert_eq!(doc.fields.get("content"), Some(&FieldValue::from("draft2")));
    assert_eq!(writer_sync.engine().phase("b1"), EntityPhase::Tracked);

    // The cancelled timer produces no second write.
    let _ = timeout(Duration::from_millis(400), writer_sync.next_update()).await;
    let extra = timeout(Duration::from_millis(400), watched.next()).await;
    assert!(extra.is_err(), "pending debounce must be cancelled by the discrete patch");

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn tree_navigation_expands_ancestors_and_detects_orphans() {
    let (url, server) = start_server().await;
    let seeder = connect(&url).await;

    let pages = seeder.collection("p");
    seeder
        .batch()
        .create(&pages.doc("p1"), page_fields(ROOT_SENTINEL, 1.0, true))
        .create(&pages.doc("p2"), page_fields("p1", 1.0, true))
        .create(&pages.doc("p3"), page_fields("p2", 1.0, false))
        .create(&pages.doc("o1"), page_fields("ghost", 1.0, false))
        .commit()
        .await
        .expect("seed batch should commit");

    let reader = connect(&url).await;
    let mut tree = TreeLoader::new(reader.clone(), "p");
    tree.init().await.expect("top level should load");
    assert!(tree.next_change().await, "root snapshot should arrive");

    // Deep link: every ancestor expands, the target becomes visible.
    let outcome = tree.navigate_to_page("p3").await.expect("navigation should succeed");
    assert_eq!(outcome, NavigationOutcome::Navigated);
    for level in [ROOT_SENTINEL, "p1", "p2"] {
        assert!(tree.state().expanded().contains(level), "{level} should be expanded");
    }

    // Wait until the lazily loaded levels deliver the target.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tree.state().pages().get("p3").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "p3 should appear in the tree");
        assert!(tree.next_change().await, "stream should stay open");
    }
    assert!(tree.state().pages_with_children().contains("p1"));

    // The orphan chain stops at a missing ancestor: surfaced separately,
    // nothing newly expanded.
    let expanded_before = tree.state().expanded().clone();
    let outcome = tree.navigate_to_page("o1").await.expect("navigation should succeed");
    assert_eq!(outcome, NavigationOutcome::Orphan);
    let orphan = tree.state().orphan_page().expect("orphan page should be set");
    assert_eq!(orphan.id, "o1");
    assert_eq!(tree.state().expanded(), &expanded_before);

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn collapse_keeps_the_level_subscription_warm() {
    let (url, server) = start_server().await;
    let seeder = connect(&url).await;
    seeder
        .batch()
        .create(&seeder.collection("p").doc("p1"), page_fields(ROOT_SENTINEL, 1.0, true))
        .create(&seeder.collection("p").doc("p1a"), page_fields("p1", 1.0, false))
        .commit()
        .await
        .expect("seed batch should commit");

    let reader = connect(&url).await;
    let mut tree = TreeLoader::new(reader.clone(), "p");
    tree.init().await.expect("top level should load");
    tree.expand("p1").await.expect("child level should load");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tree.state().pages().get("p1a").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "p1a should load");
        assert!(tree.next_change().await, "stream should stay open");
    }

    // Collapse hides the level but keeps its data and subscription.
    tree.collapse("p1");
    assert!(!tree.state().expanded().contains("p1"));
    assert!(tree.state().pages().contains_key("p1a"));

    // Re-expand is instant: no loading state.
    tree.expand("p1").await.expect("re-expand should succeed");
    assert!(tree.state().expanded().contains("p1"));
    assert!(tree.state().loading_children().is_empty());

    // The kept subscription still delivers live updates while collapsed.
    seeder
        .collection("p")
        .doc("p1b")
        .create(page_fields("p1", 2.0, false))
        .await
        .expect("create should commit");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tree.state().pages().get("p1b").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "p1b should stream in");
        assert!(tree.next_change().await, "stream should stay open");
    }

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn focus_takes_a_soft_lock_and_blur_releases_it() {
    let (url, server) = start_server().await;
    let editor = connect(&url).await;
    let rival = connect(&url).await;

    let mut editor_sync =
        CollectionSync::attach(editor.clone(), "b", "content").await.expect("attach");

    let status = editor_sync.focus("b1").await.expect("focus should lock");
    assert!(status.locked);

    // Soft locks coexist; the rival can still mark itself active.
    let rival_status =
        rival.collection("b").doc("b1").lock(LockMode::Soft).await.expect("lock request");
    assert!(rival_status.locked);

    // After blur the editor holds nothing; a hard lock by the rival wins.
    editor_sync.blur().await;
    let rival_status =
        rival.collection("b").doc("b1").lock(LockMode::Hard).await.expect("lock request");
    assert!(rival_status.locked);

    // Now the editor's soft re-focus is denied by the hard lock.
    let denied = editor_sync.focus("b1").await.expect("lock request should complete");
    assert!(!denied.locked);
    assert_eq!(denied.holder, Some(rival.client_id()));
    assert_eq!(denied.mode, Some(LockMode::Hard));

    server.abort();
    let _ = server.await;
}
