mod common;

use babel_server::domain::event::{ClientFrame, ServerEvent, SyncBatch};
use common::{TestApp, send_frame, wait_for_event};
use uuid::Uuid;

async fn sync(app: &TestApp, user: Uuid, last_seen_id: Option<Uuid>) -> SyncBatch {
    let path = match last_seen_id {
        Some(id) => format!("/v1/sync?last_seen_id={id}"),
        None => "/v1/sync".to_string(),
    };
    let res = app.get(user, &path).await;
    assert_eq!(res.status(), 200);
    res.json().await.unwrap()
}

#[tokio::test]
async fn test_sync_is_capped_and_resumable() {
    let app = TestApp::spawn().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    for i in 0..150 {
        app.send_text(alice, bob, &format!("backlog {i}")).await;
    }

    let first = sync(&app, bob, None).await;
    assert_eq!(first.count, 100);
    assert!(first.truncated);
    assert_eq!(first.messages[0].content, "backlog 0");
    assert!(first.messages.windows(2).all(|w| w[0].created_at < w[1].created_at));

    let anchor = first.messages.last().unwrap().id;
    let rest = sync(&app, bob, Some(anchor)).await;
    assert_eq!(rest.count, 50);
    assert!(!rest.truncated);
    assert_eq!(rest.messages[0].content, "backlog 100");
    assert_eq!(rest.messages[49].content, "backlog 149");

    let empty = sync(&app, bob, Some(rest.messages[49].id)).await;
    assert_eq!(empty.count, 0);
    assert!(!empty.truncated);
}

#[tokio::test]
async fn test_sync_never_leaks_other_conversations() {
    let app = TestApp::spawn().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let eve = Uuid::new_v4();

    let private = app.send_text(alice, bob, "between us").await;
    app.send_text(eve, alice, "hi alice").await;

    let batch = sync(&app, eve, None).await;
    assert_eq!(batch.count, 1);
    assert_eq!(batch.messages[0].content, "hi alice");

    // An anchor from someone else's chat behaves like no anchor at all.
    let private_id: Uuid = private["id"].as_str().unwrap().parse().unwrap();
    let batch = sync(&app, eve, Some(private_id)).await;
    assert_eq!(batch.count, 1);
    assert_eq!(batch.messages[0].content, "hi alice");
}

#[tokio::test]
async fn test_unknown_anchor_starts_from_beginning() {
    let app = TestApp::spawn().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    app.send_text(alice, bob, "one").await;
    app.send_text(bob, alice, "two").await;

    let batch = sync(&app, alice, Some(Uuid::new_v4())).await;
    assert_eq!(batch.count, 2);
}

#[tokio::test]
async fn test_sync_includes_group_messages() {
    let app = TestApp::spawn().await;
    let group = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    app.directory.add_member(group, alice);
    app.directory.add_member(group, bob);

    let res = app.post(alice, "/v1/messages", &serde_json::json!({ "group_id": group, "content": "team" })).await;
    assert_eq!(res.status(), 201);

    let batch = sync(&app, bob, None).await;
    assert_eq!(batch.count, 1);
    assert_eq!(batch.messages[0].group_id(), Some(group));

    let outsider = sync(&app, Uuid::new_v4(), None).await;
    assert_eq!(outsider.count, 0);
}

#[tokio::test]
async fn test_gateway_sync_frame() {
    let app = TestApp::spawn().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    for i in 0..3 {
        app.send_text(alice, bob, &format!("missed {i}")).await;
    }

    let mut ws = app.connect(bob).await;
    send_frame(&mut ws, &ClientFrame::Sync { last_seen_id: None }).await;

    let event = wait_for_event(&mut ws, |e| matches!(e, ServerEvent::SyncResult(_))).await;
    let ServerEvent::SyncResult(batch) = event else { unreachable!() };
    assert_eq!(batch.count, 3);
    assert!(!batch.truncated);
    assert_eq!(batch.messages[2].content, "missed 2");
}
