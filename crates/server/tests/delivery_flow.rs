//! End-to-end coordination scenarios over the real managers, with live
//! connections simulated as channel pairs.

use std::time::Duration;

use strela_server::config::{AppState, ServerConfig};
use strela_server::delivery;
use strela_server::handlers::{close_session, open_session};
use strela_server::models::{MessageKind, ServerEvent};
use strela_server::registry::Outbound;
use strela_server::store::NewMessage;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

async fn test_state() -> (TempDir, AppState) {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(ServerConfig::with_base_dir(dir.path()))
        .await
        .unwrap();
    (dir, state)
}

fn connect(state: &AppState, user_id: &str) -> (u64, UnboundedReceiver<Outbound>) {
    let (tx, rx) = unbounded_channel();
    let conn_id = open_session(state, user_id, tx);
    (conn_id, rx)
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Event(event) = frame {
            events.push(event);
        }
    }
    events
}

fn text_input(sender: &str, receiver: &str, text: &str) -> NewMessage {
    NewMessage {
        sender_id: sender.to_string(),
        receiver_id: receiver.to_string(),
        text: Some(text.to_string()),
        attachment: None,
        kind: MessageKind::Text,
        duration_secs: None,
    }
}

#[tokio::test]
async fn online_send_delivers_once_and_acks_once() {
    let (_dir, state) = test_state().await;
    let (_a_conn, mut rx_a) = connect(&state, "alice");
    let (_b_conn, mut rx_b) = connect(&state, "bob");
    drain(&mut rx_a);
    drain(&mut rx_b);

    delivery::send_message(&state, "alice", text_input("alice", "bob", "hi"))
        .await
        .unwrap();

    let b_events = drain(&mut rx_b);
    assert_eq!(b_events.len(), 1);
    match &b_events[0] {
        ServerEvent::MessageDelivered { message } => {
            assert_eq!(message.sender_id, "alice");
            assert_eq!(message.text.as_deref(), Some("hi"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let a_events = drain(&mut rx_a);
    assert_eq!(a_events.len(), 1);
    assert!(matches!(&a_events[0], ServerEvent::SelfAck { message } if message.text.as_deref() == Some("hi")));

    // Both summaries show the preview "hi".
    let a_list = state.conversations.list(&state.store, "alice").await.unwrap();
    assert_eq!(a_list[0].last_message, "hi");
    assert_eq!(a_list[0].unread_count, 0);

    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list[0].last_message, "hi");
    assert_eq!(b_list[0].unread_count, 1);
}

#[tokio::test]
async fn offline_receiver_gets_no_live_event_but_history_and_summary_reflect_it() {
    let (_dir, state) = test_state().await;
    let (_a_conn, mut rx_a) = connect(&state, "alice");
    drain(&mut rx_a);

    delivery::send_message(
        &state,
        "alice",
        NewMessage {
            sender_id: "alice".into(),
            receiver_id: "bob".into(),
            text: None,
            attachment: Some("abc123_cat.jpg".into()),
            kind: MessageKind::Image,
            duration_secs: None,
        },
    )
    .await
    .unwrap();

    // Sender still gets the ack; the offline peer's event is dropped.
    assert_eq!(drain(&mut rx_a).len(), 1);

    let history = state.store.fetch_conversation("bob", "alice", 100).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, MessageKind::Image);

    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list.len(), 1);
    assert_eq!(b_list[0].last_message, "\u{1F4F7} Photo");
    assert_eq!(b_list[0].unread_count, 1);
}

#[tokio::test]
async fn receiver_viewing_conversation_suppresses_unread() {
    let (_dir, state) = test_state().await;
    let (_a_conn, _rx_a) = connect(&state, "alice");
    let (_b_conn, _rx_b) = connect(&state, "bob");
    state.registry.set_viewing("bob", Some("alice"));

    delivery::send_message(&state, "alice", text_input("alice", "bob", "hi"))
        .await
        .unwrap();

    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list[0].unread_count, 0);
}

#[tokio::test]
async fn edit_and_delete_propagate_in_place() {
    let (_dir, state) = test_state().await;
    let (_a_conn, mut rx_a) = connect(&state, "alice");
    let (_b_conn, mut rx_b) = connect(&state, "bob");
    drain(&mut rx_a);
    drain(&mut rx_b);

    let msg = delivery::send_message(&state, "alice", text_input("alice", "bob", "typo"))
        .await
        .unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    delivery::edit_message(&state, "alice", &msg.id, "fixed")
        .await
        .unwrap();
    let b_events = drain(&mut rx_b);
    assert!(matches!(&b_events[0], ServerEvent::MessageEdited { message } if message.text.as_deref() == Some("fixed")));
    // The editor gets the same event as its ack.
    assert!(matches!(&drain(&mut rx_a)[0], ServerEvent::MessageEdited { .. }));

    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list[0].last_message, "fixed");

    let deleted = delivery::delete_message(&state, "alice", &msg.id).await.unwrap();
    assert!(deleted.deleted);
    assert!(deleted.text.is_none());

    let b_events = drain(&mut rx_b);
    assert!(matches!(&b_events[0], ServerEvent::MessageDeleted { message } if message.deleted));

    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list[0].last_message, "Message deleted");
}

#[tokio::test]
async fn non_sender_edit_and_delete_are_rejected_without_fan_out() {
    let (_dir, state) = test_state().await;
    let (_a_conn, mut rx_a) = connect(&state, "alice");
    let (_b_conn, mut rx_b) = connect(&state, "bob");

    let msg = delivery::send_message(&state, "alice", text_input("alice", "bob", "mine"))
        .await
        .unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    assert!(delivery::edit_message(&state, "bob", &msg.id, "not yours").await.is_err());
    assert!(delivery::delete_message(&state, "bob", &msg.id).await.is_err());

    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());

    let history = state.store.fetch_conversation("alice", "bob", 100).await.unwrap();
    assert_eq!(history[0].text.as_deref(), Some("mine"));
}

#[tokio::test]
async fn rebind_evicts_exactly_the_prior_connection() {
    let (_dir, state) = test_state().await;
    let (first_id, mut rx_first) = connect(&state, "alice");
    let (second_id, _rx_second) = connect(&state, "alice");

    // The evicted connection is signalled with a close frame.
    let mut saw_close = false;
    while let Ok(frame) = rx_first.try_recv() {
        if matches!(frame, Outbound::Close) {
            saw_close = true;
        }
    }
    assert!(saw_close);

    // The registry resolves to the new connection only.
    assert_eq!(state.registry.lookup("alice").unwrap().id(), second_id);

    // The evicted connection's teardown must not unwind the new session.
    close_session(&state, "alice", first_id);
    assert!(state.registry.lookup("alice").is_some());
}

#[tokio::test]
async fn disconnect_cancels_typing_and_broadcasts_offline_once() {
    let (_dir, state) = test_state().await;
    let (a_id, _rx_a) = connect(&state, "alice");
    let (_b_id, mut rx_b) = connect(&state, "bob");
    let (_c_id, mut rx_c) = connect(&state, "carol");
    drain(&mut rx_b);
    drain(&mut rx_c);

    // Pause only once the database is up; sqlx connects under real time.
    tokio::time::pause();

    state.typing.keystroke("alice", "bob");
    state.typing.keystroke("bob", "alice");
    drain(&mut rx_b);

    close_session(&state, "alice", a_id);

    let b_events = drain(&mut rx_b);
    assert!(b_events
        .iter()
        .any(|e| matches!(e, ServerEvent::TypingStop { user_id } if user_id == "alice")));
    assert_eq!(
        b_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::PeerOffline { user_id } if user_id == "alice"))
            .count(),
        1
    );
    assert_eq!(
        drain(&mut rx_c)
            .iter()
            .filter(|e| matches!(e, ServerEvent::PeerOffline { user_id } if user_id == "alice"))
            .count(),
        1
    );

    // Bob's timer towards alice was swept; silence produces no stop later.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn explicit_typing_stop_inside_window_yields_exactly_one_stop() {
    let (_dir, state) = test_state().await;
    let (_a_id, _rx_a) = connect(&state, "alice");
    let (_b_id, mut rx_b) = connect(&state, "bob");
    drain(&mut rx_b);

    tokio::time::pause();

    state.typing.keystroke("alice", "bob");
    tokio::time::sleep(Duration::from_secs(1)).await;
    state.typing.stop("alice", "bob");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let events = drain(&mut rx_b);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::TypingStart { .. }))
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::TypingStop { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn summaries_survive_restart_through_store_rebuild() {
    let dir = TempDir::new().unwrap();

    {
        let state = AppState::new(ServerConfig::with_base_dir(dir.path()))
            .await
            .unwrap();
        delivery::send_message(&state, "alice", text_input("alice", "bob", "persisted"))
            .await
            .unwrap();
    }

    // Fresh process: the projection cache is cold and rebuilds lazily.
    let state = AppState::new(ServerConfig::with_base_dir(dir.path()))
        .await
        .unwrap();
    let b_list = state.conversations.list(&state.store, "bob").await.unwrap();
    assert_eq!(b_list.len(), 1);
    assert_eq!(b_list[0].last_message, "persisted");
    assert_eq!(b_list[0].unread_count, 1);
}
