use super::*;
use crate::test_support::TestHub;
use crate::{ChatBackend, SessionState};
use chrono::Utc;
use shared::domain::MessageId;

const ALICE: UserId = UserId(1);

fn controller(hub: &std::sync::Arc<TestHub>) -> ChatListController {
    let actor = hub.actor(ALICE);
    ChatListController::new(ALICE, actor.clone(), actor)
}

fn inbound(room_id: RoomId, id: i64, sender: UserId, body: &str) -> ServerEvent {
    ServerEvent::MessageReceived {
        message: MessagePayload {
            message_id: MessageId(id),
            room_id,
            sender_id: sender,
            receiver_id: ALICE,
            body: body.to_string(),
            sent_at: Utc::now(),
            read_at: None,
        },
    }
}

#[tokio::test]
async fn open_chat_creates_a_joined_session() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);

    let room_id = controller.open_chat(UserId(2)).await.expect("open");
    assert_eq!(room_id, RoomId::direct(ALICE, UserId(2)));

    let session = controller.session(&room_id).expect("session");
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(controller.open_rooms(), vec![room_id]);
}

#[tokio::test]
async fn reopening_brings_to_front_and_unminimizes() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);

    let first = controller.open_chat(UserId(2)).await.expect("open");
    let second = controller.open_chat(UserId(3)).await.expect("open");
    controller.toggle_minimize(&first);
    assert!(controller.session(&first).expect("session").minimized());

    let reopened = controller.open_chat(UserId(2)).await.expect("reopen");
    assert_eq!(reopened, first);
    assert!(!controller.session(&first).expect("session").minimized());
    assert_eq!(controller.open_rooms(), vec![second, first.clone()]);

    // still one session for the room, not a second join
    let joins = hub
        .joined
        .lock()
        .expect("lock")
        .iter()
        .filter(|r| **r == first)
        .count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn opening_past_capacity_evicts_least_recently_activated() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);

    let r1 = controller.open_chat(UserId(2)).await.expect("open");
    let r2 = controller.open_chat(UserId(3)).await.expect("open");
    let r3 = controller.open_chat(UserId(4)).await.expect("open");
    assert_eq!(controller.open_rooms(), vec![r1.clone(), r2.clone(), r3.clone()]);

    let r4 = controller.open_chat(UserId(5)).await.expect("open");

    assert_eq!(controller.open_rooms(), vec![r2, r3, r4]);
    assert!(controller.session(&r1).is_none());
    assert!(hub.left.lock().expect("lock").contains(&r1));
}

#[tokio::test]
async fn activation_protects_a_session_from_eviction() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);

    let r1 = controller.open_chat(UserId(2)).await.expect("open");
    let r2 = controller.open_chat(UserId(3)).await.expect("open");
    let r3 = controller.open_chat(UserId(4)).await.expect("open");

    // touching r1 makes r2 the least recently activated
    controller.open_chat(UserId(2)).await.expect("reactivate");
    let r4 = controller.open_chat(UserId(5)).await.expect("open");

    assert_eq!(controller.open_rooms(), vec![r3, r1, r4]);
    assert!(controller.session(&r2).is_none());
}

#[tokio::test]
async fn inbound_push_for_closed_room_updates_unread_and_preview() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);
    let room_id = RoomId::direct(ALICE, UserId(7));

    controller.apply_event(&inbound(room_id.clone(), 1, UserId(7), "anyone there?"));
    controller.apply_event(&inbound(room_id.clone(), 2, UserId(7), "hello?"));

    let activity = controller.activity(&room_id).expect("activity");
    assert_eq!(activity.unread_count, 2);
    assert_eq!(
        activity.last_message.as_ref().expect("preview").body,
        "hello?"
    );
}

#[tokio::test]
async fn inbound_push_for_open_room_reaches_session_without_unread() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);
    let room_id = controller.open_chat(UserId(2)).await.expect("open");

    controller.apply_event(&inbound(room_id.clone(), 5, UserId(2), "live push"));

    let session = controller.session(&room_id).expect("session");
    assert_eq!(session.messages().len(), 1);
    let activity = controller.activity(&room_id).expect("activity");
    assert_eq!(activity.unread_count, 0);
    assert_eq!(
        activity.last_message.as_ref().expect("preview").body,
        "live push"
    );
}

#[tokio::test]
async fn opening_a_room_marks_it_read() {
    let hub = TestHub::new();
    let bob = hub.actor(UserId(2));
    bob.append_message(ALICE, "waiting one").await.expect("seed");
    bob.append_message(ALICE, "waiting two").await.expect("seed");

    let mut controller = controller(&hub);
    controller.refresh_rooms().await.expect("refresh");
    let room_id = RoomId::direct(ALICE, UserId(2));
    assert_eq!(controller.activity(&room_id).expect("activity").unread_count, 2);

    controller.open_chat(UserId(2)).await.expect("open");
    assert_eq!(controller.activity(&room_id).expect("activity").unread_count, 0);

    // the store agrees: nothing unread remains for alice
    let alice = hub.actor(ALICE);
    let rooms = alice.list_rooms().await.expect("rooms");
    assert_eq!(rooms[0].unread_count, 0);
}

#[tokio::test]
async fn pump_event_feeds_background_state() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);
    let room_id = RoomId::direct(ALICE, UserId(9));

    hub.push(inbound(room_id.clone(), 11, UserId(9), "over the wire"));
    let event = controller.pump_event().await.expect("event");
    assert!(matches!(event, ServerEvent::MessageReceived { .. }));

    assert_eq!(controller.activity(&room_id).expect("activity").unread_count, 1);
}

#[tokio::test]
async fn close_chat_tears_down_only_that_session() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);

    let r1 = controller.open_chat(UserId(2)).await.expect("open");
    let r2 = controller.open_chat(UserId(3)).await.expect("open");

    controller.close_chat(&r1).await;
    assert!(controller.session(&r1).is_none());
    assert!(controller.session(&r2).is_some());
    assert_eq!(controller.open_rooms(), vec![r2]);

    // pushes for the closed room go back to counting unread
    controller.apply_event(&inbound(r1.clone(), 21, UserId(2), "while closed"));
    assert_eq!(controller.activity(&r1).expect("activity").unread_count, 1);
}

#[tokio::test]
async fn room_cleared_push_drops_preview_and_empties_open_session() {
    let hub = TestHub::new();
    let mut controller = controller(&hub);
    let room_id = controller.open_chat(UserId(2)).await.expect("open");

    controller.apply_event(&inbound(room_id.clone(), 31, UserId(2), "soon gone"));
    controller.apply_event(&ServerEvent::RoomCleared {
        room_id: room_id.clone(),
    });

    assert!(controller.activity(&room_id).is_none());
    assert!(controller
        .session(&room_id)
        .expect("session")
        .messages()
        .is_empty());
}
