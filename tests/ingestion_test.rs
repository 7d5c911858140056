mod common;

use common::{bridge, next_event, text_message, with_push_name};
use switchboard::manager::OutgoingContent;
use switchboard::protocol::{
    MediaKind, MediaRef, ProtocolEvent, WireBody, WireMessage, chat_id_for_phone,
};
use switchboard::store::traits::{ContactStore, ConversationStore, MessageStore};
use switchboard::types::contact::ConversationStatus;
use switchboard::types::events::BridgeEvent;
use switchboard::types::message::{MessageKind, MessageStatus};
use chrono::Utc;
use std::sync::Arc;

async fn connected_bridge() -> (common::TestBridge, String, Arc<common::FakeClient>) {
    let b = bridge().await;
    let session = b.manager.create_session("Inbox").await.unwrap();
    b.factory
        .enqueue_script(vec![ProtocolEvent::Opened { phone: None }]);
    b.manager.connect(&session.id).await.unwrap();
    let client = b.factory.client(0);
    let id = session.id;
    (b, id, client)
}

fn media_message(external_id: &str, phone: &str, caption: Option<&str>) -> WireMessage {
    WireMessage {
        external_id: external_id.to_string(),
        chat_id: chat_id_for_phone(phone),
        from_me: false,
        push_name: None,
        timestamp: Utc::now(),
        body: WireBody::Media(MediaRef {
            kind: MediaKind::Image,
            direct_path: format!("/blob/{external_id}"),
            file_length: None,
            caption: caption.map(str::to_string),
        }),
    }
}

async fn next_new_message(
    sub: &mut switchboard::types::events::Subscription,
) -> Arc<switchboard::types::events::NewMessageEvent> {
    loop {
        if let BridgeEvent::NewMessage(ev) = next_event(sub).await {
            return ev;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn inbound_text_creates_contact_conversation_and_message() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    client
        .push(ProtocolEvent::MessageBatch(vec![text_message(
            "WIRE-1",
            "5511999998888",
            "Hi",
            false,
        )]))
        .await;

    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.contact.phone, "5511999998888");
    assert_eq!(ev.message.content.as_deref(), Some("Hi"));
    assert!(!ev.message.from_me);
    assert_eq!(ev.message.status, MessageStatus::Delivered);
    assert_eq!(ev.message.external_id.as_deref(), Some("WIRE-1"));

    let conversation = b
        .store
        .get_conversation(&ev.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Open);
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(conversation.last_message.as_deref(), Some("Hi"));
}

#[tokio::test(start_paused = true)]
async fn a_message_delivered_twice_is_persisted_once() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    let message = text_message("WIRE-1", "5511999998888", "Hi", false);
    client
        .push(ProtocolEvent::MessageBatch(vec![message.clone()]))
        .await;
    client
        .push(ProtocolEvent::MessageBatch(vec![message]))
        .await;
    client
        .push(ProtocolEvent::MessageBatch(vec![text_message(
            "WIRE-2",
            "5511999998888",
            "Again",
            false,
        )]))
        .await;

    let first = next_new_message(&mut sub).await;
    let second = next_new_message(&mut sub).await;
    assert_eq!(first.message.external_id.as_deref(), Some("WIRE-1"));
    // The duplicate produced no event; the next one is the second id.
    assert_eq!(second.message.external_id.as_deref(), Some("WIRE-2"));

    let conversation = b
        .store
        .get_conversation(&second.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.unread_count, 2);
}

#[tokio::test(start_paused = true)]
async fn push_names_never_come_from_our_own_messages() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    // Inbound: the asserted name fills the empty contact.
    client
        .push(ProtocolEvent::MessageBatch(vec![with_push_name(
            text_message("WIRE-1", "111", "hello", false),
            "Alice",
        )]))
        .await;
    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.contact.name.as_deref(), Some("Alice"));

    // Outbound: the push name refers to the local account, never the peer.
    client
        .push(ProtocolEvent::MessageBatch(vec![with_push_name(
            text_message("WIRE-2", "222", "hey there", true),
            "My Own Name",
        )]))
        .await;
    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.contact.phone, "222");
    assert_eq!(ev.contact.name, None);

    // A second inbound name does not replace an existing one.
    client
        .push(ProtocolEvent::MessageBatch(vec![with_push_name(
            text_message("WIRE-3", "111", "again", false),
            "Not Alice",
        )]))
        .await;
    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.contact.name.as_deref(), Some("Alice"));
}

#[tokio::test(start_paused = true)]
async fn media_download_failure_still_persists_the_message() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    // No bytes registered for the direct path: the download fails.
    client
        .push(ProtocolEvent::MessageBatch(vec![media_message(
            "WIRE-1",
            "333",
            Some("look at this"),
        )]))
        .await;

    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.message.kind, MessageKind::Image);
    assert_eq!(ev.message.media_url, None);
    assert_eq!(ev.message.content.as_deref(), Some("look at this"));
}

#[tokio::test(start_paused = true)]
async fn downloaded_media_is_stored_under_its_kind() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    client.add_media("/blob/WIRE-7", b"jpeg-bytes");
    client
        .push(ProtocolEvent::MessageBatch(vec![media_message(
            "WIRE-7", "333", None,
        )]))
        .await;

    let ev = next_new_message(&mut sub).await;
    assert_eq!(ev.message.media_url.as_deref(), Some("/media/images/WIRE-7.jpg"));
    // No caption: the preview falls back to the kind label.
    assert_eq!(ev.message.content, None);
    let conversation = b
        .store
        .get_conversation(&ev.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.last_message.as_deref(), Some("[image]"));

    let on_disk = b
        .dir
        .as_ref()
        .unwrap()
        .path()
        .join("media/images/WIRE-7.jpg");
    assert_eq!(std::fs::read(on_disk).unwrap(), b"jpeg-bytes");
}

#[tokio::test(start_paused = true)]
async fn status_updates_match_by_external_id_and_apply_once() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    let first = b
        .manager
        .send_message(
            &session_id,
            "5511999998888@s.whatsapp.net",
            OutgoingContent {
                text: Some("ping".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let second = b
        .manager
        .send_message(
            &session_id,
            "5511999998888@s.whatsapp.net",
            OutgoingContent {
                text: Some("pong".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // READ for the first message.
    client
        .push(ProtocolEvent::StatusUpdate {
            external_id: first.external_id.clone(),
            code: 4,
        })
        .await;
    // Identical repeat: a no-op. Unknown id: silently dropped.
    client
        .push(ProtocolEvent::StatusUpdate {
            external_id: first.external_id.clone(),
            code: 4,
        })
        .await;
    client
        .push(ProtocolEvent::StatusUpdate {
            external_id: "WIRE-UNKNOWN".into(),
            code: 4,
        })
        .await;
    client
        .push(ProtocolEvent::StatusUpdate {
            external_id: second.external_id.clone(),
            code: 3,
        })
        .await;

    let updates: Vec<_> = {
        let mut out = Vec::new();
        while out.len() < 2 {
            if let BridgeEvent::MessageStatus(ev) = next_event(&mut sub).await {
                out.push(ev);
            }
        }
        out
    };
    assert_eq!(updates[0].message_id, first.message_id);
    assert_eq!(updates[0].status, MessageStatus::Read);
    assert_eq!(updates[1].message_id, second.message_id);
    assert_eq!(updates[1].status, MessageStatus::Delivered);

    let stored = b
        .store
        .find_by_external_id(&session_id, &first.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn read_receipts_mark_messages_and_reset_the_counter() {
    let (b, session_id, client) = connected_bridge().await;
    let mut sub = b.manager.bus().subscribe(Some(&session_id));

    client
        .push(ProtocolEvent::MessageBatch(vec![
            text_message("WIRE-1", "5511999998888", "one", false),
            text_message("WIRE-2", "5511999998888", "two", false),
        ]))
        .await;
    let ev = next_new_message(&mut sub).await;
    let conversation_id = ev.conversation_id.clone();
    next_new_message(&mut sub).await;

    let before = b
        .store
        .get_conversation(&conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.unread_count, 2);

    b.manager
        .send_read_receipt(&session_id, &conversation_id)
        .await
        .unwrap();

    let marks = client.read_marks.lock().unwrap().clone();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].0, chat_id_for_phone("5511999998888"));
    assert_eq!(marks[0].1.len(), 2);

    let after = b
        .store
        .get_conversation(&conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.unread_count, 0);
    for wire_id in ["WIRE-1", "WIRE-2"] {
        let stored = b
            .store
            .find_by_external_id(&session_id, wire_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    // Nothing left unread: a second receipt is a no-op on the wire.
    b.manager
        .send_read_receipt(&session_id, &conversation_id)
        .await
        .unwrap();
    assert_eq!(client.read_marks.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_sends_are_recorded_without_an_external_id() {
    let (b, session_id, client) = connected_bridge().await;
    client
        .fail_sends
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = b
        .manager
        .send_message(
            &session_id,
            "5511999998888@s.whatsapp.net",
            OutgoingContent {
                text: Some("lost".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());

    let contact = b
        .store
        .find_or_create_by_phone("5511999998888", None)
        .await
        .unwrap();
    assert!(
        b.store
            .find_active_conversation(&session_id, &contact.id)
            .await
            .unwrap()
            .is_some()
    );
    // Exactly one row exists for the session: the Failed outbound record.
    assert_eq!(
        b.store
            .delete_messages_by_session(&session_id)
            .await
            .unwrap(),
        1
    );
}
