mod support;

use std::time::Duration;

use veilchat_client::error::ClientError;
use veilchat_client::session::{spawn_session, KeyState};
use veilchat_client::transport::ConnectionState;
use veilchat_shared::api::message::UnreadOverview;
use veilchat_shared::api::ws::{ClientEvent, ServerEvent};
use veilchat_shared::ids::{MessageId, UserId};

use support::{now_millis, Harness};

#[tokio::test]
async fn handle_drives_session_over_transport() {
    let h = Harness::new().await;
    let Harness {
        session,
        tasks,
        events,
        mut server,
        peer,
        partner,
        history,
        ..
    } = h;
    let (handle, join) = spawn_session(session, tasks, events);

    handle.init(peer).await.unwrap();
    assert_eq!(*handle.view().key_state.borrow(), KeyState::Ready);
    server.drain();

    handle.send("over the wire").await.unwrap();
    let ciphertext = match server.next().await {
        Some(ClientEvent::SendMessage { ciphertext, .. }) => ciphertext,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(partner.decrypt_message(&ciphertext).unwrap(), "over the wire");

    let id = MessageId::new();
    assert!(server.push(ServerEvent::MessageSent {
        message_id: id,
        timestamp: now_millis(),
    }));
    let mut messages = handle.view().messages.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        messages.wait_for(|list| list.iter().any(|m| m.id == Some(id))),
    )
    .await
    .expect("ack applied")
    .unwrap();

    let other = UserId::new();
    history.with(|s| {
        s.unread = vec![UnreadOverview {
            peer_id: other,
            unread_count: 4,
        }]
    });
    let overview = handle.unread_overview().await.unwrap();
    assert_eq!(overview.len(), 1);
    assert_eq!(handle.view().unread.borrow().get(&other), Some(&4));

    assert!(!handle.sync().await.unwrap());

    handle.shutdown().await;
    join.await.unwrap();
    assert!(matches!(
        handle.send("after shutdown").await,
        Err(ClientError::SessionClosed)
    ));
}

#[tokio::test]
async fn connection_changes_reach_the_session() {
    let h = Harness::new().await;
    let Harness {
        session,
        tasks,
        events,
        server,
        peer,
        ..
    } = h;
    let (handle, join) = spawn_session(session, tasks, events);
    handle.init(peer).await.unwrap();

    server.set_state(ConnectionState::Disconnected);
    assert!(matches!(
        handle.send("queued?").await,
        Err(ClientError::Disconnected)
    ));
    assert_eq!(*handle.view().connection.borrow(), ConnectionState::Disconnected);

    server.set_state(ConnectionState::Connected);
    handle.send("flows again").await.unwrap();

    handle.shutdown().await;
    join.await.unwrap();
}
