mod support;

use std::sync::Arc;

use veilchat_client::error::ClientError;
use veilchat_client::session::{KeyState, PartnerBlock, SessionTask};
use veilchat_client::transport::ConnectionState;
use veilchat_crypto::protection_key::{MemoryKeyStore, ProtectionKeyStore};
use veilchat_shared::api::ws::{ClientEvent, ServerEvent};
use veilchat_shared::ids::UserId;

use support::{regenerated_partner_engine, Harness};

/// A user whose vault exists on disk but whose protection key is gone.
async fn orphaned_vault() -> Harness {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let key_store = Arc::new(MemoryKeyStore::new());
    let me = UserId::new();
    let peer = UserId::new();
    {
        let mut first = Harness::with_storage(me, peer, dir.clone(), key_store.clone()).await;
        first.init().await;
        assert!(first.vault.database_exists(&me));
    }
    key_store.delete(&me).unwrap();
    Harness::with_storage(me, peer, dir, key_store).await
}

#[tokio::test]
async fn new_user_is_provisioned_on_init() {
    let mut h = Harness::new().await;
    assert_eq!(h.session.key_state(), KeyState::Unknown);

    h.init().await;

    assert_eq!(h.session.key_state(), KeyState::Ready);
    assert!(!h.session.my_private_key_missing());
    assert!(h.vault.database_exists(&h.me));
    assert!(h.key_store.load(&h.me).unwrap().is_some());
    let uploads = h.history.with(|s| s.uploads.clone());
    assert_eq!(uploads.len(), 1);
    assert_eq!(h.history.published_key(h.me), Some(uploads[0].clone()));
    assert_eq!(*h.session.view().key_state.borrow(), KeyState::Ready);
}

#[tokio::test]
async fn returning_user_reuses_identity_and_heals_directory() {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let key_store = Arc::new(MemoryKeyStore::new());
    let me = UserId::new();
    let peer = UserId::new();

    let first_key = {
        let mut first = Harness::with_storage(me, peer, dir.clone(), key_store.clone()).await;
        first.init().await;
        first.history.published_key(me).unwrap()
    };

    // The new fake directory has no bundle for me, so the key is re-uploaded.
    let mut second = Harness::with_storage(me, peer, dir, key_store).await;
    second.init().await;

    assert_eq!(second.session.key_state(), KeyState::Ready);
    assert_eq!(second.history.with(|s| s.uploads.clone()), vec![first_key]);
}

#[tokio::test]
async fn lost_protection_key_blocks_without_generating() {
    let mut h = orphaned_vault().await;
    h.init().await;

    assert_eq!(h.session.key_state(), KeyState::BlockedByLocalCorruption);
    assert!(h.session.my_private_key_missing());
    assert!(h.history.with(|s| s.uploads.is_empty()));
    assert_eq!(h.history.with(|s| s.keys_missing_reports), 1);
    assert!(h.key_store.load(&h.me).unwrap().is_none());

    let err = h.session.send("anyone there?").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::KeysUnavailable(KeyState::BlockedByLocalCorruption)
    ));
    assert!(h.session.messages().is_empty());
}

#[tokio::test]
async fn regenerate_keys_recovers_from_corruption() {
    let mut h = orphaned_vault().await;
    h.init().await;
    assert!(h.session.my_private_key_missing());

    h.session.regenerate_keys().await.unwrap();

    assert_eq!(h.session.key_state(), KeyState::Ready);
    assert!(h.key_store.load(&h.me).unwrap().is_some());
    assert_eq!(h.history.with(|s| s.uploads.len()), 1);
    assert_eq!(
        h.server.drain(),
        vec![ClientEvent::NotifyKeyRegenerated { room_id: h.peer }]
    );

    h.session.send("back online").await.unwrap();
}

#[tokio::test]
async fn partner_regeneration_blocks_then_recovers() {
    let mut h = Harness::new().await;
    h.init().await;

    h.session
        .handle_event(ServerEvent::KeyRegenerated {
            from_user_id: h.peer,
            from_username: "partner".into(),
        })
        .await;
    assert_eq!(h.session.partner_public_key(), None);
    assert_eq!(
        h.session.key_state(),
        KeyState::BlockedByPartner(PartnerBlock::Regenerating { attempt: 1 })
    );
    assert!(matches!(
        h.session.send("blocked").await,
        Err(ClientError::KeysUnavailable(_))
    ));

    let renewed = regenerated_partner_engine();
    let renewed_key = renewed.export_current_public_key().unwrap();
    h.history.publish_key(h.peer, &renewed_key);

    let task = h.next_task().await;
    assert!(matches!(task, SessionTask::RetryPartnerKey { attempt: 1 }));
    h.session.handle_task(task).await;

    assert_eq!(h.session.key_state(), KeyState::Ready);
    assert_eq!(h.session.partner_public_key(), Some(renewed_key.as_str()));

    h.session.send("new key").await.unwrap();
    let ciphertext = h
        .server
        .drain()
        .into_iter()
        .find_map(|e| match e {
            ClientEvent::SendMessage { ciphertext, .. } => Some(ciphertext),
            _ => None,
        })
        .unwrap();
    assert_eq!(renewed.decrypt_message(&ciphertext).unwrap(), "new key");
    assert!(h.partner.decrypt_message(&ciphertext).is_err());
}

#[tokio::test]
async fn partner_key_retries_are_bounded() {
    let mut h = Harness::new().await;
    h.init().await;
    h.history.mark_missing(h.peer);

    h.session
        .handle_event(ServerEvent::KeyRegenerated {
            from_user_id: h.peer,
            from_username: "partner".into(),
        })
        .await;

    let mut attempts = Vec::new();
    while h.session.key_state()
        != KeyState::BlockedByPartner(PartnerBlock::RetryExhausted)
    {
        let task = h.next_task().await;
        if let SessionTask::RetryPartnerKey { attempt } = task {
            attempts.push(attempt);
        }
        h.session.handle_task(task).await;
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.session.partner_public_key(), None);
}

#[tokio::test]
async fn regeneration_notice_from_other_user_is_ignored() {
    let mut h = Harness::new().await;
    h.init().await;

    h.session
        .handle_event(ServerEvent::KeyRegenerated {
            from_user_id: UserId::new(),
            from_username: "someone".into(),
        })
        .await;
    assert_eq!(h.session.key_state(), KeyState::Ready);
}

#[tokio::test]
async fn partner_without_published_key_blocks_sending() {
    let mut h = Harness::new().await;
    h.history.with(|s| s.bundles.remove(&h.peer));

    h.init().await;

    assert_eq!(
        h.session.key_state(),
        KeyState::BlockedByPartner(PartnerBlock::NotPublished)
    );
    assert!(!h.session.my_private_key_missing());
}

#[tokio::test]
async fn partner_reported_missing_key_blocks_sending() {
    let mut h = Harness::new().await;
    h.history.mark_missing(h.peer);

    h.init().await;

    assert_eq!(
        h.session.key_state(),
        KeyState::BlockedByPartner(PartnerBlock::KeyMissing)
    );
}

#[tokio::test]
async fn reconnect_refreshes_partner_key_and_resyncs() {
    let mut h = Harness::new().await;
    h.init().await;

    h.server.set_state(ConnectionState::Disconnected);
    h.session
        .on_connection_change(ConnectionState::Disconnected)
        .await;

    let renewed_key = regenerated_partner_engine()
        .export_current_public_key()
        .unwrap();
    h.history.publish_key(h.peer, &renewed_key);

    h.server.set_state(ConnectionState::Connected);
    h.session
        .on_connection_change(ConnectionState::Connected)
        .await;
    assert_eq!(h.session.partner_public_key(), Some(renewed_key.as_str()));

    let task = h.next_task().await;
    assert!(matches!(task, SessionTask::ReconnectSync));
    h.session.handle_task(task).await;
    assert!(h.session.sync_in_progress());

    let fetched = h.next_task().await;
    assert!(matches!(fetched, SessionTask::SyncFetched { .. }));
    h.session.handle_task(fetched).await;
    assert!(!h.session.sync_in_progress());
}
