//! Store-level scenarios: redundant relay delivery, two local identities, and
//! restarts against SQLite.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nostr::{EventBuilder, Keys, Kind, Timestamp};
use pika_event_store::{
    build_direct_message, Admitted, ChatContent, ChatCore, Classification, Delivery, EventStore,
    Incoming, LamportClock, StoreEvent,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(5);

fn write_config(data_dir: &Path, provenance: &str) {
    let v = serde_json::json!({
        "provenance": provenance,
        "bloom_bits": 8192,
        "bloom_hashes": 5,
    });
    std::fs::write(
        data_dir.join("pika_store_config.json"),
        serde_json::to_vec(&v).unwrap(),
    )
    .unwrap();
}

async fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{what}: condition not met within {WAIT:?}");
}

#[tokio::test]
async fn same_message_from_three_deliveries() {
    let alice = Keys::generate();
    let bob = Keys::generate();
    let store = EventStore::in_memory();
    let tap = store.subscribe();

    let m1 = build_direct_message(&alice, &bob.public_key(), "hi", false, &LamportClock::new())
        .unwrap();
    assert!(matches!(
        store.admit(m1.clone(), None).await,
        Ok(Admitted::New(_))
    ));
    assert!(matches!(
        store.admit(m1.clone(), Some("relay1")).await,
        Ok(Admitted::Duplicate {
            relay_recorded: true
        })
    ));
    assert!(matches!(
        store.admit(m1.clone(), Some("relay2")).await,
        Ok(Admitted::Duplicate {
            relay_recorded: true
        })
    ));
    assert!(matches!(
        store.admit(m1.clone(), Some("relay2")).await,
        Ok(Admitted::Duplicate {
            relay_recorded: false
        })
    ));

    assert_eq!(store.enumerate().count(), 1);
    assert_eq!(
        store.relay_records(&m1.id),
        BTreeSet::from(["relay1".to_string(), "relay2".to_string()])
    );

    let mut added = 0;
    let mut confirmed = Vec::new();
    while let Some(event) = tap.recv_timeout(Duration::from_millis(300)) {
        assert_eq!(event.message().id(), m1.id);
        match event {
            StoreEvent::Added { relay, .. } => {
                assert_eq!(relay, None);
                added += 1;
            }
            StoreEvent::RelayConfirmed { relay, .. } => confirmed.push(relay),
        }
    }
    assert_eq!(added, 1);
    assert_eq!(confirmed, vec!["relay1".to_string(), "relay2".to_string()]);
}

#[tokio::test]
async fn both_identities_see_the_same_conversation() {
    let alice = Keys::generate();
    let bob = Keys::generate();
    let alice_core = ChatCore::start(
        Arc::new(EventStore::in_memory()),
        alice.public_key(),
        Arc::new(pika_event_store::Nip04Decryptor::new(alice.clone())),
        Arc::new(pika_event_store::MemoryDb::new()),
    );
    let bob_core = ChatCore::start(
        Arc::new(EventStore::in_memory()),
        bob.public_key(),
        Arc::new(pika_event_store::Nip04Decryptor::new(bob.clone())),
        Arc::new(pika_event_store::MemoryDb::new()),
    );

    let clock = LamportClock::new();
    let hello = build_direct_message(&alice, &bob.public_key(), "hello", false, &clock).unwrap();
    let reply = build_direct_message(&bob, &alice.public_key(), "hey", false, &clock).unwrap();
    for core in [&alice_core, &bob_core] {
        core.admit(hello.clone(), Some("wss://relay.one")).await.unwrap();
        core.admit(reply.clone(), Some("wss://relay.two")).await.unwrap();
    }

    wait_until("alice indexed both", || {
        alice_core.messages_with(&bob.public_key()).len() == 2
    })
    .await;
    wait_until("bob indexed both", || {
        bob_core.messages_with(&alice.public_key()).len() == 2
    })
    .await;

    let from_alice = alice_core.get_conversation(&bob.public_key()).unwrap();
    let from_bob = bob_core.get_conversation(&alice.public_key()).unwrap();
    assert_eq!(from_alice.classification(), Classification::Contacts);
    assert_eq!(from_bob.classification(), Classification::Contacts);
    assert_eq!(from_alice.newest_sent.as_ref().unwrap().id(), hello.id);
    assert_eq!(from_bob.newest_sent.as_ref().unwrap().id(), reply.id);
    assert_eq!(from_alice.unread, 1);
    assert_eq!(from_bob.unread, 1);
    assert_eq!(from_alice.relays.len(), 2);

    let contents: Vec<ChatContent> = bob_core
        .messages_with(&alice.public_key())
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(
        contents,
        vec![
            ChatContent::Text("hello".into()),
            ChatContent::Text("hey".into())
        ]
    );
}

#[tokio::test]
async fn state_survives_restart_with_bloom_provenance() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "bloom");
    let me = Keys::generate();
    let carol = Keys::generate();
    let clock = LamportClock::new();
    let kept = build_direct_message(&carol, &me.public_key(), "kept", false, &clock).unwrap();
    let dropped = build_direct_message(&carol, &me.public_key(), "dropped", false, &clock).unwrap();
    let profile = EventBuilder::new(Kind::Metadata, r#"{"name":"carol"}"#)
        .custom_created_at(Timestamp::from_secs(1_700_000_000))
        .sign_with_keys(&carol)
        .unwrap();

    {
        let core = ChatCore::open(dir.path(), me.clone()).unwrap();
        core.ready().await;
        core.admit(kept.clone(), Some("wss://relay.kept")).await.unwrap();
        core.admit(dropped.clone(), None).await.unwrap();
        core.admit(profile, None).await.unwrap();
        core.remove(&dropped.id);
        wait_until("live messages indexed", || {
            core.messages_with(&carol.public_key()).len() == 2
        })
        .await;
    }

    let core = ChatCore::open(dir.path(), me.clone()).unwrap();
    core.ready().await;

    assert!(core.get(&dropped.id).is_none());
    assert!(core.relay_records(&kept.id).contains("wss://relay.kept"));
    assert_eq!(
        core.get_profile_by_public_key(&carol.public_key())
            .and_then(|p| p.name().map(str::to_string)),
        Some("carol".to_string())
    );

    let history = core.messages_with(&carol.public_key());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, kept.id);
    let summary = core.get_conversation(&carol.public_key()).unwrap();
    assert_eq!(summary.unread, 0);
    assert!(summary.relays.contains("wss://relay.kept"));

    assert!(core.store().lamport().current() >= 1);
    assert!(matches!(
        core.admit(dropped, Some("wss://relay.late")).await,
        Err(pika_event_store::Error::AlreadyRemoved(_))
    ));
}

#[tokio::test]
async fn block_list_persists_in_sqlite() {
    let dir = tempdir().unwrap();
    let me = Keys::generate();
    let spam = Keys::generate();
    let ev = build_direct_message(&spam, &me.public_key(), "spam", false, &LamportClock::new())
        .unwrap();
    {
        let core = ChatCore::open(dir.path(), me.clone()).unwrap();
        core.admit(ev, None).await.unwrap();
        core.block(&spam.public_key()).unwrap();
    }

    let core = ChatCore::open(dir.path(), me.clone()).unwrap();
    core.ready().await;
    assert!(core.get_conversation_list().is_empty());
    assert_eq!(core.get_blocked().count(), 1);

    core.unblock(&spam.public_key()).unwrap();
    assert_eq!(core.get_strangers().count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_relays_share_one_funnel() {
    let me = Keys::generate();
    let core = Arc::new(ChatCore::start(
        Arc::new(EventStore::in_memory()),
        me.public_key(),
        Arc::new(pika_event_store::Nip04Decryptor::new(me.clone())),
        Arc::new(pika_event_store::MemoryDb::new()),
    ));
    let senders: Vec<Keys> = (0..5).map(|_| Keys::generate()).collect();
    let clock = LamportClock::new();
    let events: Vec<_> = senders
        .iter()
        .map(|k| build_direct_message(k, &me.public_key(), "hi", false, &clock).unwrap())
        .collect();

    let (tx, rx) = flume::bounded::<Delivery>(4);
    let relays: Vec<_> = (0..3)
        .map(|n| {
            let tx = tx.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let url = format!("wss://relay{n}");
                for ev in events {
                    tx.send_async((Incoming::from(ev), Some(url.clone())))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let stats = core.ingest(rx).await;
    for r in relays {
        r.await.unwrap();
    }
    assert_eq!(stats.new, 5);
    assert_eq!(stats.duplicates, 10);
    assert_eq!(core.enumerate().count(), 5);

    wait_until("all conversations indexed", || {
        core.get_strangers().count() == 5
    })
    .await;
    for ev in &events {
        assert_eq!(core.relay_records(&ev.id).len(), 3);
    }
}
