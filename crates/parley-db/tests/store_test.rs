use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, Utc};
use uuid::Uuid;

use parley_db::models::NewMessage;
use parley_db::{Database, StoreError};
use parley_types::identity::normalize;
use parley_types::models::Profile;

fn new_message(sender_id: Uuid, receiver_id: Uuid, content: &str) -> NewMessage {
    NewMessage {
        id: Uuid::new_v4(),
        sender_id,
        receiver_id,
        content: content.to_string(),
        at: Utc::now(),
    }
}

#[test]
fn get_or_create_returns_same_row_from_both_sides() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let (first, created) = db
        .get_or_create_conversation(normalize(a, b).unwrap(), Utc::now())
        .unwrap();
    assert!(created);

    let (second, created) = db
        .get_or_create_conversation(normalize(b, a).unwrap(), Utc::now())
        .unwrap();
    assert!(!created);
    assert_eq!(first, second);
    assert!(first.participant_low < first.participant_high);
}

#[test]
fn concurrent_get_or_create_across_connections_yields_one_row() {
    let path = std::env::temp_dir().join(format!("parley_store_test_{}.db", Uuid::new_v4()));
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    // Two handles on the same file behave like two server processes.
    let handles: Vec<Arc<Database>> = (0..2)
        .map(|_| Arc::new(Database::open(&path).unwrap()))
        .collect();
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let db = handles[i % 2].clone();
            let barrier = barrier.clone();
            let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
            thread::spawn(move || {
                barrier.wait();
                db.get_or_create_conversation(normalize(x, y).unwrap(), Utc::now())
                    .unwrap()
                    .0
                    .id
            })
        })
        .collect();

    let ids: Vec<Uuid> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(handles[0].conversations_for_user(a).unwrap().len(), 1);

    drop(handles);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
}

#[test]
fn append_orders_messages_submitted_at_the_same_instant() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (conversation, _) = db
        .get_or_create_conversation(normalize(a, b).unwrap(), Utc::now())
        .unwrap();

    let at = Utc::now();
    let mut submitted = Vec::new();
    for (i, (from, to)) in [(a, b), (b, a), (a, b), (b, a)].into_iter().enumerate() {
        let mut new = new_message(from, to, &format!("msg {}", i));
        new.at = at;
        submitted.push(db.append_message(conversation.id, &new).unwrap());
    }

    let stored = db.messages_for_conversation(conversation.id).unwrap();
    let stored_ids: Vec<Uuid> = stored.iter().map(|m| m.id).collect();
    let submitted_ids: Vec<Uuid> = submitted.iter().map(|m| m.id).collect();
    assert_eq!(stored_ids, submitted_ids);

    for pair in stored.windows(2) {
        assert!(pair[0].order_key() < pair[1].order_key());
    }
}

#[test]
fn append_trims_and_rejects_blank_content() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (conversation, _) = db
        .get_or_create_conversation(normalize(a, b).unwrap(), Utc::now())
        .unwrap();

    let stored = db
        .append_message(conversation.id, &new_message(a, b, "  hello \n"))
        .unwrap();
    assert_eq!(stored.content, "hello");
    assert!(!stored.is_read);

    let err = db
        .append_message(conversation.id, &new_message(a, b, "   "))
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn append_to_unknown_conversation_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    let err = db
        .append_message(Uuid::new_v4(), &new_message(Uuid::new_v4(), Uuid::new_v4(), "hi"))
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test]
fn append_rejects_outsiders() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (conversation, _) = db
        .get_or_create_conversation(normalize(a, b).unwrap(), Utc::now())
        .unwrap();

    let err = db
        .append_message(conversation.id, &new_message(a, Uuid::new_v4(), "hi"))
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn resubmitting_a_message_id_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let pair = normalize(a, b).unwrap();

    let new = new_message(a, b, "hi");
    let first = db.deliver(pair, &new).unwrap();
    let again = db.deliver(pair, &new).unwrap();
    assert_eq!(first.message, again.message);
    assert_eq!(db.messages_for_conversation(first.conversation.id).unwrap().len(), 1);

    let mut clash = new.clone();
    clash.content = "something else".into();
    let err = db.deliver(pair, &clash).unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[test]
fn failed_deliver_leaves_no_conversation_behind() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let pair = normalize(a, b).unwrap();

    let err = db.deliver(pair, &new_message(a, b, " \t ")).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    assert!(db.find_conversation(pair).unwrap().is_none());
}

#[test]
fn deliver_bumps_activity_to_message_time() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let pair = normalize(a, b).unwrap();

    let delivery = db.deliver(pair, &new_message(a, b, "hi")).unwrap();
    assert!(delivery.created_conversation);
    assert_eq!(delivery.conversation.last_activity_at, delivery.message.created_at);
    assert_eq!(delivery.message.receiver_id, b);
}

#[test]
fn touch_never_moves_activity_backwards() {
    let db = Database::open_in_memory().unwrap();
    let now = Utc::now();
    let (conversation, _) = db
        .get_or_create_conversation(normalize(Uuid::new_v4(), Uuid::new_v4()).unwrap(), now)
        .unwrap();

    let earlier = db
        .touch_conversation(conversation.id, now - Duration::hours(1))
        .unwrap();
    assert_eq!(earlier.last_activity_at, conversation.last_activity_at);

    let later = db
        .touch_conversation(conversation.id, now + Duration::hours(1))
        .unwrap();
    assert!(later.last_activity_at > conversation.last_activity_at);

    assert!(matches!(
        db.touch_conversation(Uuid::new_v4(), now).unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[test]
fn conversations_are_listed_most_recent_first() {
    let db = Database::open_in_memory().unwrap();
    let me = Uuid::new_v4();
    let old_friend = Uuid::new_v4();
    let new_friend = Uuid::new_v4();
    let now = Utc::now();

    let mut old = new_message(old_friend, me, "long ago");
    old.at = now - Duration::days(2);
    db.deliver(normalize(me, old_friend).unwrap(), &old).unwrap();

    let mut recent = new_message(me, new_friend, "just now");
    recent.at = now;
    db.deliver(normalize(me, new_friend).unwrap(), &recent).unwrap();

    let listed = db.conversations_for_user(me).unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].has_participant(new_friend));
    assert!(listed[1].has_participant(old_friend));

    // Restartable: a second call yields the same sequence.
    assert_eq!(listed, db.conversations_for_user(me).unwrap());
    assert_eq!(db.conversations_for_user(old_friend).unwrap().len(), 1);
}

#[test]
fn mark_read_only_touches_messages_addressed_to_reader() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let pair = normalize(a, b).unwrap();

    let to_b = db.deliver(pair, &new_message(a, b, "for b")).unwrap();
    db.deliver(pair, &new_message(b, a, "for a")).unwrap();
    let cid = to_b.conversation.id;

    assert_eq!(db.mark_read(cid, b).unwrap(), 1);
    assert_eq!(db.mark_read(cid, b).unwrap(), 0);

    for message in db.messages_for_conversation(cid).unwrap() {
        assert_eq!(message.is_read, message.receiver_id == b);
    }

    assert!(matches!(
        db.mark_read(Uuid::new_v4(), b).unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[test]
fn digests_carry_last_message_and_unread_count() {
    let db = Database::open_in_memory().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let pair = normalize(a, b).unwrap();

    db.deliver(pair, &new_message(a, b, "one")).unwrap();
    let last = db.deliver(pair, &new_message(a, b, "two")).unwrap();

    let for_b = db.digests_for_user(b).unwrap();
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_b[0].unread_count, 2);
    assert_eq!(for_b[0].last_message.as_ref().unwrap().content, "two");

    let for_a = db.digest_for(last.conversation.id, a).unwrap().unwrap();
    assert_eq!(for_a.unread_count, 0);

    let (empty, _) = db
        .get_or_create_conversation(normalize(a, Uuid::new_v4()).unwrap(), Utc::now())
        .unwrap();
    let digest = db.digest_for(empty.id, a).unwrap().unwrap();
    assert!(digest.last_message.is_none());

    assert!(db.digest_for(empty.id, b).unwrap().is_none());
}

#[test]
fn profiles_upsert_and_read_back() {
    let db = Database::open_in_memory().unwrap();
    let user = Uuid::new_v4();
    assert!(db.get_profile(user).unwrap().is_none());

    let mut profile = Profile {
        display_name: "Ada".into(),
        avatar_url: None,
    };
    db.upsert_profile(user, &profile).unwrap();
    profile.avatar_url = Some("https://example.invalid/ada.png".into());
    db.upsert_profile(user, &profile).unwrap();

    assert_eq!(db.get_profile(user).unwrap(), Some(profile));
}
