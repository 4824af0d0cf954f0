//! Transaction Atomicity Tests
//!
//! Tests the invariants around transactions:
//! - A commit publishes all of its events or none of them
//! - A failed store write leaves the stream untouched and the transaction
//!   rolled back
//! - Terminal results are memoized: repeated commit()/rollback() return the
//!   same answer and never re-execute

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use canonlog::{
    Channel, ChannelOptions, CodecResolver, Error, EventMessage, JsonCodec, MemoryStoreFactory,
    RawCodec, StoreFactory, TransactionState,
};

use common::FailingStoreFactory;

fn failing_channel() -> (Arc<FailingStoreFactory>, Channel) {
    let factory = Arc::new(FailingStoreFactory::new());
    let channel = Channel::open(
        "atomicity",
        Arc::clone(&factory) as Arc<dyn StoreFactory>,
        ChannelOptions::default(),
    )
    .unwrap();
    (factory, channel)
}

#[test]
fn failed_persist_publishes_nothing() {
    let (factory, channel) = failing_channel();
    let stream = channel.get_or_create_stream("orders").unwrap();
    common::commit(&stream, &["Created"]);

    factory.fail_persists(true);
    let mut appender = stream.appender();
    appender.create("Paid").add().unwrap();
    appender.create("Shipped").add().unwrap();
    let tx = appender.transaction().unwrap().clone();

    let err = appender.commit().wait().unwrap_err();
    assert!(matches!(err, Error::StreamAppend { .. }));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(common::event_types(&stream), vec!["Created"]);

    // Once the store recovers, a new transaction links straight to the old tail
    factory.fail_persists(false);
    let next = common::commit(&stream, &["Paid"]);
    assert_eq!(next[0].previous, Some(stream.events()[0].sequence.clone()));
    assert_eq!(stream.len(), 2);
}

#[test]
fn failed_persist_leaves_no_gap_in_sequences() {
    let (factory, channel) = failing_channel();
    let stream = channel.get_or_create_stream("orders").unwrap();
    common::commit(&stream, &["A"]);

    factory.fail_persists(true);
    let mut appender = stream.appender();
    appender.create("B").add().unwrap();
    assert!(appender.commit().wait().is_err());
    factory.fail_persists(false);

    common::commit(&stream, &["C"]);
    let sequences: Vec<String> = stream
        .events()
        .iter()
        .map(|e| e.sequence.to_string())
        .collect();
    assert_eq!(sequences, vec!["1", "2"]);
}

#[test]
fn failed_stream_creation_is_never_visible() {
    let (factory, channel) = failing_channel();
    factory.fail_persists(true);
    factory.delay_persists(Duration::from_millis(50));

    let creator = {
        let channel = channel.clone();
        thread::spawn(move || channel.create_stream("orders"))
    };
    while !creator.is_finished() {
        assert!(channel.find_stream("orders").is_none());
        thread::sleep(Duration::from_millis(1));
    }
    assert!(creator.join().unwrap().is_err());
    assert!(channel.stream_names().is_empty());

    // The name is free again once the store recovers
    factory.fail_persists(false);
    factory.delay_persists(Duration::ZERO);
    let stream = channel.get_or_create_stream("orders").unwrap();
    common::commit(&stream, &["Created"]);
    drop(stream);
    channel.close();

    let reopened = Channel::open(
        "atomicity",
        Arc::clone(&factory) as Arc<dyn StoreFactory>,
        ChannelOptions::default(),
    )
    .unwrap();
    assert_eq!(reopened.stream("orders").unwrap().len(), 1);
}

#[test]
fn repeated_commit_returns_memoized_result() {
    let channel = Channel::in_memory("atomicity").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let mut appender = stream.appender();
    appender.create("Created").add().unwrap();
    let tx = appender.transaction().unwrap().clone();

    let first = tx.commit().wait().unwrap();
    let second = tx.commit().wait().unwrap();
    assert_eq!(first, second);
    assert_eq!(stream.len(), 1);
    assert_eq!(tx.state(), TransactionState::Committed);

    // The committed transaction accepts no more events and cannot roll back
    let late = EventMessage::builder("Late").build().unwrap();
    assert!(matches!(tx.add(late), Err(Error::StreamAppend { .. })));
    assert!(matches!(tx.rollback().wait(), Err(Error::EventTransaction { .. })));
}

#[test]
fn repeated_failed_commit_returns_same_error() {
    let (factory, channel) = failing_channel();
    let stream = channel.get_or_create_stream("orders").unwrap();
    factory.fail_persists(true);

    let mut appender = stream.appender();
    appender.create("Created").add().unwrap();
    let tx = appender.transaction().unwrap().clone();

    let first = tx.commit().wait().unwrap_err().to_string();
    factory.fail_persists(false);
    let second = tx.commit().wait().unwrap_err().to_string();
    assert_eq!(first, second);
    assert!(stream.is_empty());
}

#[test]
fn rollback_discards_and_is_memoized() {
    let channel = Channel::in_memory("atomicity").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let mut appender = stream.appender();
    appender.create("Created").add().unwrap();
    appender.create("Paid").add().unwrap();
    let tx = appender.transaction().unwrap().clone();

    let rolled = tx.rollback().wait().unwrap();
    assert_eq!(rolled.discarded, 2);
    assert_eq!(tx.rollback().wait().unwrap(), rolled);
    assert!(matches!(tx.commit().wait(), Err(Error::EventTransaction { .. })));
    assert!(stream.is_empty());

    // The appender moves on to a fresh transaction
    appender.create("Created").add().unwrap();
    assert_eq!(appender.commit().wait().unwrap().len(), 1);
}

#[test]
fn empty_commit_succeeds_without_events() {
    let channel = Channel::in_memory("atomicity").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let result = stream.appender().commit().wait().unwrap();
    assert!(result.is_empty());
    assert_eq!(result.last_sequence(), None);
    assert!(stream.is_empty());
}

#[test]
fn codec_lost_before_commit_aborts_whole_transaction() {
    let global = Arc::new(CodecResolver::new());
    global.register(Arc::new(JsonCodec::for_types(["Created", "Paid"])));
    global.register(Arc::new(RawCodec::for_types(["Shipped"])));
    let channel = Channel::open(
        "atomicity",
        Arc::new(MemoryStoreFactory::new()),
        ChannelOptions {
            global_codecs: Some(Arc::clone(&global)),
            ..ChannelOptions::default()
        },
    )
    .unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let mut appender = stream.appender();
    appender.create("Created").add().unwrap();
    appender.create("Paid").add().unwrap();
    appender.create("Shipped").add().unwrap();
    assert!(matches!(
        appender.create("Refunded").add(),
        Err(Error::StreamAppend { .. })
    ));

    // The last event's codec disappears between add() and commit()
    assert!(global.remove("raw"));
    assert!(matches!(
        appender.commit().wait(),
        Err(Error::StreamAppend { .. })
    ));
    assert!(stream.is_empty());
    assert_eq!(stream.last_event_id(), None);
}
