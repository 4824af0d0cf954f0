//! Durable Reader Tests
//!
//! At-least-once consumption across restarts:
//! - Only acknowledged events advance the tracked position
//! - An unacknowledged event is redelivered after reopening the channel
//! - Corrupt tracking files are reported, not silently reset

mod common;

use std::sync::Arc;
use std::time::Duration;

use canonlog::types::{ReaderId, StreamName};
use canonlog::{
    Channel, ChannelOptions, EngineConfig, Error, EventHandler, EventReader, FileReaderTracker,
    MemoryReaderTracker, MemoryStoreFactory, ReaderTracker, StoreFactory,
};

fn open(factory: &Arc<dyn StoreFactory>, tracking: &std::path::Path) -> Channel {
    let options = ChannelOptions {
        config: EngineConfig {
            tracking_dir: Some(tracking.to_path_buf()),
            ..EngineConfig::default()
        },
        ..ChannelOptions::default()
    };
    Channel::open("billing", Arc::clone(factory), options).unwrap()
}

#[test]
fn unacknowledged_event_is_redelivered_after_restart() {
    let dir = common::temp_dir();
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());

    let events = {
        let channel = open(&factory, dir.path());
        let stream = channel.get_or_create_stream("invoices").unwrap();
        let events = common::commit(&stream, &["A", "B", "C"]);

        let mut reader = stream.durable_reader("biller").unwrap();
        assert_eq!(reader.take().unwrap().event_type, "A");
        reader.ok().unwrap();
        assert_eq!(reader.take().unwrap().event_type, "B");
        // Without ok() the same event comes back
        assert_eq!(reader.take().unwrap().event_type, "B");
        channel.close();
        events
    };

    let channel = open(&factory, dir.path());
    let stream = channel.stream("invoices").unwrap();
    let mut reader = stream.durable_reader("biller").unwrap();
    assert_eq!(reader.acknowledged(), Some(&events[0].sequence));
    assert_eq!(reader.take().unwrap().event_type, "B");
    reader.ok().unwrap();
    assert_eq!(reader.take().unwrap().event_type, "C");
    reader.ok().unwrap();
    assert!(reader.poll().unwrap().is_none());

    // A different reader id has its own position
    let mut other = stream.durable_reader("auditor").unwrap();
    assert_eq!(other.acknowledged(), None);
    assert_eq!(other.take().unwrap().event_type, "A");
}

#[test]
fn set_position_is_durable() {
    let dir = common::temp_dir();
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());

    {
        let channel = open(&factory, dir.path());
        let stream = channel.get_or_create_stream("invoices").unwrap();
        let events = common::commit(&stream, &["A", "B", "C"]);
        let mut reader = stream.durable_reader("biller").unwrap();
        reader.set_position(Some(events[1].sequence.clone())).unwrap();
        channel.close();
    }

    let channel = open(&factory, dir.path());
    let stream = channel.stream("invoices").unwrap();
    let mut reader = stream.durable_reader("biller").unwrap();
    assert_eq!(reader.take().unwrap().event_type, "C");
}

#[test]
fn corrupt_tracking_file_is_reported() {
    let dir = common::temp_dir();
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());
    let channel = open(&factory, dir.path());
    let stream = channel.get_or_create_stream("invoices").unwrap();
    common::commit(&stream, &["A"]);

    let tracker = FileReaderTracker::new(dir.path().join("billing")).unwrap();
    let path = tracker.path(&StreamName::new("invoices"), &ReaderId::new("biller"));
    std::fs::write(&path, b"NOTATRACKINGFILE").unwrap();

    assert!(matches!(
        stream.durable_reader("biller"),
        Err(Error::ReaderTracking { .. })
    ));
}

#[test]
fn failed_acknowledgement_keeps_position() {
    let tracker = Arc::new(MemoryReaderTracker::new());
    let channel = Channel::open(
        "billing",
        Arc::new(MemoryStoreFactory::new()),
        ChannelOptions {
            tracker: Some(Arc::clone(&tracker) as Arc<dyn ReaderTracker>),
            ..ChannelOptions::default()
        },
    )
    .unwrap();
    let stream = channel.get_or_create_stream("invoices").unwrap();
    common::commit(&stream, &["A", "B"]);

    let mut reader = stream.durable_reader("biller").unwrap();
    reader.take().unwrap();
    tracker.fail_writes(true);
    assert!(reader.ok().is_err());
    assert_eq!(reader.acknowledged(), None);
    assert_eq!(reader.take().unwrap().event_type, "A");

    tracker.fail_writes(false);
    reader.ok().unwrap();
    assert_eq!(reader.take().unwrap().event_type, "B");
}

#[test]
fn durable_handler_resumes_after_restart() {
    let dir = common::temp_dir();
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());

    {
        let channel = open(&factory, dir.path());
        let stream = channel.get_or_create_stream("invoices").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        stream
            .add_durable_handler(
                "mailer",
                EventHandler::new("mailer", move |event| {
                    tx.send(event.event_type.clone())?;
                    Ok(())
                }),
            )
            .unwrap();
        common::commit(&stream, &["A", "B"]);
        for expected in ["A", "B"] {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        // Wait for the acknowledgement of B to land before shutting down
        let tracker = FileReaderTracker::new(dir.path().join("billing")).unwrap();
        let b = stream.events()[1].sequence.clone();
        common::eventually(Duration::from_secs(5), || {
            let position = tracker
                .load(&StreamName::new("invoices"), &ReaderId::new("mailer"))
                .ok()??;
            (position == b).then_some(())
        });
        channel.close();
    }

    let channel = open(&factory, dir.path());
    let stream = channel.stream("invoices").unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    stream
        .add_durable_handler(
            "mailer",
            EventHandler::new("mailer", move |event| {
                tx.send(event.event_type.clone())?;
                Ok(())
            }),
        )
        .unwrap();
    common::commit(&stream, &["C"]);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "C");
}
