//! Handler Isolation Tests
//!
//! Async handlers share a worker pool but not their fate:
//! - A FAIL handler is removed on its first error; its neighbours keep going
//! - A CONTINUE handler skips the bad event and sees the rest
//! - A RETRY handler sees the same event again until it succeeds
//! - A panicking handler is treated like a failing one

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use canonlog::{Channel, EventHandler, EventHandlerAction};

const WAIT: Duration = Duration::from_secs(5);

fn recorder(name: &str) -> (EventHandler, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    let handler = EventHandler::new(name, move |event| {
        tx.send(event.event_type.clone())?;
        Ok(())
    });
    (handler, rx)
}

fn drain(rx: &mpsc::Receiver<String>, count: usize) -> Vec<String> {
    (0..count).map(|_| rx.recv_timeout(WAIT).unwrap()).collect()
}

#[test]
fn failing_handler_is_removed_without_affecting_others() {
    let channel = Channel::in_memory("handlers").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let (healthy, healthy_rx) = recorder("healthy");
    let healthy_id = stream.add_handler(healthy);

    let broken_calls = Arc::new(AtomicUsize::new(0));
    let broken_id = {
        let calls = Arc::clone(&broken_calls);
        stream.add_handler(EventHandler::new("broken", move |event| {
            calls.fetch_add(1, Ordering::SeqCst);
            if event.event_type == "Poison" {
                return Err("cannot process poison".into());
            }
            Ok(())
        }))
    };

    common::commit(&stream, &["A", "Poison", "B", "C"]);

    assert_eq!(drain(&healthy_rx, 4), vec!["A", "Poison", "B", "C"]);
    common::eventually(WAIT, || (!channel.notifier().contains(broken_id)).then_some(()));
    assert!(channel.notifier().contains(healthy_id));
    assert_eq!(broken_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn continue_handler_skips_bad_event() {
    let channel = Channel::in_memory("handlers").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let (tx, rx) = mpsc::channel();
    let id = stream.add_handler(
        EventHandler::new("tolerant", move |event| {
            if event.event_type == "Poison" {
                return Err("cannot process poison".into());
            }
            tx.send(event.event_type.clone())?;
            Ok(())
        })
        .on_failure(|_, _| EventHandlerAction::Continue),
    );

    common::commit(&stream, &["A", "Poison", "B"]);

    assert_eq!(drain(&rx, 2), vec!["A", "B"]);
    assert!(channel.notifier().contains(id));
}

#[test]
fn retry_handler_sees_event_until_success() {
    let channel = Channel::in_memory("handlers").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    {
        let attempts = Arc::clone(&attempts);
        stream.add_handler(
            EventHandler::new("flaky", move |event| {
                if event.event_type == "Flaky" && attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err("transient".into());
                }
                tx.send(event.event_type.clone())?;
                Ok(())
            })
            .on_failure(|_, _| EventHandlerAction::Retry),
        );
    }

    common::commit(&stream, &["Flaky", "After"]);

    assert_eq!(drain(&rx, 2), vec!["Flaky", "After"]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn panicking_handler_is_removed() {
    let channel = Channel::in_memory("handlers").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let (healthy, healthy_rx) = recorder("healthy");
    stream.add_handler(healthy);
    let panicky = stream.add_handler(EventHandler::new("panicky", |_| panic!("boom")));

    common::commit(&stream, &["A", "B"]);

    assert_eq!(drain(&healthy_rx, 2), vec!["A", "B"]);
    common::eventually(WAIT, || (!channel.notifier().contains(panicky)).then_some(()));
}

#[test]
fn removed_handler_stops_receiving() {
    let channel = Channel::in_memory("handlers").unwrap();
    let stream = channel.get_or_create_stream("orders").unwrap();

    let (handler, rx) = recorder("temporary");
    let id = stream.add_handler(handler);
    common::commit(&stream, &["A"]);
    assert_eq!(drain(&rx, 1), vec!["A"]);

    assert!(stream.remove_handler(id));
    assert!(!stream.remove_handler(id));
    common::commit(&stream, &["B"]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}
