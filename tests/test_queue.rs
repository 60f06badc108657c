// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Queue lifecycle and basic send/receive behavior.

use std::sync::atomic::{AtomicUsize, Ordering};

use msgque::{Error, MessageQueue, Permissions};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("mq_{tag}_{n}_{}", std::process::id())
}

fn create(name: &str, max_queue: u32, max_msg: u32) -> MessageQueue {
    MessageQueue::create(name, max_queue, max_msg, &Permissions::new()).expect("create")
}

#[test]
fn send_receive_in_order() {
    let name = unique_name("basic");
    let mq = create(&name, 2, 8);

    assert!(mq.send(b"hi").expect("send hi"));
    assert!(mq.send(b"bye").expect("send bye"));

    let mut buf = [0u8; 8];
    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(n, 2);
    assert_eq!(&buf[..n], b"hi");

    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(n, 3);
    assert_eq!(&buf[..n], b"bye");

    assert_eq!(mq.try_receive(&mut buf).expect("try_receive"), None);
}

#[test]
fn try_send_full_queue() {
    let name = unique_name("full");
    let mq = create(&name, 1, 4);

    assert!(mq.send(b"a").expect("send a"));
    assert!(!mq.try_send(b"b").expect("try_send full"));

    let mut buf = [0u8; 4];
    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"a");

    assert!(mq.try_send(b"b").expect("try_send after drain"));
}

#[test]
fn empty_message() {
    let name = unique_name("empty");
    let mq = create(&name, 2, 16);

    assert!(mq.send(b"").expect("send empty"));
    let mut buf = [0u8; 16];
    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(n, 0);
}

#[test]
fn ring_wraparound() {
    let name = unique_name("wrap");
    let mq = create(&name, 3, 4);
    let mut buf = [0u8; 4];

    // Drive head/tail around the ring a few times.
    let mut expected = Vec::new();
    let mut received = Vec::new();
    for round in 0u8..5 {
        for i in 0..3u8 {
            let msg = [round, i];
            assert!(mq.send(&msg).expect("send"));
            expected.push(msg.to_vec());
        }
        for _ in 0..3 {
            let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
            received.push(buf[..n].to_vec());
        }
    }
    assert_eq!(received, expected);
    assert_eq!(mq.try_receive(&mut buf).expect("try_receive"), None);
}

#[test]
#[should_panic(expected = "exceeds max_message_size")]
fn oversized_message_panics() {
    let name = unique_name("oversized");
    let mq = create(&name, 1, 4);
    let _ = mq.send(&[0u8; 5]);
}

#[test]
#[should_panic(expected = "smaller than max_message_size")]
fn undersized_buffer_panics() {
    let name = unique_name("smallbuf");
    let mq = create(&name, 1, 8);
    let mut buf = [0u8; 4];
    let _ = mq.receive(&mut buf);
}

#[test]
fn failed_validation_leaves_queue_untouched() {
    let name = unique_name("novalidate");
    let mq = create(&name, 2, 4);

    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = mq.send(&[0u8; 5]);
    }));
    assert!(r.is_err(), "oversized send should panic");

    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut small = [0u8; 1];
        let _ = mq.receive(&mut small);
    }));
    assert!(r.is_err(), "undersized receive should panic");

    // Queue still empty and fully usable.
    let mut buf = [0u8; 4];
    assert_eq!(mq.try_receive(&mut buf).expect("try_receive"), None);
    assert!(mq.send(b"ok").expect("send"));
    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"ok");
}

#[test]
#[should_panic(expected = "not open")]
fn closed_handle_panics() {
    let name = unique_name("closed");
    let mut mq = create(&name, 1, 4);
    mq.close();
    let _ = mq.send(b"x");
}

#[test]
fn close_is_idempotent() {
    let name = unique_name("close2");
    let mut mq = create(&name, 1, 4);
    assert!(mq.is_open());
    mq.close();
    assert!(!mq.is_open());
    mq.close();
    assert!(!mq.is_open());
}

#[test]
fn accessors_report_creation_values() {
    let name = unique_name("accessors");
    let mq = create(&name, 7, 33);
    assert!(mq.is_open());
    assert_eq!(mq.name(), name);
    assert_eq!(mq.max_queue_size(), 7);
    assert_eq!(mq.max_message_size(), 33);
}

#[test]
fn open_reports_creator_values() {
    let name = unique_name("creator_wins");
    let creator = create(&name, 4, 16);

    // The caller's sizes are ignored when the queue already exists.
    let opener = MessageQueue::open_or_create(&name, 9, 99, &Permissions::new()).expect("open");
    assert_eq!(opener.max_queue_size(), 4);
    assert_eq!(opener.max_message_size(), 16);

    let opened = MessageQueue::open(&name).expect("open only");
    assert_eq!(opened.max_queue_size(), 4);
    assert_eq!(opened.max_message_size(), 16);

    drop(creator);
}

#[test]
fn two_handles_share_queue() {
    let name = unique_name("shared");
    let producer = create(&name, 4, 16);
    let consumer = MessageQueue::open(&name).expect("open");

    assert!(producer.send(b"alpha").expect("send alpha"));
    assert!(producer.send(b"beta").expect("send beta"));

    let mut buf = [0u8; 16];
    let n = consumer.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"alpha");
    let n = consumer.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"beta");
}

#[test]
fn queue_survives_while_any_handle_open() {
    let name = unique_name("survives");
    let mut creator = create(&name, 4, 8);
    let keeper = MessageQueue::open(&name).expect("open");

    assert!(creator.send(b"kept").expect("send"));
    creator.close();

    let mut buf = [0u8; 8];
    let n = keeper.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"kept");
}

#[test]
fn destroyed_after_last_close() {
    let name = unique_name("destroyed");
    {
        let _mq = create(&name, 1, 4);
    }
    match MessageQueue::open(&name) {
        Err(Error::NotFound) => {}
        Err(e) => panic!("expected NotFound, got {e:?}"),
        Ok(_) => panic!("expected NotFound, got an open queue"),
    }
}

#[test]
fn create_exclusive_fails_if_exists() {
    let name = unique_name("exclusive");
    let _mq = create(&name, 1, 4);
    match MessageQueue::create(&name, 1, 4, &Permissions::new()) {
        Err(Error::AlreadyExists) => {}
        Err(e) => panic!("expected AlreadyExists, got {e:?}"),
        Ok(_) => panic!("expected AlreadyExists, got an open queue"),
    }
}

#[test]
fn open_nonexistent_fails() {
    let name = unique_name("absent");
    match MessageQueue::open(&name) {
        Err(Error::NotFound) => {}
        Err(e) => panic!("expected NotFound, got {e:?}"),
        Ok(_) => panic!("expected NotFound, got an open queue"),
    }
}

#[test]
fn invalid_names_rejected() {
    for bad in ["", "9queue", "has space", "has-dash"] {
        match MessageQueue::open(bad) {
            Err(Error::InvalidName(_)) => {}
            Err(e) => panic!("expected InvalidName for {bad:?}, got {e:?}"),
            Ok(_) => panic!("expected InvalidName for {bad:?}, got an open queue"),
        }
    }
}

#[cfg(unix)]
#[test]
fn create_with_custom_mode() {
    let name = unique_name("mode");
    let mq = MessageQueue::create(&name, 1, 4, &Permissions::with_mode(0o600)).expect("create");
    assert!(mq.send(b"x").expect("send"));
}
