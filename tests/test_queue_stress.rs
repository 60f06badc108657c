// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stress tests: ordering under a single producer/consumer pair and
// conservation of messages under many producers and consumers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use msgque::{MessageQueue, Permissions};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("mq_str_{tag}_{n}_{}", std::process::id())
}

// Single producer, single consumer: the received sequence is the sent
// sequence, byte for byte and in order.
#[test]
fn spsc_in_order() {
    let name = unique_name("spsc");
    let mq = Arc::new(MessageQueue::create(&name, 8, 8, &Permissions::new()).expect("create"));

    let msg_count = 2000u64;

    let mq2 = Arc::clone(&mq);
    let consumer = thread::spawn(move || {
        let mut buf = [0u8; 8];
        for expected in 0..msg_count {
            let n = mq2.receive(&mut buf).expect("receive").expect("interrupted");
            assert_eq!(n, 8);
            assert_eq!(u64::from_le_bytes(buf), expected, "out of order");
        }
    });

    let start = Instant::now();
    for i in 0..msg_count {
        assert!(mq.send(&i.to_le_bytes()).expect("send"));
    }
    consumer.join().unwrap();

    let elapsed = start.elapsed();
    eprintln!(
        "spsc: {msg_count} msgs in {:.1}ms ({:.0} msg/s)",
        elapsed.as_secs_f64() * 1000.0,
        msg_count as f64 / elapsed.as_secs_f64()
    );
}

// Many producers, many consumers: the multiset of received payloads equals
// the multiset of sent payloads.
#[test]
fn mpmc_conserves_messages() {
    let name = unique_name("mpmc");
    let mq = Arc::new(MessageQueue::create(&name, 4, 8, &Permissions::new()).expect("create"));

    let num_senders = 4u8;
    let num_receivers = 4usize;
    let per_sender = 250usize;
    let total = num_senders as usize * per_sender;

    let received = Arc::new(Mutex::new(Vec::with_capacity(total)));

    let mut receivers = Vec::new();
    for _ in 0..num_receivers {
        let mq = Arc::clone(&mq);
        let received = Arc::clone(&received);
        receivers.push(thread::spawn(move || {
            let mut buf = [0u8; 8];
            loop {
                match mq.receive(&mut buf).expect("receive") {
                    Some(n) => received.lock().unwrap().push(buf[..n].to_vec()),
                    None => return, // stopped
                }
            }
        }));
    }

    let mut senders = Vec::new();
    for id in 0..num_senders {
        let mq = Arc::clone(&mq);
        senders.push(thread::spawn(move || {
            for seq in 0..per_sender as u32 {
                let mut msg = [0u8; 5];
                msg[0] = id;
                msg[1..].copy_from_slice(&seq.to_le_bytes());
                assert!(mq.send(&msg).expect("send"));
            }
        }));
    }

    for s in senders {
        s.join().unwrap();
    }

    // Wait for the receivers to drain the tail, then release them.
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.lock().unwrap().len() < total {
        assert!(Instant::now() < deadline, "receivers never drained the queue");
        thread::sleep(Duration::from_millis(10));
    }
    mq.stop().expect("stop");
    for r in receivers {
        r.join().unwrap();
    }

    let mut got = Arc::try_unwrap(received).unwrap().into_inner().unwrap();
    assert_eq!(got.len(), total);

    let mut expected = Vec::with_capacity(total);
    for id in 0..num_senders {
        for seq in 0..per_sender as u32 {
            let mut msg = vec![0u8; 5];
            msg[0] = id;
            msg[1..].copy_from_slice(&seq.to_le_bytes());
            expected.push(msg);
        }
    }
    got.sort();
    expected.sort();
    assert_eq!(got, expected, "messages were lost, duplicated or corrupted");
}

// Producers keep hammering a tiny queue across repeated stop/reset cycles;
// the queue must stay consistent and usable afterwards.
#[test]
fn survives_stop_reset_storm() {
    let name = unique_name("storm");
    let mq = Arc::new(MessageQueue::create(&name, 2, 4, &Permissions::new()).expect("create"));

    let mq_a = Arc::clone(&mq);
    let producer = thread::spawn(move || {
        let mut sent = 0usize;
        for _ in 0..500 {
            if mq_a.send(b"p").expect("send") {
                sent += 1;
            }
        }
        sent
    });

    let mq_b = Arc::clone(&mq);
    let consumer = thread::spawn(move || {
        let mut buf = [0u8; 4];
        let mut got = 0usize;
        for _ in 0..500 {
            if mq_b.receive(&mut buf).expect("receive").is_some() {
                got += 1;
            }
        }
        got
    });

    for _ in 0..20 {
        thread::sleep(Duration::from_millis(1));
        mq.stop().expect("stop");
        thread::sleep(Duration::from_millis(1));
        mq.reset().expect("reset");
    }

    // Keep the queue neither permanently full nor empty so neither side
    // can block forever once the stop cycles are over.
    let drainer = Arc::clone(&mq);
    let driver = thread::spawn(move || {
        let mut buf = [0u8; 4];
        while Arc::strong_count(&drainer) > 2 {
            if drainer.try_receive(&mut buf).expect("try_receive").is_none() {
                let _ = drainer.try_send(b"d").expect("try_send");
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    let sent = producer.join().unwrap();
    let got = consumer.join().unwrap();
    driver.join().unwrap();
    eprintln!("storm: {sent} sent, {got} received across stop/reset cycles");

    // The ring is still coherent: a round trip works.
    mq.reset().expect("reset");
    mq.clear().expect("clear");
    assert!(mq.send(b"ok").expect("send"));
    let mut buf = [0u8; 4];
    let n = mq.receive(&mut buf).expect("receive").expect("interrupted");
    assert_eq!(&buf[..n], b"ok");
}
