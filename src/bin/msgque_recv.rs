// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receiving side of the two-process demo.
//
// Usage:
//   msgque_recv <queue_name>
//
// Creates (or opens) the named queue and prints every received message
// until the queue is stopped from another handle.

use msgque::{MessageQueue, Permissions};

const MAX_QUEUE_SIZE: u32 = 64;
const MAX_MESSAGE_SIZE: u32 = 1024;

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("msgque=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: msgque_recv <queue_name>");
        std::process::exit(1);
    }

    let mq = MessageQueue::open_or_create(
        &args[1],
        MAX_QUEUE_SIZE,
        MAX_MESSAGE_SIZE,
        &Permissions::new(),
    )
    .expect("open queue");

    let mut buf = vec![0u8; mq.max_message_size() as usize];
    loop {
        match mq.receive(&mut buf).expect("receive") {
            Some(n) => println!("received {n} bytes: {}", String::from_utf8_lossy(&buf[..n])),
            None => {
                println!("queue was stopped");
                return;
            }
        }
    }
}
