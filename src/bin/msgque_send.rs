// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sending side of the two-process demo.
//
// Usage:
//   msgque_send <queue_name> [message ...]
//
// Creates (or opens) the named queue and sends each message argument; with
// no message arguments, reads lines from stdin and sends each line. Run
// msgque_recv with the same queue name in another terminal.

use std::io::BufRead;

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
    if args.len() < 2 {
        eprintln!("usage: msgque_send <queue_name> [message ...]");
        std::process::exit(1);
    }

    let mq = MessageQueue::open_or_create(
        &args[1],
        MAX_QUEUE_SIZE,
        MAX_MESSAGE_SIZE,
        &Permissions::new(),
    )
    .expect("open queue");

    if args.len() > 2 {
        for msg in &args[2..] {
            match mq.send(msg.as_bytes()).expect("send") {
                true => println!("sent {} bytes", msg.len()),
                false => {
                    println!("queue is stopped");
                    return;
                }
            }
        }
        return;
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.expect("read stdin");
        if !mq.send(line.as_bytes()).expect("send") {
            println!("queue is stopped");
            return;
        }
        println!("sent {} bytes", line.len());
    }
}
