//! Example consumer
//!
//! Connects to a channel published by the producer demo and prints what
//! arrives on the data socket and in shared memory.
//!
//! Usage: consumer <broker-endpoint> <broker-public-key> [channel]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard::logging::init_tracing;
use switchyard::{Client, ClientConfig, SchemaHash};

const DEMO_SCHEMA: SchemaHash = SchemaHash::new([0x5a; 32]);

fn main() {
    init_tracing();
    let mut args = std::env::args().skip(1);
    let (Some(endpoint), Some(broker_key)) = (args.next(), args.next()) else {
        eprintln!("usage: consumer <broker-endpoint> <broker-public-key> [channel]");
        std::process::exit(2);
    };
    let channel_name = args.next().unwrap_or_else(|| "demo_counter".to_string());

    let client = match Client::new(ClientConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Consumer] Failed to start client: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = client.connect(&endpoint, &broker_key) {
        eprintln!("[Consumer] Failed to connect: {}", e);
        std::process::exit(1);
    }

    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = Arc::clone(&closed);
        client.on_channel_closing(move |notice| {
            println!("[Consumer] '{}' is closing ({:?})", notice.channel_name, notice.reason);
            closed.store(true, Ordering::Release);
        });
    }

    let mut channel =
        match client.connect_channel(&channel_name, Duration::from_secs(10), Some(&DEMO_SCHEMA)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("[Consumer] Failed to connect to '{}': {}", channel_name, e);
                std::process::exit(1);
            }
        };
    println!(
        "[Consumer] Connected to '{}' (pid {} on {})",
        channel_name,
        channel.info().producer_pid,
        channel.info().producer_hostname
    );

    while !closed.load(Ordering::Acquire) {
        match channel.recv(Some(Duration::from_millis(500))) {
            Ok(Some(msg)) => {
                let counter = msg
                    .as_slice()
                    .try_into()
                    .map(u64::from_le_bytes)
                    .unwrap_or_default();
                println!("[Consumer] zmq: {}", counter);
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("[Consumer] Receive failed: {}", e);
                break;
            }
        }

        if let Some(shm) = channel.shm_consumer() {
            match shm.consume_next(Some(Duration::ZERO)) {
                Ok(Some(frame)) => println!(
                    "[Consumer] shm: frame {} ({} bytes, t={:.3})",
                    frame.frame_id(),
                    frame.data().len(),
                    frame.info().timestamp
                ),
                Ok(None) => {}
                Err(e) => eprintln!("[Consumer] Shared memory read failed: {}", e),
            }
        }
    }

    let _ = client.deregister_consumer(&channel_name, Duration::from_secs(1));
    println!("[Consumer] Done");
}
