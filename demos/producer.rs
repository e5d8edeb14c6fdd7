//! Example producer
//!
//! Registers a channel with shared memory and publishes a counter frame
//! every 100ms over both the ZeroMQ data socket and the segment.
//!
//! Usage: producer <broker-endpoint> <broker-public-key> [channel]

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use switchyard::logging::init_tracing;
use switchyard::{ChannelPattern, Client, ClientConfig, FrameInfo, SchemaHash};

/// Stands in for a real schema digest
const DEMO_SCHEMA: SchemaHash = SchemaHash::new([0x5a; 32]);

fn main() {
    init_tracing();
    let mut args = std::env::args().skip(1);
    let (Some(endpoint), Some(broker_key)) = (args.next(), args.next()) else {
        eprintln!("usage: producer <broker-endpoint> <broker-public-key> [channel]");
        std::process::exit(2);
    };
    let channel_name = args.next().unwrap_or_else(|| "demo_counter".to_string());

    println!("[Producer] Broker: {}", endpoint);
    println!("[Producer] Channel: {}", channel_name);

    let client = match Client::new(ClientConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Producer] Failed to start client: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = client.connect(&endpoint, &broker_key) {
        eprintln!("[Producer] Failed to connect: {}", e);
        std::process::exit(1);
    }
    client.on_channel_closing(|notice| {
        println!("[Producer] Broker closed '{}' ({:?})", notice.channel_name, notice.reason);
    });

    let mut channel = match client.create_channel(
        &channel_name,
        ChannelPattern::PubSub,
        true,
        Some(&DEMO_SCHEMA),
        1,
        Duration::from_secs(5),
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Producer] Failed to create channel: {}", e);
            std::process::exit(1);
        }
    };

    println!("[Producer] Data endpoint: {}", channel.info().zmq_data_endpoint);
    println!("[Producer] Publishing... (Ctrl+C to quit)");

    for counter in 0u64.. {
        let payload = counter.to_le_bytes();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        if let Err(e) = channel.send(&payload) {
            eprintln!("[Producer] Send failed: {}", e);
        }
        if let Some(shm) = channel.shm_producer() {
            let info = FrameInfo::new(payload.len()).with_timestamp(now);
            match shm.publish(&payload, info) {
                Ok(frame_id) if frame_id % 50 == 0 => println!("[Producer] Frame {}", frame_id),
                Ok(_) => {}
                Err(e) => eprintln!("[Producer] Publish failed: {}", e),
            }
        }

        thread::sleep(Duration::from_millis(100));
    }
}
