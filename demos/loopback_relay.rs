//! Loopback relay example.
//!
//! Captures whatever the system is playing, encodes it to Ogg Vorbis with `oggenc2` and
//! streams the result to the first client that connects on port 7777.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example loopback_relay
//! # Listen elsewhere, or use another encoder on the PATH:
//! cargo run --example loopback_relay -- 9000 oggenc
//! ```
//!
//! Then connect, for example with `nc localhost 7777 > capture.ogg`.

use stream_relay::source::{default_output_device_name, list_input_devices};
use stream_relay::{AudioSource, CapturePipeline, EncoderConfig, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };
    let mut encoder = EncoderConfig::oggenc();
    if let Some(program) = args.next() {
        encoder.program = program;
    }

    println!("Loopback Relay Example");
    println!("======================");
    println!();
    match default_output_device_name() {
        Some(name) => println!("Capturing playback of: {name}"),
        None => println!("No default output device found, start will fail."),
    }
    let inputs = list_input_devices().unwrap_or_default();
    if !inputs.is_empty() {
        println!("Input devices: {}", inputs.join(", "));
    }
    println!();

    let pipeline = CapturePipeline::builder()
        .source(AudioSource::loopback())
        .encoder(encoder)
        .port(port)
        .on_event(|event| {
            println!("Event: {event:?}");
        })
        .build()?;

    pipeline.start().await?;
    if let Some(addr) = pipeline.relay_addr() {
        println!("Listening on {addr}, capture starts when a client connects.");
    }
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    // Get stats before stopping
    if let Some(stats) = pipeline.stats().await {
        println!();
        println!("Stats:");
        println!("  Samples captured: {}", stats.samples_captured);
        println!("  Samples dropped:  {}", stats.samples_dropped);
        println!("  Chunks produced:  {}", stats.chunks_produced);
        println!("  Chunks sent:      {}", stats.chunks_sent);
        println!("  Bytes sent:       {}", stats.bytes_sent);
    }

    pipeline.stop().await?;
    println!("Done!");

    Ok(())
}
