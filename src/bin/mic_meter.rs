//! Print the live microphone level without a session, for device checks.
//!
//! Usage: `mic_meter [source-name]`

use intellisolve::audio::PulseMicrophone;
use intellisolve::media_in::audio::rms;
use intellisolve::media_in::Microphone;
use std::error::Error;
use std::io::Write;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    println!("Available audio sources:");
    match PulseMicrophone::list_sources() {
        Ok(sources) if sources.is_empty() => println!("No audio sources found!"),
        Ok(sources) => {
            for (i, source) in sources.iter().enumerate() {
                println!(
                    "{}: {} ({})",
                    i + 1,
                    source.description,
                    if source.is_monitor { "Monitor" } else { "Microphone" }
                );
                println!("   Name: {}", source.name);
                println!("   Rate: {} Hz, Channels: {}", source.sample_rate, source.channels);
            }
        }
        Err(e) => println!("Error listing sources: {}", e),
    }

    let mut mic = PulseMicrophone::new("intellisolve-meter");
    if let Some(device) = std::env::args().nth(1) {
        mic = mic.with_device(&device);
    }
    let mut stream = mic.open()?;
    println!("\nMetering for 10 s...");

    let started = Instant::now();
    let mut level = 0.0f32;
    while started.elapsed() < Duration::from_secs(10) {
        let Some(block) = stream.next_block().await else {
            println!("\nSource closed");
            break;
        };
        level = rms(&block).max(level * 0.8);
        let bars = (level * 60.0).min(60.0) as usize;
        print!("\r[{:<60}] {:.3}", "#".repeat(bars), level);
        std::io::stdout().flush()?;
    }
    println!();
    Ok(())
}
