use std::sync::Arc;

use aether_core::buffer::{SledQueueStore, TransmissionBuffer};
use aether_core::config::TrackerConfig;
use miette::Result;
use owo_colors::OwoColorize;

use crate::output::Output;

fn open(config: &TrackerConfig) -> Result<TransmissionBuffer> {
    let store = SledQueueStore::open(&config.buffer.path, &config.buffer.key)?;
    Ok(TransmissionBuffer::open(
        Arc::new(store),
        config.buffer.capacity,
    ))
}

pub fn status(config: &TrackerConfig, output: &Output) -> Result<()> {
    let buffer = open(config)?;
    output.section("Transmission Buffer");
    output.kv("path", &config.buffer.path.display().to_string());
    output.kv("key", &config.buffer.key);
    output.kv(
        "pending",
        &format!("{} / {}", buffer.count(), buffer.capacity()),
    );
    if let (Some(oldest), Some(newest)) = (buffer.iter().next(), buffer.iter().last()) {
        output.kv("oldest", &oldest.sample.timestamp.to_rfc3339());
        output.kv("newest", &newest.sample.timestamp.to_rfc3339());
    }
    Ok(())
}

pub fn show(config: &TrackerConfig, limit: Option<usize>, output: &Output) -> Result<()> {
    let buffer = open(config)?;
    if buffer.is_empty() {
        output.info("📭", "No buffered samples");
        return Ok(());
    }

    output.section(&format!("Buffered samples ({})", buffer.count()));
    for (n, entry) in buffer
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
    {
        let speed = entry
            .sample
            .speed
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "-".to_string());
        output.print(&format!(
            "{:>4}  {}  {:>10.5} {:>11.5}  speed {:>6}  ±{:.0}m",
            n + 1,
            entry.sample.timestamp.format("%Y-%m-%d %H:%M:%S").dimmed(),
            entry.sample.latitude,
            entry.sample.longitude,
            speed,
            entry.sample.accuracy,
        ));
    }
    Ok(())
}

pub fn clear(config: &TrackerConfig, output: &Output) -> Result<()> {
    let mut buffer = open(config)?;
    let dropped = buffer.count();
    buffer.clear();
    output.success(&format!("Discarded {} buffered samples", dropped));
    Ok(())
}
