use crate::parser::{parse_reader, ParseStats};
use anyhow::{anyhow, Result};
use ol_core::source::{channel, ChannelSource};
use std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    thread::{self, JoinHandle},
};
use tracing::debug;

/// Examples buffered between the parser thread and the trainer.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Passes fully sent.
    pub passes: usize,
    /// Examples per pass.
    pub examples: usize,
    pub skipped: usize,
}

/// Spawns a thread that parses `path` once per pass and feeds the examples,
/// tagged with their pass, into a bounded channel. It stops early when the
/// returned source is dropped.
pub fn spawn_producer(
    path: PathBuf,
    passes: usize,
    add_constant: bool,
    capacity: usize,
) -> (ChannelSource, JoinHandle<Result<ProducerStats>>) {
    let (tx, source) = channel(capacity);
    let handle = thread::spawn(move || -> Result<ProducerStats> {
        let mut stats = ProducerStats::default();
        for pass in 0..passes {
            let file = File::open(&path)
                .map_err(|e| anyhow!("Failed to open '{}': {}", path.display(), e))?;
            let mut disconnected = false;
            let parsed: ParseStats = parse_reader(BufReader::new(file), add_constant, |mut ex| {
                ex.pass = pass;
                disconnected = tx.send(ex).is_err();
                !disconnected
            })?;
            if disconnected {
                debug!("trainer stopped reading during pass {}", pass);
                break;
            }
            stats.passes += 1;
            stats.examples = parsed.examples;
            stats.skipped = parsed.skipped;
        }
        Ok(stats)
    });
    (source, handle)
}
