use crate::example::Example;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

/// Answer of a non-blocking example fetch.
#[derive(Debug)]
pub enum Fetch {
    Ready(Example),
    /// Nothing buffered yet, but more is coming.
    Pending,
    /// The producer is done.
    Exhausted,
}

/// Where the trainer pulls examples from.
pub trait ExampleSource {
    fn get_example(&mut self) -> Fetch;

    /// Hands back an example once the trainer is finished with it.
    fn finish_example(&mut self, _example: Example) {}
}

/// Consumer end of a bounded channel fed by a producer thread.
pub struct ChannelSource {
    rx: Receiver<Example>,
    finished: usize,
}

/// Bounded producer/consumer pair. Dropping the source makes further
/// `send`s fail, which is how producers learn to stop early.
pub fn channel(capacity: usize) -> (SyncSender<Example>, ChannelSource) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (tx, ChannelSource { rx, finished: 0 })
}

impl ChannelSource {
    pub fn finished(&self) -> usize {
        self.finished
    }
}

impl ExampleSource for ChannelSource {
    fn get_example(&mut self) -> Fetch {
        match self.rx.try_recv() {
            Ok(ex) => Fetch::Ready(ex),
            Err(TryRecvError::Empty) => Fetch::Pending,
            Err(TryRecvError::Disconnected) => Fetch::Exhausted,
        }
    }

    fn finish_example(&mut self, _example: Example) {
        self.finished += 1;
    }
}

/// Replays an in-memory data set `passes` times in the same order, tagging
/// each copy with its pass number.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    examples: Vec<Example>,
    passes: usize,
    pass: usize,
    next: usize,
}

impl ReplaySource {
    pub fn new(examples: Vec<Example>, passes: usize) -> Self {
        Self {
            examples,
            passes,
            pass: 0,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

impl ExampleSource for ReplaySource {
    fn get_example(&mut self) -> Fetch {
        if self.examples.is_empty() {
            return Fetch::Exhausted;
        }
        if self.next == self.examples.len() {
            self.next = 0;
            self.pass += 1;
        }
        if self.pass >= self.passes {
            return Fetch::Exhausted;
        }
        let mut ex = self.examples[self.next].clone();
        ex.pass = self.pass;
        self.next += 1;
        Fetch::Ready(ex)
    }
}
