//! Size- and time-bounded batching over a channel

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How a consumer groups payloads
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Largest batch handed out
    pub max_size: usize,

    /// Longest a partial batch waits after its first item arrived
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            max_wait: Duration::from_millis(200),
        }
    }
}

/// Groups items from a channel into batches, preserving arrival order
///
/// A batch is released when it holds `max_size` items, when `max_wait` has
/// passed since its first item arrived, or when the channel closes.
pub struct Batcher<T> {
    rx: mpsc::Receiver<T>,
    config: BatchConfig,
    pending: Vec<T>,
    deadline: Option<Instant>,
}

impl<T> Batcher<T> {
    pub fn new(rx: mpsc::Receiver<T>, config: BatchConfig) -> Self {
        let config = BatchConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            rx,
            pending: Vec::with_capacity(config.max_size),
            config,
            deadline: None,
        }
    }

    fn take(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.config.max_size))
    }

    /// Waits for the next batch
    ///
    /// Returns `None` once the channel is closed and everything has been
    /// handed out.
    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        loop {
            let deadline = self.deadline;

            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Some(self.take());
                }

                item = self.rx.recv() => match item {
                    Some(item) => {
                        if self.pending.is_empty() {
                            self.deadline = Some(Instant::now() + self.config.max_wait);
                        }
                        self.pending.push(item);
                        if self.pending.len() >= self.config.max_size {
                            return Some(self.take());
                        }
                    }
                    None if self.pending.is_empty() => return None,
                    None => return Some(self.take()),
                },
            }
        }
    }
}
