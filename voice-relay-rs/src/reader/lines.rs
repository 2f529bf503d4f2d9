//! Cancellation-aware stdin line source.
//!
//! Blocking stdin reads cannot be interrupted, so a detached thread feeds
//! lines into a channel and the consumer polls it, checking the token
//! between polls.

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct StdinLines {
    rx: Receiver<String>,
    cancel: CancellationToken,
}

impl StdinLines {
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("stdin-lines".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read stdin: {e}");
                            break;
                        }
                    }
                }
                debug!("stdin closed");
            })
            .map(|_| ())
            .unwrap_or_else(|e| warn!("Failed to spawn stdin reader: {e}"));

        Self::from_receiver(rx, cancel)
    }

    pub fn from_receiver(rx: Receiver<String>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }
}

impl Iterator for StdinLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_lines_until_sender_drops() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send("one".to_string()).unwrap();
        tx.send("two".to_string()).unwrap();
        drop(tx);

        let lines: Vec<String> = StdinLines::from_receiver(rx, CancellationToken::new()).collect();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn cancellation_ends_a_waiting_source() {
        let (_tx, rx) = crossbeam_channel::unbounded::<String>();
        let cancel = CancellationToken::new();
        let mut lines = StdinLines::from_receiver(rx, cancel.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            cancel.cancel();
        });
        assert_eq!(lines.next(), None);
        canceller.join().unwrap();
    }
}
