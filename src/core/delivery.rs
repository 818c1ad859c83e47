//! Purpose: Consumer loop that moves records from the queue to the destination.
//! Exports: `deliver`, `DeliveryConfig`, `DeliveryEngine`, `DeliveryStats`.
//! Role: Sole consumer of the relay queue; spools to the backlog while the destination is down.
//! Invariants: Records leave in the order they entered, across the backlog and the queue.
//! Invariants: While a backlog is being replayed, no queued record is delivered directly.
//! Invariants: Nothing handed to this loop is lost; undelivered records end up in the backlog.
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::backlog::Backlog;
use crate::core::destination::{DestState, Destination};
use crate::core::error::Error;
use crate::core::queue::{Entry, RecordQueue};
use crate::core::record::Record;
use crate::core::sys;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeliveryConfig {
    /// Failed attempts allowed per `deliver` call.
    pub retry: u32,
    /// Readiness wait while connected.
    pub send_timeout: Duration,
    /// Readiness wait otherwise, and the pause after a failed attempt.
    pub idle_wait: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: 3,
            send_timeout: Duration::from_secs(30),
            idle_wait: Duration::from_secs(5),
        }
    }
}

/// Tries to get one record out. `false` after `config.retry` failed
/// attempts; write progress restores the full budget.
pub fn deliver(dest: &mut dyn Destination, record: &Record, config: &DeliveryConfig) -> bool {
    let wire = record.wire();
    let mut remaining = wire.len();
    let mut budget = config.retry;

    while budget > 0 {
        if dest.state() == DestState::Disconnected {
            // A new connection carries the record from its first byte.
            remaining = wire.len();
            dest.connect();
        }

        if dest.state() != DestState::Error {
            let connected = matches!(dest.state(), DestState::Ready | DestState::Sending);
            let wait = if connected {
                config.send_timeout
            } else {
                config.idle_wait
            };
            let ready = match dest.fd() {
                Some(fd) => match sys::wait_writable(fd, wait) {
                    Ok(ready) => ready,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(dest = dest.describe(), error = %err, "readiness wait failed");
                        return false;
                    }
                },
                None => {
                    thread::sleep(wait);
                    false
                }
            };

            if !ready {
                tracing::debug!(dest = dest.describe(), state = %dest.state(), "destination not ready in time");
                dest.timeout();
                budget -= 1;
                continue;
            }

            match dest.state() {
                DestState::Connecting => {
                    dest.connect();
                }
                DestState::Ready | DestState::Sending => {
                    let before = remaining;
                    if dest.write(wire, &mut remaining) {
                        return true;
                    }
                    if remaining < before {
                        budget = config.retry;
                    }
                }
                DestState::Disconnected | DestState::Error => {}
            }
        }

        if dest.state() == DestState::Error {
            dest.disconnect();
            budget -= 1;
            if budget > 0 {
                thread::sleep(config.idle_wait);
            }
        }
    }
    false
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub spooled: u64,
    pub replayed: u64,
    pub failed_attempts: u64,
}

enum Drain {
    Done,
    EndOfInput,
}

pub struct DeliveryEngine {
    queue: Arc<RecordQueue>,
    dest: Box<dyn Destination>,
    backlog: Backlog,
    config: DeliveryConfig,
    stats: DeliveryStats,
    in_hand: Option<Record>,
}

impl DeliveryEngine {
    /// Prepares the loop and picks up any backlog a previous run left behind.
    /// The backlog must be usable; this is the only fatal failure.
    pub fn new(
        queue: Arc<RecordQueue>,
        dest: Box<dyn Destination>,
        mut backlog: Backlog,
        config: DeliveryConfig,
    ) -> Result<Self, Error> {
        backlog.check_writable()?;
        let in_hand = backlog.resume()?;
        if in_hand.is_some() {
            tracing::info!(backlog = %backlog.path().display(), "replaying backlog from previous run");
        }
        Ok(Self {
            queue,
            dest,
            backlog,
            config,
            stats: DeliveryStats::default(),
            in_hand,
        })
    }

    pub fn run(mut self) -> DeliveryStats {
        let mut current = match self.in_hand.take() {
            Some(record) => {
                self.stats.replayed += 1;
                Some(record)
            }
            None => self.next_from_queue(),
        };

        while let Some(record) = current.take() {
            if deliver(self.dest.as_mut(), &record, &self.config) {
                self.stats.delivered += 1;
                current = self.next_after_delivery();
                continue;
            }

            self.stats.failed_attempts += 1;
            tracing::warn!(
                dest = self.dest.describe(),
                backlog = %self.backlog.path().display(),
                "delivery failed, spooling to backlog"
            );
            current = self.spool(record);
        }

        if !self.dest.cleanup() {
            tracing::warn!(dest = self.dest.describe(), "closing destination failed");
        }
        self.backlog.close();
        tracing::info!(
            delivered = self.stats.delivered,
            spooled = self.stats.spooled,
            replayed = self.stats.replayed,
            failed_attempts = self.stats.failed_attempts,
            "delivery finished"
        );
        self.stats
    }

    fn next_from_queue(&mut self) -> Option<Record> {
        match self.queue.pop() {
            Entry::Record(record) => Some(record),
            Entry::EndOfInput => None,
        }
    }

    // Replay comes first; the queue is only consulted once the backlog is empty.
    fn next_after_delivery(&mut self) -> Option<Record> {
        if self.backlog.is_replaying() {
            match self.backlog.next_record() {
                Ok(Some(record)) => {
                    self.backlog.stop_appending();
                    self.stats.replayed += 1;
                    return Some(record);
                }
                Ok(None) => {
                    tracing::info!("backlog drained");
                    if let Err(err) = self.backlog.finish() {
                        tracing::error!(error = %err, "truncating drained backlog failed");
                    }
                }
                Err(err) => {
                    // Leave the file alone; the next run replays it again.
                    tracing::error!(error = %err, "reading backlog failed, switching to live input");
                    self.backlog.close();
                }
            }
        }
        self.next_from_queue()
    }

    // After a failed delivery: make sure `record` and everything queued so far
    // is in the backlog, then hand back the record to retry. `None` once input
    // has ended, with everything safe on disk.
    fn spool(&mut self, record: Record) -> Option<Record> {
        if self.backlog.is_replaying() {
            // `record` came from the backlog; only queued records need spooling.
            if let Err(err) = self.backlog.ensure_append() {
                tracing::error!(error = %err, "cannot open backlog for appending");
                return Some(record);
            }
            return match self.drain_queue() {
                Drain::Done => Some(record),
                Drain::EndOfInput => None,
            };
        }

        if let Err(err) = self.backlog.begin() {
            tracing::error!(error = %err, "cannot open backlog");
            self.backlog.close();
            return Some(record);
        }
        if let Err(err) = self.backlog.append(&record) {
            tracing::error!(error = %err, "cannot write backlog");
            self.backlog.close();
            return Some(record);
        }
        self.stats.spooled += 1;

        if let Drain::EndOfInput = self.drain_queue() {
            return None;
        }
        match self.backlog.next_record() {
            Ok(Some(head)) => Some(head),
            Ok(None) => {
                tracing::error!("backlog lost the record just written");
                Some(record)
            }
            Err(err) => {
                tracing::error!(error = %err, "reading backlog failed");
                Some(record)
            }
        }
    }

    // Moves what is queued right now into the backlog. On a write failure the
    // record goes back to the queue head and the rest waits for the next round.
    fn drain_queue(&mut self) -> Drain {
        let pending = self.queue.size();
        for _ in 0..pending {
            let Some(entry) = self.queue.try_pop() else {
                break;
            };
            let record = match entry {
                Entry::Record(record) => record,
                Entry::EndOfInput => {
                    tracing::info!(
                        backlog = %self.backlog.path().display(),
                        "input ended while destination unavailable, backlog kept for next run"
                    );
                    return Drain::EndOfInput;
                }
            };
            if let Err(err) = self.backlog.append(&record) {
                tracing::error!(error = %err, "cannot write backlog");
                self.queue.unpop(Entry::Record(record));
                break;
            }
            self.stats.spooled += 1;
        }
        Drain::Done
    }
}
