//! Purpose: Reader loop that waits on every registered source and forwards records to the queue.
//! Exports: `Multiplexer`, `MuxStats`.
//! Role: Sole producer for the relay queue; owns every source for its lifetime.
//! Invariants: Sources keep registration order; removal preserves the order of the rest.
//! Invariants: Sources added during a pass are polled starting with the next pass.
//! Invariants: Whatever ends the loop, `Entry::EndOfInput` is pushed exactly once, last.
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::core::queue::{Entry, RecordQueue};
use crate::core::record::Record;
use crate::core::shutdown::ShutdownToken;
use crate::core::source::{ReadStatus, Reporter, Source};
use crate::core::sys::{self, PollFd};

// Registry capacity grows in steps of this many sources.
const SOURCE_BATCH: usize = 8;
const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MuxStats {
    pub forwarded: u64,
    pub discarded: u64,
    pub sources_added: u64,
    pub sources_removed: u64,
}

struct Registered {
    fd: RawFd,
    source: Box<dyn Source>,
}

pub struct Multiplexer {
    registry: Vec<Registered>,
    queue: Arc<RecordQueue>,
    token: ShutdownToken,
    poll_slice: Duration,
    stats: MuxStats,
}

struct PassReporter<'a> {
    queue: &'a RecordQueue,
    added: &'a mut Vec<Box<dyn Source>>,
    stats: &'a mut MuxStats,
}

impl Reporter for PassReporter<'_> {
    fn record(&mut self, record: Record) {
        self.stats.forwarded += 1;
        self.queue.push(Entry::Record(record));
    }

    fn discarded(&mut self) {
        self.stats.discarded += 1;
    }

    fn add_source(&mut self, source: Box<dyn Source>) {
        self.added.push(source);
    }
}

impl Multiplexer {
    pub fn new(queue: Arc<RecordQueue>, token: ShutdownToken) -> Self {
        Self {
            registry: Vec::new(),
            queue,
            token,
            poll_slice: DEFAULT_POLL_SLICE,
            stats: MuxStats::default(),
        }
    }

    /// Bounds each readiness wait, and therefore how long cancellation can go unnoticed.
    pub fn with_poll_slice(mut self, poll_slice: Duration) -> Self {
        self.poll_slice = poll_slice;
        self
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Registers a source at the end of the poll order. A source without a
    /// usable descriptor is cleaned up and rejected.
    pub fn add_source(&mut self, source: Box<dyn Source>) -> bool {
        let fd = match source.fd() {
            Some(fd) if fd >= 0 => fd,
            _ => {
                tracing::warn!(
                    kind = %source.kind(),
                    source = %source.resource(),
                    "source has no usable descriptor, rejected"
                );
                source.cleanup();
                return false;
            }
        };
        if self.registry.len() == self.registry.capacity() {
            self.registry.reserve_exact(SOURCE_BATCH);
        }
        tracing::debug!(kind = %source.kind(), source = %source.resource(), fd, "source added");
        self.registry.push(Registered { fd, source });
        self.stats.sources_added += 1;
        true
    }

    fn remove_source(&mut self, index: usize) {
        let entry = self.registry.remove(index);
        let kind = entry.source.kind();
        let resource = entry.source.resource().to_string();
        if !entry.source.cleanup() {
            tracing::warn!(%kind, source = %resource, "closing source failed");
        }
        self.stats.sources_removed += 1;
        tracing::debug!(%kind, source = %resource, remaining = self.registry.len(), "source removed");
    }

    /// Runs until every source is gone, the token is cancelled, or readiness
    /// waiting fails for good.
    pub fn run(mut self) -> MuxStats {
        let mut poll_set: Vec<PollFd> = Vec::new();
        let mut added: Vec<Box<dyn Source>> = Vec::new();

        loop {
            self.service_ready(&mut poll_set, &mut added);
            for source in added.drain(..) {
                self.add_source(source);
            }

            poll_set.clear();
            poll_set.extend(
                self.registry
                    .iter()
                    .map(|entry| sys::poll_entry(entry.fd, sys::READABLE)),
            );

            if self.registry.is_empty() {
                tracing::info!("no sources left, reader finishing");
                break;
            }
            if self.token.is_cancelled() {
                tracing::info!("shutdown requested, reader finishing");
                break;
            }

            match sys::poll(&mut poll_set, Some(self.poll_slice)) {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    clear_events(&mut poll_set);
                }
                Err(err) => {
                    clear_events(&mut poll_set);
                    if !self.evict_bad_descriptor(&mut poll_set) {
                        tracing::error!(error = %err, "readiness wait failed, reader giving up");
                        break;
                    }
                }
            }
        }

        self.shutdown()
    }

    // Reads every source the last wait flagged, in registration order.
    fn service_ready(&mut self, poll_set: &mut Vec<PollFd>, added: &mut Vec<Box<dyn Source>>) {
        let mut index = 0;
        while index < self.registry.len() {
            let revents = poll_set.get(index).map_or(0, |entry| entry.revents);
            if revents == 0 {
                index += 1;
                continue;
            }
            if revents & sys::INVALID != 0 {
                tracing::warn!(
                    source = %self.registry[index].source.resource(),
                    "descriptor is no longer valid"
                );
                self.remove_at(index, poll_set);
                continue;
            }

            let mut reporter = PassReporter {
                queue: &self.queue,
                added: &mut *added,
                stats: &mut self.stats,
            };
            match self.registry[index].source.read(&mut reporter) {
                ReadStatus::Open => index += 1,
                ReadStatus::Closed => {
                    tracing::info!(
                        kind = %self.registry[index].source.kind(),
                        source = %self.registry[index].source.resource(),
                        "source reached end of input"
                    );
                    self.remove_at(index, poll_set);
                }
                ReadStatus::Failed(err) => {
                    tracing::warn!(
                        kind = %self.registry[index].source.kind(),
                        source = %self.registry[index].source.resource(),
                        error = %err,
                        "source read failed"
                    );
                    self.remove_at(index, poll_set);
                }
            }
        }
    }

    fn remove_at(&mut self, index: usize, poll_set: &mut Vec<PollFd>) {
        self.remove_source(index);
        if index < poll_set.len() {
            poll_set.remove(index);
        }
    }

    // After a failed wait, drop the first source whose descriptor the kernel
    // no longer knows. `false` means nothing was found and the failure stands.
    fn evict_bad_descriptor(&mut self, poll_set: &mut Vec<PollFd>) -> bool {
        let Some(index) = self
            .registry
            .iter()
            .position(|entry| !sys::descriptor_is_open(entry.fd))
        else {
            return false;
        };
        tracing::warn!(
            source = %self.registry[index].source.resource(),
            "removing source with invalid descriptor"
        );
        self.remove_at(index, poll_set);
        true
    }

    fn shutdown(mut self) -> MuxStats {
        while !self.registry.is_empty() {
            let last = self.registry.len() - 1;
            self.remove_source(last);
        }
        self.queue.push(Entry::EndOfInput);
        tracing::info!(
            forwarded = self.stats.forwarded,
            discarded = self.stats.discarded,
            sources_added = self.stats.sources_added,
            sources_removed = self.stats.sources_removed,
            "reader finished"
        );
        self.stats
    }
}

fn clear_events(poll_set: &mut [PollFd]) {
    for entry in poll_set {
        entry.revents = 0;
    }
}
