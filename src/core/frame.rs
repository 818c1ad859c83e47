// Fixed-capacity circular buffer that frames raw stream bytes into delimiter-terminated lines.
//
// Cursor model over one backing array of `capacity` bytes:
//   border    read position; the oldest unconsumed byte, a line always starts here
//   current   write position; where the next read lands
//   available free bytes in total
//   writable  free bytes contiguous at `current` before the physical end or `border`
use bstr::ByteSlice;

use crate::core::record::DELIMITER;

pub const DEFAULT_CAPACITY: usize = 1_000_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extracted {
    pub records: usize,
    /// The buffer filled up without a delimiter and its contents were dropped.
    pub overflowed: bool,
    /// A purge finished on this pass; the tail of an oversized line was dropped.
    pub resynced: bool,
}

#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
    border: usize,
    current: usize,
    available: usize,
    writable: usize,
    purging: bool,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame buffer capacity must be non-zero");
        let buffer = Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            border: 0,
            current: 0,
            available: capacity,
            writable: capacity,
            purging: false,
        };
        debug_assert!(buffer.is_consistent());
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn writable(&self) -> usize {
        self.writable
    }

    pub fn is_empty(&self) -> bool {
        self.available == self.capacity()
    }

    pub fn is_purging(&self) -> bool {
        self.purging
    }

    /// Contiguous free space at the write cursor.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.current;
        &mut self.data[start..start + self.writable]
    }

    /// Commits `n` bytes just written into `spare_mut()`.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.writable,
            "advance({n}) exceeds writable space ({})",
            self.writable
        );
        self.current += n;
        self.available -= n;
        if self.current == self.capacity() {
            self.current = 0;
        }
        self.writable = if self.current < self.border {
            self.border - self.current
        } else {
            (self.capacity() - self.current).min(self.available)
        };
        debug_assert!(self.is_consistent());
    }

    /// Length of the next line including its delimiter, counting across the
    /// physical end of the array.
    pub fn find_delimiter(&self, delimiter: u8) -> Option<usize> {
        debug_assert!(self.is_consistent());
        if self.current <= self.border {
            // Unread bytes are split: tail is border..end, head is start..current.
            if self.is_empty() {
                return None;
            }
            if let Some(index) = self.data[self.border..].find_byte(delimiter) {
                return Some(index + 1);
            }
            if let Some(index) = self.data[..self.current].find_byte(delimiter) {
                return Some(self.capacity() - self.border + index + 1);
            }
            None
        } else {
            self.data[self.border..self.current]
                .find_byte(delimiter)
                .map(|index| index + 1)
        }
    }

    /// Removes the next complete line; the returned bytes exclude the delimiter.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let len = self.find_delimiter(DELIMITER)?;
        let payload_len = len - 1;
        // Room for the delimiter so the caller can re-append it without growing.
        let mut line = Vec::with_capacity(len);
        if self.border + len > self.capacity() {
            let tail = self.capacity() - self.border;
            line.extend_from_slice(&self.data[self.border..]);
            line.extend_from_slice(&self.data[..payload_len - tail]);
            self.border = len - tail;
        } else {
            line.extend_from_slice(&self.data[self.border..self.border + payload_len]);
            self.border += len;
            if self.border == self.capacity() {
                self.border = 0;
            }
        }
        self.release(len);
        Some(line)
    }

    /// Drops bytes up to and including the next delimiter. Without a delimiter
    /// the whole unread region is dropped and `false` is returned: the line was
    /// not fully discarded and the rest arrives with later reads.
    pub fn discard_line(&mut self) -> bool {
        match self.find_delimiter(DELIMITER) {
            Some(len) => {
                self.border += len;
                if self.border >= self.capacity() {
                    self.border -= self.capacity();
                }
                self.release(len);
                true
            }
            None => {
                self.border = 0;
                self.current = 0;
                self.writable = self.capacity();
                self.available = self.capacity();
                debug_assert!(self.is_consistent());
                false
            }
        }
    }

    /// Runs the framing step after a read: finishes a pending purge, hands
    /// every complete line to `emit`, and starts a purge when the buffer is
    /// full with no delimiter in sight.
    pub fn extract(&mut self, mut emit: impl FnMut(Vec<u8>)) -> Extracted {
        let mut outcome = Extracted::default();
        if self.purging {
            if !self.discard_line() {
                return outcome;
            }
            self.purging = false;
            outcome.resynced = true;
        }

        while let Some(line) = self.take_line() {
            outcome.records += 1;
            emit(line);
        }

        if self.available == 0 {
            self.purging = true;
            outcome.overflowed = true;
            let found = self.discard_line();
            debug_assert!(!found, "full buffer without a line should have no delimiter");
        }
        outcome
    }

    fn release(&mut self, len: usize) {
        self.writable = if self.current < self.border {
            self.border - self.current
        } else {
            self.capacity() - self.current
        };
        self.available += len;
        debug_assert!(self.is_consistent());
    }

    fn is_consistent(&self) -> bool {
        let capacity = self.capacity();
        if self.current >= capacity || self.border >= capacity || self.writable > self.available {
            return false;
        }
        if self.current < self.border {
            self.writable == self.border - self.current && self.available == self.writable
        } else if self.current > self.border {
            self.writable == capacity - self.current
                && self.available == self.border + self.writable
        } else {
            (self.available == 0 || self.available == capacity)
                && (self.writable == 0 || self.writable == capacity - self.current)
        }
    }
}
