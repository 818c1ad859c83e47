// Newline-delimited record value plus the NUL sanitation policy shared by all sources.
use std::fmt;

use bstr::ByteSlice;

pub const DELIMITER: u8 = b'\n';

/// One message unit. Stored in wire form (payload followed by `\n`) so the
/// delivery path and the backlog can write it without copying.
#[derive(Clone, Eq, PartialEq)]
pub struct Record {
    wire: Vec<u8>,
}

impl Record {
    /// Builds a record from payload bytes; a trailing delimiter is not part of
    /// the payload and is dropped if present.
    pub fn from_payload(payload: &[u8]) -> Self {
        let payload = payload.strip_suffix(&[DELIMITER]).unwrap_or(payload);
        let mut wire = Vec::with_capacity(payload.len() + 1);
        wire.extend_from_slice(payload);
        wire.push(DELIMITER);
        Self { wire }
    }

    /// Takes ownership of a line buffer that may or may not end in `\n`.
    pub fn from_line(mut line: Vec<u8>) -> Self {
        if line.last() != Some(&DELIMITER) {
            line.push(DELIMITER);
        }
        Self { wire: line }
    }

    pub fn payload(&self) -> &[u8] {
        &self.wire[..self.wire.len() - 1]
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({:?})", self.payload().as_bstr())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NulCheck {
    Clean,
    /// Only trailing NULs were present; the payload should be cut to this length.
    Trimmed(usize),
    /// A NUL is followed by other bytes; the record must be dropped.
    Embedded,
}

pub fn check_nul(payload: &[u8]) -> NulCheck {
    let Some(first) = payload.find_byte(0) else {
        return NulCheck::Clean;
    };
    if payload[first..].iter().all(|byte| *byte == 0) {
        NulCheck::Trimmed(first)
    } else {
        NulCheck::Embedded
    }
}

/// Applies the NUL policy to a received line; `None` means it was discarded.
pub fn sanitize(mut line: Vec<u8>) -> Option<Record> {
    match check_nul(&line) {
        NulCheck::Clean => Some(Record::from_line(line)),
        NulCheck::Trimmed(len) => {
            tracing::warn!("record has trailing NUL bytes, trimmed");
            line.truncate(len);
            Some(Record::from_line(line))
        }
        NulCheck::Embedded => {
            tracing::warn!(
                record = %line.as_bstr(),
                "record contains embedded NUL bytes, discarded"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{check_nul, sanitize, NulCheck, Record};

    #[test]
    fn payload_excludes_delimiter() {
        let record = Record::from_payload(b"hello\n");
        assert_eq!(record.payload(), b"hello");
        assert_eq!(record.wire(), b"hello\n");

        let record = Record::from_line(b"bare".to_vec());
        assert_eq!(record.wire(), b"bare\n");
        assert_eq!(record.wire_len(), 5);
    }

    #[test]
    fn empty_payload_is_a_valid_record() {
        let record = Record::from_payload(b"");
        assert_eq!(record.payload(), b"");
        assert_eq!(record.wire(), b"\n");
    }

    #[test]
    fn nul_policy_distinguishes_trailing_and_embedded() {
        assert_eq!(check_nul(b"abc"), NulCheck::Clean);
        assert_eq!(check_nul(b"abc\0\0"), NulCheck::Trimmed(3));
        assert_eq!(check_nul(b"\0"), NulCheck::Trimmed(0));
        assert_eq!(check_nul(b"ab\0c"), NulCheck::Embedded);
    }

    #[test]
    fn sanitize_trims_or_discards() {
        assert_eq!(sanitize(b"abc\0".to_vec()).unwrap().payload(), b"abc");
        assert_eq!(sanitize(b"abc\n\0\0".to_vec()).unwrap().payload(), b"abc");
        assert!(sanitize(b"a\0b".to_vec()).is_none());
        assert_eq!(sanitize(b"plain".to_vec()).unwrap().payload(), b"plain");
    }
}
