// On-disk spool of undelivered records: one append handle, one replay handle, same file.
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::error::Error;
use crate::core::record::{Record, DELIMITER};

/// Records are stored in wire form, one per line, oldest first. The file is
/// truncated once every line has been replayed.
#[derive(Debug)]
pub struct Backlog {
    path: PathBuf,
    append: Option<File>,
    replay: Option<BufReader<File>>,
}

impl Backlog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: None,
            replay: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails unless the backlog file can be opened for appending.
    pub fn check_writable(&self) -> Result<(), Error> {
        self.open_append().map(drop).map_err(|err| {
            Error::from_io(err)
                .with_message("backlog file is not writable")
                .with_path(&self.path)
                .with_hint("Pass a writable location with --backlog.")
        })
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    pub fn is_appending(&self) -> bool {
        self.append.is_some()
    }

    /// Startup step: if a previous run left records behind, start replaying
    /// and return the oldest one.
    pub fn resume(&mut self) -> Result<Option<Record>, Error> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::from_io(err)
                    .with_message("cannot read backlog")
                    .with_path(&self.path));
            }
        };
        self.replay = Some(BufReader::new(file));
        match self.next_record() {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => {
                self.replay = None;
                Ok(None)
            }
            Err(err) => {
                self.replay = None;
                Err(Error::from_io(err)
                    .with_message("cannot read backlog")
                    .with_path(&self.path))
            }
        }
    }

    /// Opens both handles for a fresh spooling episode.
    pub fn begin(&mut self) -> io::Result<()> {
        self.ensure_append()?;
        if self.replay.is_none() {
            self.replay = Some(BufReader::new(File::open(&self.path)?));
        }
        Ok(())
    }

    pub fn ensure_append(&mut self) -> io::Result<()> {
        if self.append.is_none() {
            self.append = Some(self.open_append()?);
        }
        Ok(())
    }

    /// Appends one record; it is on disk (not buffered) when this returns.
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        let Some(file) = self.append.as_mut() else {
            return Err(io::Error::other("backlog is not open for appending"));
        };
        file.write_all(record.wire())?;
        file.flush()
    }

    /// Next spooled record, or `None` once everything appended so far was read.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        let Some(reader) = self.replay.as_mut() else {
            return Ok(None);
        };
        let mut line = Vec::new();
        if reader.read_until(DELIMITER, &mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(Record::from_line(line)))
    }

    /// Closes the append handle; replay continues.
    pub fn stop_appending(&mut self) {
        self.append = None;
    }

    /// Everything was replayed: close both handles and empty the file.
    pub fn finish(&mut self) -> io::Result<()> {
        self.close();
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map(drop)
    }

    /// Closes both handles and leaves the file as is.
    pub fn close(&mut self) {
        self.append = None;
        self.replay = None;
    }

    fn open_append(&self) -> io::Result<File> {
        OpenOptions::new().append(true).create(true).open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::Backlog;
    use crate::core::record::Record;

    fn payload(record: Option<Record>) -> Option<Vec<u8>> {
        record.map(|record| record.payload().to_vec())
    }

    #[test]
    fn resume_on_missing_or_empty_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.backlog");
        let mut backlog = Backlog::new(&path);
        assert!(backlog.resume().expect("resume").is_none());

        std::fs::write(&path, b"").expect("write");
        assert!(backlog.resume().expect("resume").is_none());
        assert!(!backlog.is_replaying());
    }

    #[test]
    fn resume_returns_oldest_and_replays_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.backlog");
        std::fs::write(&path, b"one\ntwo\nthree\n").expect("write");

        let mut backlog = Backlog::new(&path);
        assert_eq!(payload(backlog.resume().expect("resume")), Some(b"one".to_vec()));
        assert!(backlog.is_replaying());
        assert_eq!(payload(backlog.next_record().expect("next")), Some(b"two".to_vec()));
        assert_eq!(payload(backlog.next_record().expect("next")), Some(b"three".to_vec()));
        assert_eq!(backlog.next_record().expect("next"), None);

        backlog.finish().expect("finish");
        assert!(!backlog.is_replaying());
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 0);
    }

    #[test]
    fn appended_records_become_visible_to_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.backlog");
        let mut backlog = Backlog::new(&path);
        backlog.check_writable().expect("writable");

        backlog.begin().expect("begin");
        assert!(backlog.is_appending());
        backlog.append(&Record::from_payload(b"first")).expect("append");
        assert_eq!(payload(backlog.next_record().expect("next")), Some(b"first".to_vec()));
        assert_eq!(backlog.next_record().expect("next"), None);

        backlog.append(&Record::from_payload(b"second")).expect("append");
        assert_eq!(payload(backlog.next_record().expect("next")), Some(b"second".to_vec()));
    }

    #[test]
    fn unterminated_last_line_is_still_a_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.backlog");
        std::fs::write(&path, b"whole\ntorn").expect("write");

        let mut backlog = Backlog::new(&path);
        assert_eq!(payload(backlog.resume().expect("resume")), Some(b"whole".to_vec()));
        assert_eq!(payload(backlog.next_record().expect("next")), Some(b"torn".to_vec()));
    }

    #[test]
    fn unwritable_location_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backlog = Backlog::new(dir.path().join("missing").join("relay.backlog"));
        let err = backlog.check_writable().expect_err("should fail");
        assert!(err.path().is_some());
        assert!(err.hint().is_some());
    }

    #[test]
    fn append_without_begin_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut backlog = Backlog::new(dir.path().join("relay.backlog"));
        assert!(backlog.append(&Record::from_payload(b"x")).is_err());
    }
}
