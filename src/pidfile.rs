//! Purpose: Single-instance guard backed by a locked pidfile.
//! Exports: `Pidfile`.
//! Role: Acquired once at startup by the binary, released on drop.
//! Invariants: While held, the file contains our pid and carries an exclusive advisory lock.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use relaybuf::api::{Error, ErrorKind};

#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    file: File,
}

impl Pidfile {
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                Error::from_io(err)
                    .with_message("cannot open pidfile")
                    .with_path(path)
            })?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("another instance holds the pidfile")
                .with_path(path)
                .with_source(err));
        }

        let mut existing = String::new();
        file.read_to_string(&mut existing).map_err(|err| {
            Error::from_io(err)
                .with_message("cannot read pidfile")
                .with_path(path)
        })?;
        if let Some(pid) = parse_pid(&existing) {
            if pid != std::process::id() as libc::pid_t && process_alive(pid) {
                return Err(Error::new(ErrorKind::Busy)
                    .with_message(format!("process {pid} named in pidfile is still running"))
                    .with_path(path)
                    .with_hint("Stop the running instance or pass a different --pidfile."));
            }
            tracing::info!(pid, path = %path.display(), "replacing stale pidfile");
        }

        write_pid(&mut file).map_err(|err| {
            Error::from_io(err)
                .with_message("cannot write pidfile")
                .with_path(path)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "removing pidfile failed");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

fn parse_pid(contents: &str) -> Option<libc::pid_t> {
    contents
        .trim()
        .parse::<libc::pid_t>()
        .ok()
        .filter(|pid| *pid > 0)
}

// Signal 0 only checks existence; EPERM still means someone owns that pid.
fn process_alive(pid: libc::pid_t) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}
