//! The dependency database: a line-oriented journal kept next to each
//! target (`<target>.d`).
//!
//! A record is a sequence of lines terminated by one empty line. On
//! reopening, the rule reads its lines back one by one comparing each
//! with the value it would write now; the first mismatch truncates the
//! file at that point and switches to writing. A missing terminator
//! (interrupted write) poisons the whole record. The file's mtime must
//! not exceed the target's for the target to be considered up to date,
//! so the db is only touched when something actually changed.

use std::{
    fs,
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

use crate::{
    diag::{self, Error},
    target::{MTIME_NONEXISTENT, file_mtime},
};

enum State {
    /// Comparing against the previous record.
    Read { reader: BufReader<fs::File>, pos: u64 },
    /// The previous record diverged (or ran out); all further lines are
    /// written.
    Write { file: fs::File },
}

pub struct DepDb {
    path: PathBuf,
    state: State,
    /// True if the db was (re)written and therefore touched on close.
    changed: bool,
    /// Mtime of the db file as found on open.
    mtime: u64,
}

impl DepDb {
    /// Open (creating if necessary) the database for this target path.
    pub fn open(db_path: PathBuf) -> diag::Result<Self> {
        let mtime = file_mtime(&db_path);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)
            .map_err(|e| Error::resource(format!("cannot open {}: {e}", db_path.display())))?;

        let mut db = Self {
            path: db_path,
            state: State::Read { reader: BufReader::new(file), pos: 0 },
            changed: false,
            mtime,
        };

        // An interrupted write (no empty-line terminator) forces
        // regeneration from the start.
        if !db.has_terminator()? {
            db.invalidate(0)?;
        }
        Ok(db)
    }

    fn has_terminator(&mut self) -> diag::Result<bool> {
        let State::Read { reader, .. } = &mut self.state else { return Ok(true) };
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(content.is_empty() || content.ends_with("\n\n"))
    }

    pub fn writing(&self) -> bool {
        matches!(self.state, State::Write { .. })
    }

    /// Read the next line of the previous record; `None` once exhausted
    /// (or after switching to write mode).
    pub fn read(&mut self) -> diag::Result<Option<String>> {
        let State::Read { reader, pos } = &mut self.state else { return Ok(None) };
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        *pos += n as u64;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            // Hit the record terminator: the previous record had fewer
            // lines than the rule now expects.
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Compare the expected line with the stored one; on mismatch switch
    /// to writing (truncating the tail) and record the new line. Returns
    /// true if the line matched (the record is still valid so far).
    pub fn expect(&mut self, value: &str) -> diag::Result<bool> {
        if let State::Read { pos, .. } = &self.state {
            let start = *pos;
            match self.read()? {
                Some(line) if line == value => return Ok(true),
                _ => {
                    self.invalidate(start)?;
                    self.write(value)?;
                    return Ok(false);
                }
            }
        }
        self.write(value)?;
        Ok(false)
    }

    /// Truncate at `pos` and switch to write mode.
    fn invalidate(&mut self, pos: u64) -> diag::Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::resource(format!("cannot reopen {}: {e}", self.path.display())))?;
        file.set_len(pos)?;
        let mut file = file;
        file.seek(SeekFrom::Start(pos))?;
        self.state = State::Write { file };
        self.changed = true;
        Ok(())
    }

    /// Append a line (write mode only; a no-op match otherwise).
    pub fn write(&mut self, value: &str) -> diag::Result<()> {
        match &mut self.state {
            State::Write { file } => {
                file.write_all(value.as_bytes())?;
                file.write_all(b"\n")?;
                self.changed = true;
                Ok(())
            }
            State::Read { .. } => {
                // Writing without a preceding mismatch means the caller
                // skipped comparison; force the switch.
                let State::Read { pos, .. } = &self.state else { unreachable!() };
                let pos = *pos;
                self.invalidate(pos)?;
                self.write(value)
            }
        }
    }

    /// True if the stored record is outdated relative to the target: the
    /// record changed, or the db file is newer than the target itself.
    pub fn outdated(&self, target_mtime: u64) -> bool {
        self.changed || target_mtime == MTIME_NONEXISTENT || self.mtime > target_mtime
    }

    /// Finish the record: write the empty-line terminator if anything
    /// changed and flush.
    pub fn close(mut self) -> diag::Result<()> {
        if let State::Write { file } = &mut self.state {
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Hex-rendered SHA-256 of a list of strings, used for option and input
/// set identity.
pub fn checksum<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut h = Sha256::new();
    for p in parts {
        h.update(p.as_ref());
        h.update([0u8]);
    }
    hex(&h.finalize())
}

/// Hex-rendered SHA-256 of a file's contents; empty string if the file
/// cannot be read.
pub fn file_checksum(path: &Path) -> String {
    let Ok(mut f) = fs::File::open(path) else { return String::new() };
    let mut h = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => h.update(&buf[..n]),
            Err(_) => return String::new(),
        }
    }
    hex(&h.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
