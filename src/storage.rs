//! Durable per-node log storage.
//!
//! Each node owns one file: a fixed metadata page followed by fixed-size
//! entry slots. The fixed layout lets `persist` append just the newest
//! entries at a computed offset and lets a follower truncate by simply
//! rewriting the log length in the page. The price is a hard cap on the
//! command payload, acceptable because commands carry file metadata, not
//! file bodies.
//!
//! Layout, all integers little-endian u64:
//!
//! ```text
//! [page: 4096 B]  bytes 0..8 term, 8..16 voted_for, 16..24 log length
//! [slot: 128 B]   bytes 0..8 term, 8..16 command length, 16.. payload
//! [slot: 128 B]   ...
//! ```
//!
//! The sentinel entry at index 0 exists only in memory; the on-disk log
//! length counts real entries, so a metadata-only persist followed by a
//! crash restores cleanly.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use tokio::sync::oneshot;

use crate::machine::ApplyOutcome;

pub const PAGE_SIZE: usize = 4096;
pub const ENTRY_SIZE: usize = 128;
pub const ENTRY_HEADER: usize = 16;

/// Largest command payload one entry slot can hold.
pub const MAX_COMMAND: usize = ENTRY_SIZE - ENTRY_HEADER;

/// One in-memory log entry.
///
/// The `result` channel is the local waiter's one-shot rendezvous; it is
/// never replicated or persisted, and dropping it unread is fine (the
/// waiter sees the entry as discarded).
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
    pub result: Option<oneshot::Sender<ApplyOutcome>>,
}

impl LogEntry {
    /// The permanently-present entry at index 0.
    pub fn sentinel() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            command,
            result: None,
        }
    }
}

/// The append-only store backing one node's term, vote, and log.
pub struct LogStore {
    file: File,
    path: PathBuf,
}

impl LogStore {
    /// Open (or create) the store for the node with the given ID, creating
    /// the directory if needed. The file is named by the server ID so
    /// several nodes can share a directory in tests.
    pub fn open(dir: &Path, id: u64) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("node_{id}.raft"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Rewrite the metadata page and, when `write_log` is set, the last
    /// `n_new` entries (the whole log when `n_new` is 0). Reaches stable
    /// storage before returning; callers must not acknowledge an RPC until
    /// this has succeeded.
    pub fn persist(
        &mut self,
        term: u64,
        voted_for: u64,
        log: &[LogEntry],
        write_log: bool,
        mut n_new: usize,
    ) -> io::Result<()> {
        // The sentinel never hits the disk.
        let stored_len = log.len() - 1;
        if write_log && n_new == 0 {
            n_new = stored_len;
        }

        let mut page = [0u8; PAGE_SIZE];
        page[0..8].copy_from_slice(&term.to_le_bytes());
        page[8..16].copy_from_slice(&voted_for.to_le_bytes());
        page[16..24].copy_from_slice(&(stored_len as u64).to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&page)?;

        if write_log && n_new > 0 {
            let first = stored_len - n_new;
            self.file
                .seek(SeekFrom::Start((PAGE_SIZE + ENTRY_SIZE * first) as u64))?;

            let mut buf = Vec::with_capacity(n_new * ENTRY_SIZE);
            for entry in &log[1 + first..] {
                assert!(
                    entry.command.len() <= MAX_COMMAND,
                    "command of {} bytes reached the store, max is {}",
                    entry.command.len(),
                    MAX_COMMAND
                );
                let mut slot = [0u8; ENTRY_SIZE];
                slot[0..8].copy_from_slice(&entry.term.to_le_bytes());
                slot[8..16].copy_from_slice(&(entry.command.len() as u64).to_le_bytes());
                slot[ENTRY_HEADER..ENTRY_HEADER + entry.command.len()]
                    .copy_from_slice(&entry.command);
                buf.extend_from_slice(&slot);
            }
            self.file.write_all(&buf)?;
        }

        self.file.sync_all()?;
        debug!(
            "persisted {}: term={} voted_for={} log_len={} ({} new)",
            self.path.display(),
            term,
            voted_for,
            stored_len,
            n_new
        );
        Ok(())
    }

    /// Read back `(term, voted_for, log)`. An empty file yields the initial
    /// state: term 0, no vote, sentinel-only log. Corrupted slots are
    /// fail-stop.
    pub fn restore(&mut self) -> io::Result<(u64, u64, Vec<LogEntry>)> {
        self.file.seek(SeekFrom::Start(0))?;

        let mut page = [0u8; PAGE_SIZE];
        match self.file.read_exact(&mut page) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Ok((0, 0, vec![LogEntry::sentinel()]));
            }
            Err(err) => return Err(err),
        }

        let term = u64::from_le_bytes(page[0..8].try_into().unwrap());
        let voted_for = u64::from_le_bytes(page[8..16].try_into().unwrap());
        let stored_len = u64::from_le_bytes(page[16..24].try_into().unwrap());

        let mut log = Vec::with_capacity(stored_len as usize + 1);
        log.push(LogEntry::sentinel());

        for i in 0..stored_len {
            let mut slot = [0u8; ENTRY_SIZE];
            self.file.read_exact(&mut slot)?;

            let entry_term = u64::from_le_bytes(slot[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(slot[8..16].try_into().unwrap()) as usize;
            assert!(
                len <= MAX_COMMAND,
                "corrupted entry slot {} in {}: command length {}",
                i,
                self.path.display(),
                len
            );
            log.push(LogEntry::new(
                entry_term,
                slot[ENTRY_HEADER..ENTRY_HEADER + len].to_vec(),
            ));
        }

        debug!(
            "restored {}: term={} voted_for={} log_len={}",
            self.path.display(),
            term,
            voted_for,
            stored_len
        );
        Ok((term, voted_for, log))
    }
}
