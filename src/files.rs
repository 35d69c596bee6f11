//! The file-metadata state machine.
//!
//! Committed commands mutate an in-memory map from logical path to file
//! record. File bodies are not replicated: the ingest node stages content
//! into its local [`ContentStore`] before the metadata command goes through
//! consensus, so the cluster offers replicated metadata with single-copy
//! content.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;

use crate::machine::{ApplyOutcome, MachineError, StateMachine};

const TAG_CREATE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_RENAME: u8 = 3;

/// A replicated file operation.
///
/// Wire format: a 1-byte tag, then three length-prefixed strings (path,
/// old path, new path; each prefixed by a little-endian u64 length), then
/// a little-endian u64 size. Fields a variant does not use are encoded as
/// empty strings and zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCommand {
    Create { path: String, size: u64 },
    Delete { path: String },
    Rename { old_path: String, new_path: String, size: u64 },
}

impl FileCommand {
    pub fn encode(&self) -> Vec<u8> {
        let (tag, path, old_path, new_path, size) = match self {
            FileCommand::Create { path, size } => (TAG_CREATE, path.as_str(), "", "", *size),
            FileCommand::Delete { path } => (TAG_DELETE, path.as_str(), "", "", 0),
            FileCommand::Rename {
                old_path,
                new_path,
                size,
            } => (TAG_RENAME, "", old_path.as_str(), new_path.as_str(), *size),
        };

        let mut buf = vec![tag];
        for s in [path, old_path, new_path] {
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        buf.extend_from_slice(&size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MachineError> {
        let (&tag, mut rest) = buf
            .split_first()
            .ok_or_else(|| MachineError::Malformed("empty command".into()))?;

        let mut strings = Vec::with_capacity(3);
        for _ in 0..3 {
            let len = take_u64(&mut rest)? as usize;
            if rest.len() < len {
                return Err(MachineError::Malformed("string runs past the end".into()));
            }
            let (raw, tail) = rest.split_at(len);
            strings.push(
                std::str::from_utf8(raw)
                    .map_err(|e| MachineError::Malformed(e.to_string()))?
                    .to_string(),
            );
            rest = tail;
        }
        let size = take_u64(&mut rest)?;

        let new_path = strings.pop().unwrap();
        let old_path = strings.pop().unwrap();
        let path = strings.pop().unwrap();

        match tag {
            TAG_CREATE => Ok(FileCommand::Create { path, size }),
            TAG_DELETE => Ok(FileCommand::Delete { path }),
            TAG_RENAME => Ok(FileCommand::Rename {
                old_path,
                new_path,
                size,
            }),
            other => Err(MachineError::UnknownCommand(other)),
        }
    }
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, MachineError> {
    if rest.len() < 8 {
        return Err(MachineError::Malformed("truncated integer".into()));
    }
    let (raw, tail) = rest.split_at(8);
    *rest = tail;
    Ok(u64::from_le_bytes(raw.try_into().unwrap()))
}

/// Metadata for one logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Local storage for file bodies, rooted in one node's data directory.
///
/// Only the node that ingested a file holds its content; apply-time
/// removes and renames are best-effort because every other replica sees
/// the same commands without the bytes.
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    fn new(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Write a file body before its create command is replicated.
    pub fn stage(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(self.local_path(name)?, bytes)
    }

    /// The staged body, or `None` if this node never ingested it.
    pub fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.local_path(name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match std::fs::remove_file(self.local_path(name)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        match std::fs::rename(self.local_path(old)?, self.local_path(new)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    // Only the final path component is honored so a logical path can never
    // escape the data directory.
    fn local_path(&self, name: &str) -> io::Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("bad name {name:?}")))?;
        Ok(self.dir.join(file_name))
    }
}

/// The concrete state machine fed to the consensus core: path → record,
/// plus the node-local content store.
pub struct FileMachine {
    files: RwLock<HashMap<String, FileRecord>>,
    content: ContentStore,
}

impl FileMachine {
    pub fn new(data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            files: RwLock::new(HashMap::new()),
            content: ContentStore::new(data_dir.into())?,
        })
    }

    /// All records, ordered by name. Safe to call while the applier runs.
    pub fn list(&self) -> Vec<FileRecord> {
        let mut records: Vec<_> = self.files.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn stat(&self, path: &str) -> Option<FileRecord> {
        self.files.read().get(path).cloned()
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }
}

impl StateMachine for FileMachine {
    fn apply(&self, command: &[u8]) -> ApplyOutcome {
        match FileCommand::decode(command)? {
            FileCommand::Create { path, size } => {
                debug!("create {path} ({size} bytes)");
                self.files.write().insert(
                    path.clone(),
                    FileRecord {
                        name: path,
                        size,
                        last_modified: Utc::now(),
                    },
                );
            }
            FileCommand::Delete { path } => {
                debug!("delete {path}");
                // Deleting a path that was never created is not an error.
                self.files.write().remove(&path);
                self.content
                    .remove(&path)
                    .map_err(|e| MachineError::Io(e.to_string()))?;
            }
            FileCommand::Rename {
                old_path,
                new_path,
                size,
            } => {
                debug!("rename {old_path} -> {new_path}");
                let mut files = self.files.write();
                files.remove(&old_path);
                files.insert(
                    new_path.clone(),
                    FileRecord {
                        name: new_path.clone(),
                        size,
                        last_modified: Utc::now(),
                    },
                );
                drop(files);
                self.content
                    .rename(&old_path, &new_path)
                    .map_err(|e| MachineError::Io(e.to_string()))?;
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn commands_round_trip() {
        let commands = [
            FileCommand::Create {
                path: "docs/a.txt".into(),
                size: 42,
            },
            FileCommand::Delete {
                path: "docs/a.txt".into(),
            },
            FileCommand::Rename {
                old_path: "a.txt".into(),
                new_path: "b.txt".into(),
                size: 7,
            },
        ];
        for cmd in commands {
            let decoded = FileCommand::decode(&cmd.encode()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut buf = FileCommand::Delete { path: "x".into() }.encode();
        buf[0] = 9;
        assert_eq!(
            FileCommand::decode(&buf),
            Err(MachineError::UnknownCommand(9))
        );
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let buf = FileCommand::Create {
            path: "x".into(),
            size: 1,
        }
        .encode();
        assert!(matches!(
            FileCommand::decode(&buf[..buf.len() - 3]),
            Err(MachineError::Malformed(_))
        ));
        assert!(matches!(
            FileCommand::decode(&[]),
            Err(MachineError::Malformed(_))
        ));
    }

    #[test]
    fn create_and_stat() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        let cmd = FileCommand::Create {
            path: "a.txt".into(),
            size: 10,
        };
        machine.apply(&cmd.encode()).unwrap();

        let record = machine.stat("a.txt").unwrap();
        assert_eq!(record.size, 10);
        assert_eq!(machine.list().len(), 1);
    }

    #[test]
    fn create_replaces_existing_record() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        for size in [10, 20] {
            let cmd = FileCommand::Create {
                path: "a.txt".into(),
                size,
            };
            machine.apply(&cmd.encode()).unwrap();
        }
        assert_eq!(machine.stat("a.txt").unwrap().size, 20);
        assert_eq!(machine.list().len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        let cmd = FileCommand::Delete {
            path: "missing".into(),
        };
        machine.apply(&cmd.encode()).unwrap();
        assert!(machine.list().is_empty());
    }

    #[test]
    fn rename_moves_record_and_content() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        machine.content().stage("a.txt", b"hello").unwrap();
        machine
            .apply(
                &FileCommand::Create {
                    path: "a.txt".into(),
                    size: 5,
                }
                .encode(),
            )
            .unwrap();
        machine
            .apply(
                &FileCommand::Rename {
                    old_path: "a.txt".into(),
                    new_path: "b.txt".into(),
                    size: 5,
                }
                .encode(),
            )
            .unwrap();

        assert!(machine.stat("a.txt").is_none());
        assert_eq!(machine.stat("b.txt").unwrap().size, 5);
        assert_eq!(machine.content().read("b.txt").unwrap().unwrap(), b"hello");
        assert_eq!(machine.content().read("a.txt").unwrap(), None);
    }

    #[test]
    fn delete_drops_local_content() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        machine.content().stage("a.txt", b"hello").unwrap();
        machine
            .apply(
                &FileCommand::Create {
                    path: "a.txt".into(),
                    size: 5,
                }
                .encode(),
            )
            .unwrap();
        machine
            .apply(&FileCommand::Delete { path: "a.txt".into() }.encode())
            .unwrap();

        assert!(machine.stat("a.txt").is_none());
        assert_eq!(machine.content().read("a.txt").unwrap(), None);
    }

    #[test]
    fn unknown_command_surfaces_as_error() {
        let dir = TempDir::new().unwrap();
        let machine = FileMachine::new(dir.path()).unwrap();

        let mut buf = FileCommand::Delete { path: "x".into() }.encode();
        buf[0] = 7;
        assert_eq!(machine.apply(&buf), Err(MachineError::UnknownCommand(7)));
    }
}
