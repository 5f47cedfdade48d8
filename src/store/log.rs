//! Append-only commit log.
//!
//! One JSON line per committed unit of work. Replay applies the lines in
//! order; a trailing line without its newline is a torn write from a crash
//! and gets truncated away. A failed append is cut back off the file before
//! the error is returned, so the log only ever holds committed records.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::StoreError;
use crate::model::{Account, Transaction};

/// Rows written by one committed unit of work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub accounts: Vec<Account>,
    pub transactions: Vec<Transaction>,
}

impl CommitRecord {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.transactions.is_empty()
    }
}

pub(crate) struct CommitLog {
    path: PathBuf,
    file: File,
    sync: bool,
    /// Length of the file up to the last committed record.
    len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl CommitLog {
    /// Open (or create) the log at `path` and return the records it holds.
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Vec<CommitRecord>), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)?;

        let mut records = Vec::new();
        let mut valid_len = 0usize;
        for (idx, line) in raw.split_inclusive('\n').enumerate() {
            if !line.ends_with('\n') {
                warn!(
                    path = %path.display(),
                    bytes = line.len(),
                    "truncating torn commit log tail"
                );
                file.set_len(valid_len as u64)?;
                break;
            }
            let record = serde_json::from_str(line.trim_end()).map_err(|source| {
                StoreError::Corrupt {
                    line: idx + 1,
                    source,
                }
            })?;
            records.push(record);
            valid_len += line.len();
        }

        info!(path = %path.display(), records = records.len(), "commit log opened");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                sync,
                len: valid_len as u64,
                poisoned: false,
                #[cfg(test)]
                fail_after: None,
            },
            records,
        ))
    }

    /// Append one record. On failure the file is truncated back to the last
    /// committed record; if that fails too the log refuses further appends.
    pub fn append(&mut self, record: &CommitRecord) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::LogPoisoned);
        }
        let mut line = serde_json::to_vec(record).map_err(StoreError::Encode)?;
        line.push(b'\n');

        if let Err(e) = self.write_line(&line) {
            if let Err(rollback) = self.rollback() {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back commit log, refusing further commits"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&line[..limit.min(line.len())])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(line)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> io::Result<()> {
        self.file.set_len(self.len)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Make the next append write only `bytes` bytes and then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&mut self, bytes: usize) {
        self.fail_after = Some(bytes);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::model::AccountId;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn record(id: i64, balance: i64) -> CommitRecord {
        let now = Utc::now();
        CommitRecord {
            accounts: vec![Account {
                id: AccountId::new(id).unwrap(),
                balance: Amount::from_int(balance),
                created_at: now,
                updated_at: now,
            }],
            transactions: Vec::new(),
        }
    }

    #[test]
    fn appended_records_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");

        let (mut log, replayed) = CommitLog::open(&path, true).unwrap();
        assert!(replayed.is_empty());
        log.append(&record(1, 10)).unwrap();
        log.append(&record(1, 7)).unwrap();
        drop(log);

        let (_, replayed) = CommitLog::open(&path, false).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].accounts[0].balance, Amount::from_int(7));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");

        let (mut log, _) = CommitLog::open(&path, false).unwrap();
        log.append(&record(1, 10)).unwrap();
        drop(log);
        let intact = fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"accounts\":[{\"id\":").unwrap();
        drop(file);

        let (_, replayed) = CommitLog::open(&path, false).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn failed_append_leaves_no_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");

        let (mut log, _) = CommitLog::open(&path, true).unwrap();
        log.append(&record(1, 10)).unwrap();
        let intact = fs::metadata(&path).unwrap().len();

        log.fail_next_append(20);
        let err = log.append(&record(2, 20)).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        log.append(&record(3, 30)).unwrap();
        drop(log);

        let (_, replayed) = CommitLog::open(&path, false).unwrap();
        let ids: Vec<i64> = replayed.iter().map(|r| r.accounts[0].id.get()).collect();
        assert_eq!(ids, [1, 3]);
    }

    #[test]
    fn failed_rollback_poisons_the_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");

        let (mut log, _) = CommitLog::open(&path, false).unwrap();
        log.append(&record(1, 10)).unwrap();

        // Neither the write nor the truncate can succeed on a read-only handle.
        log.file = File::open(&path).unwrap();
        assert!(matches!(log.append(&record(2, 20)), Err(StoreError::Io(_))));
        assert!(matches!(log.append(&record(3, 30)), Err(StoreError::LogPoisoned)));

        drop(log);
        let (_, replayed) = CommitLog::open(&path, false).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn corrupt_interior_line_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.log");
        fs::write(&path, "not json\n").unwrap();

        let err = CommitLog::open(&path, false).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
