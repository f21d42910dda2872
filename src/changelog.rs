// Change-log records: the incremental-update counterpart to a full scrub,
// feeding the pipeline's GET_FID stage (spec.md §4.4, "a reference to the
// change-log record, if any, to be acknowledged after DB_APPLY").

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::EntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangelogEvent {
    Create,
    Unlink,
    Rename,
    SetAttr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub record_id: u64,
    pub event: ChangelogEvent,
    pub id: EntryId,
    pub fullpath: Option<String>,
}

/// Anything that can hand the pipeline a stream of records and later be
/// told which ones have been durably applied. A file-backed JSON-lines
/// source is the concrete implementation; a real deployment's kernel/fs
/// changelog reader would implement the same trait.
pub trait ChangelogSource: Send {
    fn next_record(&mut self) -> Result<Option<ChangelogRecord>>;

    /// Acknowledges that every record up to and including `record_id` has
    /// been applied and need not be replayed.
    fn ack(&mut self, record_id: u64) -> Result<()>;
}

/// Reads newline-delimited JSON `ChangelogRecord`s from a file. Acking is a
/// no-op beyond bookkeeping the high-water mark -- a full deployment would
/// persist it so a restart resumes past already-applied records.
pub struct FileChangelogSource {
    lines: std::io::Lines<BufReader<File>>,
    last_acked: u64,
}

impl FileChangelogSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(FileChangelogSource { lines: BufReader::new(file).lines(), last_acked: 0 })
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }
}

impl ChangelogSource for FileChangelogSource {
    fn next_record(&mut self) -> Result<Option<ChangelogRecord>> {
        loop {
            match self.lines.next() {
                None => return Ok(None),
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: ChangelogRecord = serde_json::from_str(&line)?;
                    return Ok(Some(record));
                }
            }
        }
    }

    fn ack(&mut self, record_id: u64) -> Result<()> {
        if record_id > self.last_acked {
            self.last_acked = record_id;
        }
        Ok(())
    }
}
