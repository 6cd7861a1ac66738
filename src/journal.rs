//! Append-only CSV journal file.
//!
//! Each row is one CSV record with no header. An append is written, flushed
//! and synced before it returns; a failed append truncates the file back to
//! the last committed length so a row is either fully durable or absent.
//! The file is locked exclusively while the journal is open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::ledger::StoreError;

pub struct Journal<R> {
    path: PathBuf,
    file: File,
    committed: u64,
    /// Set when a failed append could not be rolled back. The file length is
    /// then unknown and no further append is accepted.
    failed: bool,
    #[cfg(test)]
    fault: Option<Fault>,
    _row: PhantomData<fn(&R)>,
}

/// Write failures that tests can make the next appends hit.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Half of the row reaches the file, then the write fails.
    TornWrite,
    /// Like `TornWrite`, and truncating the torn bytes fails too.
    TornWriteStuck,
}

impl<R> Journal<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Open (or create) the journal at `path` and replay its rows.
    ///
    /// A trailing row without its terminating newline is a torn write from an
    /// interrupted append; it is dropped and the file truncated.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<R>), StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|e| {
            StoreError::Unavailable(format!(
                "{} is locked by another process: {e}",
                path.display()
            ))
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let valid = complete_len(&bytes);
        if valid < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid,
                "truncating torn journal tail"
            );
            file.set_len(valid as u64)?;
            file.sync_data()?;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(&bytes[..valid]);
        let mut rows = Vec::new();
        for (idx, result) in reader.deserialize::<R>().enumerate() {
            let row = result.map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                line: idx as u64 + 1,
                reason: e.to_string(),
            })?;
            rows.push(row);
        }

        let journal = Journal {
            path,
            file,
            committed: valid as u64,
            failed: false,
            #[cfg(test)]
            fault: None,
            _row: PhantomData,
        };
        Ok((journal, rows))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one row.
    pub fn append(&mut self, row: &R) -> Result<(), StoreError> {
        if self.failed {
            return Err(StoreError::Unavailable(format!(
                "{} failed to roll back a partial write; reopen to recover",
                self.path.display()
            )));
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .serialize(row)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode row: {e}")))?;
        let buf = writer
            .into_inner()
            .map_err(|e| StoreError::Unavailable(format!("failed to encode row: {e}")))?;

        if let Err(e) = self.write_synced(&buf) {
            // roll back whatever part of the row reached the file
            if let Err(rollback) = self.truncate_to_committed() {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial journal write; refusing further appends"
                );
                self.failed = true;
            }
            return Err(e.into());
        }

        self.committed += buf.len() as u64;
        Ok(())
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        {
            if self.fault.is_some() {
                self.file.write_all(&buf[..buf.len() / 2])?;
                return Err(io::Error::other("injected write failure"));
            }
        }
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    fn truncate_to_committed(&mut self) -> io::Result<()> {
        #[cfg(test)]
        {
            if self.fault == Some(Fault::TornWriteStuck) {
                return Err(io::Error::other("injected truncate failure"));
            }
        }
        self.file.set_len(self.committed)?;
        self.file.sync_data()
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: Option<Fault>) {
        self.fault = fault;
    }
}

/// Length of the prefix made of complete rows: up to the last record
/// terminator outside a quoted field. Quotes inside a field are doubled, so
/// the quote count alone tells whether a newline is part of a field.
fn complete_len(bytes: &[u8]) -> usize {
    let mut quoted = false;
    let mut len = 0;
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b'\n' if !quoted => len = idx + 1,
            _ => {}
        }
    }
    len
}
