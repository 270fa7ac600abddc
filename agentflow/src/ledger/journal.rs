//! JSON-lines journal backing a durable ledger.

use super::entry::SideEffectEntry;
use crate::errors::CompensationError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only file of ledger entries, one JSON object per line.
#[derive(Debug)]
pub struct LedgerJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl LedgerJournal {
    /// Opens (or creates) the journal and returns the entries already in it.
    ///
    /// A torn final line from an interrupted write is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a complete line is
    /// not a valid entry.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<SideEffectEntry>), CompensationError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(journal_err)?;
        }

        let entries = if path.exists() {
            read_entries(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(journal_err)?;

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            entries,
        ))
    }

    /// The journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn append(&self, entry: &SideEffectEntry) -> Result<(), CompensationError> {
        let mut line = serde_json::to_vec(entry).map_err(journal_err)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line).map_err(journal_err)?;
        file.flush().map_err(journal_err)
    }
}

fn read_entries(path: &Path) -> Result<Vec<SideEffectEntry>, CompensationError> {
    let reader = BufReader::new(File::open(path).map_err(journal_err)?);
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .map_err(journal_err)?;
    let last = lines.len().saturating_sub(1);

    let mut entries = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SideEffectEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if idx == last => {
                warn!(path = %path.display(), error = %e, "Skipping torn journal tail");
            }
            Err(e) => {
                return Err(CompensationError::Journal(format!(
                    "{}:{}: {e}",
                    path.display(),
                    idx + 1
                )))
            }
        }
    }
    Ok(entries)
}

fn journal_err(e: impl std::fmt::Display) -> CompensationError {
    CompensationError::Journal(e.to_string())
}
