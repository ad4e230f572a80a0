//! Shared append-only log writer for the logging modules

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{ProxyError, ProxyResult};

/// Buffered line writer over an append-only file
///
/// Lines are flushed as they are written; the pipeline's logging stage
/// is the only writer, so contention on the mutex is between request
/// tasks only.
#[derive(Debug)]
pub(crate) struct LineWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl LineWriter {
    /// Open (or create) the file in append mode
    pub fn open(path: &Path) -> ProxyResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                ProxyError::config(format!("cannot open log file {}: {e}", path.display()))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one line
    pub fn write_line(&self, line: &str) -> ProxyResult<()> {
        let mut file = self.file.lock();
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|e| {
                ProxyError::network_io(format!("writing log file {}", self.path.display()), e)
            })
    }

    /// Flush buffered output
    pub fn flush(&self) -> ProxyResult<()> {
        self.file.lock().flush().map_err(|e| {
            ProxyError::network_io(format!("flushing log file {}", self.path.display()), e)
        })
    }
}

/// Seconds since the Unix epoch, for log timestamps
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
