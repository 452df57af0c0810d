//! Job log sink writing to stderr or a file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, instrument};

use super::LogSink;

/// Writes every output line followed by a newline.
pub struct LogWriter {
    out: Box<dyn Write + Send>,
}

impl LogWriter {
    /// Writes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::from_writer(io::stderr())
    }

    /// Appends to `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    #[instrument]
    pub fn file(path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Log file opened");
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Wraps any writer.
    pub fn from_writer(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    /// Flushes buffered lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying writer fails.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl LogSink for LogWriter {
    fn write(&mut self, line: &str) -> io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}
