//! Buffered record log
//!
//! Records are appended to a JSON Lines file in batches. When requested, the
//! file is rewritten as a single JSON array once logging finishes.

use log::{debug, error, info, warn};
use serde::{Serialize, de::DeserializeOwned};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::SpmError;
use crate::types::ScanSample;

/// Consecutive failed flushes tolerated before an error is returned
const MAX_FLUSH_FAILURES: usize = 10;

pub type SampleLogger = Logger<ScanSample>;

#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    finalized: bool,
}

impl<T> Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    /// The extension is forced to `.json` or `.jsonl` to match the final format
    pub fn new<P: Into<PathBuf>>(
        file_path: P,
        buffer_size: usize,
        final_format_json: bool,
    ) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, record: T) -> Result<(), SpmError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append buffered records to the file
    ///
    /// Transient failures keep the records buffered for the next attempt;
    /// only repeated failures are reported as errors.
    pub fn flush(&mut self) -> Result<(), SpmError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                debug!("Flushed {} records to {:?}", self.buffer.len(), self.file_path);
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures, MAX_FLUSH_FAILURES, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures, MAX_FLUSH_FAILURES
                    );
                }
                if self.flush_failures >= MAX_FLUSH_FAILURES {
                    return Err(SpmError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "{} consecutive flush failures for {:?}",
                            MAX_FLUSH_FAILURES, self.file_path
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), SpmError> {
        let io_error = |source| SpmError::Io {
            source,
            context: format!("writing {:?}", self.file_path),
        };

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(io_error)?;

        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{line}").map_err(io_error)?;
        }
        writer.flush().map_err(io_error)
    }

    /// Flush, then rewrite the file as a JSON array if configured to
    pub fn finalize(&mut self) -> Result<(), SpmError> {
        self.flush()?;
        if !self.final_format_json || self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(SpmError::Io {
                    source,
                    context: format!("reading {:?}", self.file_path),
                });
            }
        };

        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<T>, _>>()?;

        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.file_path, json).map_err(|source| SpmError::Io {
            source,
            context: format!("writing {:?}", self.file_path),
        })?;

        info!(
            "Converted {} records to JSON array at {:?}",
            records.len(),
            self.file_path
        );
        Ok(())
    }

    /// Records waiting to be flushed
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("Failed to finalize log {:?}: {}", self.file_path, e);
        }
    }
}
