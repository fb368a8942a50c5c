//! Moving wave fields to and from plain text snapshot files
//!
//! Each snapshot is one line of space-separated amplitudes. Files are only
//! ever appended to, so several runs can accumulate in the same file.

use crate::{wave::FieldView, Precision};
use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};

pub use std::io::Result;

/// Mechanism to append snapshots to a text file
#[derive(Debug)]
pub struct Writer {
    /// Buffered handle to the output file
    file: BufWriter<File>,

    /// Number of snapshots written so far
    written: usize,
}
//
impl Writer {
    /// Open a file for appending, creating it if needed
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append one snapshot line to the file
    ///
    /// The line is flushed immediately so that a failure is reported on the
    /// snapshot that caused it.
    pub fn write(&mut self, field: FieldView) -> Result<()> {
        let mut values = field.iter();
        if let Some(first) = values.next() {
            write!(self.file, "{first}")?;
            for value in values {
                write!(self.file, " {value}")?;
            }
        }
        writeln!(self.file)?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }

    /// Number of snapshots written by this writer
    pub fn num_written(&self) -> usize {
        self.written
    }

    /// Flush the file to the underlying storage medium and close it
    ///
    /// This should automatically happen on Drop, but doing it manually allows
    /// you to catch and handle errors.
    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()
    }
}

/// Read back every snapshot stored in a file
pub fn read_snapshots(path: impl AsRef<Path>) -> Result<Vec<Vec<Precision>>> {
    let reader = BufReader::new(File::open(path)?);
    reader
        .lines()
        .map(|line| {
            line?
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<Precision>()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                })
                .collect()
        })
        .collect()
}
