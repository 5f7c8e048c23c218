//! Batched output to the primary and exception logs.
//!
//! Lines from every thread go through one queue under one lock, so the
//! order they land in a file is the order their writers acquired the lock.
//! A writer that fills the queue pays for the flush itself.

use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use crate::{
    error::{Result, TraceError},
    util::{hint::cold, sync::lock},
};

/// Queue length at which buffered lines are written out
pub const FLUSH_THRESHOLD: usize = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Primary,
    Exception,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Exception => f.write_str("exception"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub destination: Destination,
    pub text: String,
}

pub type Writer = Box<dyn Write + Send>;

struct Outputs {
    queue: Vec<LogLine>,
    primary: Option<Writer>,
    exception: Option<Writer>,
    flushes: usize,
}

impl Outputs {
    fn writer(&mut self, destination: Destination) -> Option<&mut Writer> {
        match destination {
            Destination::Primary => self.primary.as_mut(),
            Destination::Exception => self.exception.as_mut(),
        }
    }

    fn emit(&mut self, line: &LogLine) -> Result<()> {
        let destination = line.destination;
        let writer = self
            .writer(destination)
            .ok_or(TraceError::Closed(destination))?;
        writer
            .write_all(line.text.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|source| TraceError::Write {
                destination,
                source,
            })
    }

    fn flush_writers(&mut self) -> Result<()> {
        let mut result = Ok(());
        for destination in [Destination::Primary, Destination::Exception] {
            if let Some(writer) = self.writer(destination) {
                let flushed = writer.flush().map_err(|source| TraceError::Write {
                    destination,
                    source,
                });
                result = result.and(flushed);
            }
        }
        result
    }

    /// Write out everything queued, oldest first. No-op on an empty queue.
    ///
    /// Each destination is written independently: once a line fails, it and
    /// every later line for the same destination stay queued in order, while
    /// the other destination keeps going. The first error is returned.
    fn drain(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        let total = queue.len();
        let mut stalled = Vec::with_capacity(2);
        let mut first_error = None;
        for line in queue {
            if stalled.contains(&line.destination) {
                self.queue.push(line);
                continue;
            }
            if let Err(e) = self.emit(&line) {
                stalled.push(line.destination);
                first_error.get_or_insert(e);
                self.queue.push(line);
            }
        }
        self.flushes += 1;
        log::trace!(
            "flushed {} of {total} buffered log lines",
            total - self.queue.len()
        );
        let flushed = self.flush_writers();
        match first_error {
            Some(e) => Err(e),
            None => flushed,
        }
    }

    /// Throw away lines still queued for `destination`, returning how many
    fn discard(&mut self, destination: Destination) -> usize {
        let before = self.queue.len();
        self.queue.retain(|line| line.destination != destination);
        before - self.queue.len()
    }
}

pub struct BufferedLogSink {
    buffered: bool,
    outputs: Mutex<Outputs>,
}

impl BufferedLogSink {
    pub fn new(primary: Writer, exception: Writer, buffered: bool) -> Self {
        Self {
            buffered,
            outputs: Mutex::new(Outputs {
                queue: Vec::new(),
                primary: Some(primary),
                exception: Some(exception),
                flushes: 0,
            }),
        }
    }

    /// Create (truncating) both log files
    pub fn to_files<P, Q>(primary: P, exception: Q, buffered: bool) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let open = |path: &Path| -> Result<Writer> {
            let file = File::create(path).map_err(|source| TraceError::Open {
                path: path.to_owned(),
                source,
            })?;
            Ok(Box::new(BufWriter::new(file)))
        };
        Ok(Self::new(
            open(primary.as_ref())?,
            open(exception.as_ref())?,
            buffered,
        ))
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Queue `text` as one line for `destination`, or write it straight
    /// through when buffering is off
    pub fn write(&self, destination: Destination, text: impl Into<String>) -> Result<()> {
        let line = LogLine {
            destination,
            text: text.into(),
        };
        let mut outputs = lock(&self.outputs);
        if outputs.writer(destination).is_none() {
            return Err(TraceError::Closed(destination));
        }
        outputs.queue.push(line);
        if !self.buffered || outputs.queue.len() >= FLUSH_THRESHOLD {
            return cold(|| outputs.drain());
        }
        Ok(())
    }

    /// Write out whatever is still queued
    pub fn flush_all(&self) -> Result<()> {
        lock(&self.outputs).drain()
    }

    /// Flush everything queued, then flush and drop the writer for
    /// `destination`. The writer is dropped even if the flush fails, taking
    /// any lines it could not write with it. Closing twice is fine.
    pub fn close(&self, destination: Destination) -> Result<()> {
        let mut outputs = lock(&self.outputs);
        let drained = outputs.drain();
        let lost = outputs.discard(destination);
        if lost > 0 {
            log::error!("dropped {lost} unwritten {destination} log lines");
        }
        let writer = match destination {
            Destination::Primary => outputs.primary.take(),
            Destination::Exception => outputs.exception.take(),
        };
        let flushed = match writer {
            Some(mut writer) => {
                log::debug!("closed the {destination} log");
                writer.flush().map_err(|source| TraceError::Write {
                    destination,
                    source,
                })
            }
            None => Ok(()),
        };
        drained.and(flushed)
    }

    pub fn is_open(&self, destination: Destination) -> bool {
        lock(&self.outputs).writer(destination).is_some()
    }

    /// Lines waiting for the next flush
    pub fn queued(&self) -> usize {
        lock(&self.outputs).queue.len()
    }

    /// How many non-empty flushes have happened so far
    pub fn flush_count(&self) -> usize {
        lock(&self.outputs).flushes
    }
}

impl Drop for BufferedLogSink {
    fn drop(&mut self) {
        let outputs = self
            .outputs
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = outputs.drain() {
            log::error!("lost {} buffered log lines: {e}", outputs.queue.len());
        }
    }
}
