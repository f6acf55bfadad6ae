use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::Result;

/// Source of lines to print. Non-exclusive (`parallel`) jobs tolerate
/// out-of-band commands interleaved with their own lines; exclusive jobs
/// (the common case) expect the job coordinator to be the only source of
/// `source:job`-tagged commands while processing.
pub trait Job: Send {
    /// Returns the next raw line, or `None` at end of job.
    fn next_line(&mut self) -> Result<Option<String>>;

    fn pos(&self) -> u64;
    fn read_lines(&self) -> u64;
    fn total_lines(&self) -> Option<u64> {
        None
    }

    fn parallel(&self) -> bool {
        false
    }

    fn exclusive(&self) -> bool {
        true
    }
}

/// A job backed by an in-memory list of lines, useful for tests and small
/// scripted sequences (homing routines, calibration macros).
pub struct MemoryJob {
    lines: Vec<String>,
    pos: AtomicU64,
}

impl MemoryJob {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            pos: AtomicU64::new(0),
        }
    }
}

impl Job for MemoryJob {
    fn next_line(&mut self) -> Result<Option<String>> {
        let i = self.pos.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(self.lines.get(i).cloned())
    }

    fn pos(&self) -> u64 {
        self.pos.load(Ordering::SeqCst)
    }

    fn read_lines(&self) -> u64 {
        self.pos.load(Ordering::SeqCst).min(self.lines.len() as u64)
    }

    fn total_lines(&self) -> Option<u64> {
        Some(self.lines.len() as u64)
    }
}

/// A job reading lines from a file on disk as they're requested, rather
/// than loading the whole file up front — the shape a real multi-hour print
/// job needs.
pub struct FileJob {
    reader: BufReader<std::fs::File>,
    read_lines: AtomicU64,
    finished: AtomicBool,
}

impl FileJob {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            read_lines: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        })
    }
}

impl Job for FileJob {
    fn next_line(&mut self) -> Result<Option<String>> {
        if self.finished.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(crate::error::EngineError::Io)?;

        if n == 0 {
            self.finished.store(true, Ordering::SeqCst);
            return Ok(None);
        }

        self.read_lines.fetch_add(1, Ordering::SeqCst);
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn pos(&self) -> u64 {
        self.read_lines.load(Ordering::SeqCst)
    }

    fn read_lines(&self) -> u64 {
        self.read_lines.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_job_yields_lines_in_order_then_none() {
        let mut job = MemoryJob::new(vec!["G28".to_string(), "G1 X10".to_string()]);
        assert_eq!(job.next_line().unwrap().as_deref(), Some("G28"));
        assert_eq!(job.next_line().unwrap().as_deref(), Some("G1 X10"));
        assert_eq!(job.next_line().unwrap(), None);
        assert_eq!(job.read_lines(), 2);
    }
}
