//! Per-worker output buffers

use std::fmt;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Identifies the execution unit running an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerSlot {
    /// Inline on the dispatcher's own task
    Caller,
    /// Persistent worker thread, by start index
    Thread(usize),
    /// Isolated pool slot
    Isolated(usize),
}

impl fmt::Display for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Thread(index) => write!(f, "thread-{index}"),
            Self::Isolated(index) => write!(f, "isolated-{index}"),
        }
    }
}

/// Output captured from handlers running on one worker
///
/// Lines accumulate during an invocation and are emitted together by
/// [`WorkerOutput::flush`], which also clears the buffer.
#[derive(Debug)]
pub struct WorkerOutput {
    slot: WorkerSlot,
    lines: Mutex<Vec<String>>,
}

impl WorkerOutput {
    pub fn new(slot: WorkerSlot) -> Self {
        Self {
            slot,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn slot(&self) -> WorkerSlot {
        self.slot
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lines.lock().push(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Emit buffered lines as a single event and reset the buffer
    ///
    /// Returns the number of lines flushed.
    pub fn flush(&self, request_id: Uuid) -> usize {
        let lines = std::mem::take(&mut *self.lines.lock());
        if !lines.is_empty() {
            info!(
                worker = %self.slot,
                %request_id,
                lines = lines.len(),
                "Handler output:\n{}",
                lines.join("\n")
            );
        }
        lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_display() {
        assert_eq!(WorkerSlot::Caller.to_string(), "caller");
        assert_eq!(WorkerSlot::Thread(3).to_string(), "thread-3");
        assert_eq!(WorkerSlot::Isolated(0).to_string(), "isolated-0");
    }

    #[test]
    fn test_flush_resets_buffer() {
        let output = WorkerOutput::new(WorkerSlot::Thread(1));
        assert_eq!(output.flush(Uuid::now_v7()), 0);

        output.push("a");
        output.push(String::from("b"));
        assert_eq!(output.len(), 2);

        assert_eq!(output.flush(Uuid::now_v7()), 2);
        assert!(output.is_empty());
        assert_eq!(output.slot(), WorkerSlot::Thread(1));
    }
}
