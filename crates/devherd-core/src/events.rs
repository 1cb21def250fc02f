//! Events produced by supervised child processes and log followers

/// Output and lifecycle events from a spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Non-empty stdout line
    Stdout(String),

    /// Non-empty stderr line
    Stderr(String),

    /// Process has exited
    Exited { code: Option<i32> },
}

impl ProcessEvent {
    pub fn is_exit(&self) -> bool {
        matches!(self, ProcessEvent::Exited { .. })
    }
}
