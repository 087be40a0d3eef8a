//! In-memory command surface, audit log and clocks for tests and local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::capabilities::{AuditSink, CapabilityError, Clock, CommandSource, PendingCommand};

fn lock_error(label: &str) -> CapabilityError {
    CapabilityError::Unavailable(format!("mutex poisoned: {label}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceLine {
    scope: String,
    text: String,
    consumed: Option<String>,
}

/// Command source backed by a vector. Position refs are line indexes.
#[derive(Debug, Default)]
pub struct MemoryCommandSource {
    lines: Mutex<Vec<SourceLine>>,
}

impl MemoryCommandSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, scope: &str, text: &str) -> Result<String, CapabilityError> {
        let mut lines = self.lines.lock().map_err(|_| lock_error("source"))?;
        lines.push(SourceLine {
            scope: scope.to_string(),
            text: text.to_string(),
            consumed: None,
        });
        Ok((lines.len() - 1).to_string())
    }

    /// Status label recorded for a line, if it was consumed.
    pub fn label(&self, position_ref: &str) -> Result<Option<String>, CapabilityError> {
        let lines = self.lines.lock().map_err(|_| lock_error("source"))?;
        Ok(position_ref
            .parse::<usize>()
            .ok()
            .and_then(|index| lines.get(index))
            .and_then(|line| line.consumed.clone()))
    }
}

#[async_trait]
impl CommandSource for MemoryCommandSource {
    async fn list_pending(&self, scope: &str) -> Result<Vec<PendingCommand>, CapabilityError> {
        let lines = self.lines.lock().map_err(|_| lock_error("source"))?;
        Ok(lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.scope == scope && line.consumed.is_none())
            .map(|(index, line)| PendingCommand {
                text: line.text.clone(),
                position_ref: index.to_string(),
            })
            .collect())
    }

    async fn mark_consumed(
        &self,
        position_ref: &str,
        status_label: &str,
    ) -> Result<(), CapabilityError> {
        let mut lines = self.lines.lock().map_err(|_| lock_error("source"))?;
        let line = position_ref
            .parse::<usize>()
            .ok()
            .and_then(|index| lines.get_mut(index))
            .ok_or_else(|| CapabilityError::Rejected(format!("unknown line {position_ref}")))?;
        line.consumed = Some(status_label.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines appended for a scope, oldest first.
    pub fn lines(&self, scope: &str) -> Result<Vec<String>, CapabilityError> {
        let lines = self.lines.lock().map_err(|_| lock_error("audit"))?;
        Ok(lines
            .iter()
            .filter(|(line_scope, _)| line_scope == scope)
            .map(|(_, line)| line.clone())
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append_line(&self, scope: &str, line: &str) -> Result<(), CapabilityError> {
        let mut lines = self.lines.lock().map_err(|_| lock_error("audit"))?;
        lines.push((scope.to_string(), line.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.now.lock() {
            *current += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|current| *current)
            .unwrap_or_else(|_| Utc::now())
    }
}
