//! In-memory record of recent facade executions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum number of entries retained.
const MAX_AUDIT_ENTRIES: usize = 1000;

/// One facade execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub use_case: String,
    pub request_id: String,
    pub user_id: Option<String>,
    pub dry_run: bool,
    pub success: bool,
    /// Error code when the execution failed.
    pub error_code: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub failed: usize,
    pub dry_runs: usize,
}

/// Bounded log of the most recent executions, oldest dropped first.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.lock();
        if entries.len() >= MAX_AUDIT_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().iter().cloned().collect()
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        self.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> AuditStats {
        let entries = self.lock();
        AuditStats {
            total: entries.len(),
            failed: entries.iter().filter(|e| !e.success).count(),
            dry_runs: entries.iter().filter(|e| e.dry_run).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize, success: bool) -> AuditEntry {
        AuditEntry {
            use_case: "publish_article".into(),
            request_id: format!("req-{n}"),
            user_id: None,
            dry_run: n % 2 == 0,
            success,
            error_code: (!success).then(|| "not_retryable".into()),
            duration_ms: 1,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_log_is_bounded() {
        let log = AuditLog::new();
        for n in 0..MAX_AUDIT_ENTRIES + 5 {
            log.record(entry(n, true));
        }

        assert_eq!(log.len(), MAX_AUDIT_ENTRIES);
        assert_eq!(log.entries()[0].request_id, "req-5");
        assert_eq!(
            log.recent(1)[0].request_id,
            format!("req-{}", MAX_AUDIT_ENTRIES + 4)
        );
    }

    #[test]
    fn test_stats() {
        let log = AuditLog::new();
        log.record(entry(0, true));
        log.record(entry(1, false));
        log.record(entry(2, false));

        assert_eq!(
            log.stats(),
            AuditStats {
                total: 3,
                failed: 2,
                dry_runs: 2,
            }
        );
    }
}
