//! Datum counters and the per-datum statistics side channel.

use crate::datum::DatumId;
use serde::{Deserialize, Serialize};
use sluice_core::WorkerId;

/// Progress counters of one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumCounts {
    /// Datums in the job
    pub total: u64,
    /// Datums executed successfully
    pub processed: u64,
    /// Datums satisfied from the cache without execution
    pub skipped: u64,
    /// Datums that failed permanently
    pub failed: u64,
    /// Datums re-queued after their worker stopped heartbeating
    pub recovered: u64,
}

impl DatumCounts {
    /// Create counters for `total` datums
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Record a successful execution
    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    /// Record a cache hit
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Record a permanent failure
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Record a redispatch after a lost claim
    pub fn record_recovery(&mut self) {
        self.recovered += 1;
    }

    /// Datums with a final outcome
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.processed + self.skipped + self.failed
    }

    /// Whether every datum has a final outcome
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.settled() >= self.total
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let settled = self.settled();
        if settled == 0 {
            return 1.0;
        }
        (self.processed + self.skipped) as f64 / settled as f64
    }
}

/// Final outcome of one datum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatumOutcome {
    /// Executed and staged
    Success,
    /// Copied from a previous run
    Skipped,
    /// Failed after exhausting retries
    Failed {
        /// Last error
        reason: String,
    },
    /// Not settled before the job ended
    Abandoned,
}

/// Statistics of one datum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumStats {
    /// Datum identity
    pub datum: DatumId,
    /// Enumeration index
    pub index: usize,
    /// Executions started, including retries and redispatches
    pub attempts: u32,
    /// Worker of the last attempt
    pub worker: Option<WorkerId>,
    /// Duration of the last attempt in milliseconds
    pub duration_ms: u64,
    /// Final outcome
    pub outcome: DatumOutcome,
}

/// Statistics of one job, persisted when stats are enabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Final counters
    pub counts: DatumCounts,
    /// Per-datum records in enumeration order
    pub datums: Vec<DatumStats>,
    /// Wall time of the dispatch in milliseconds
    pub total_duration_ms: u64,
}

impl JobStats {
    /// Datums that failed permanently
    pub fn failures(&self) -> impl Iterator<Item = &DatumStats> {
        self.datums
            .iter()
            .filter(|d| matches!(d.outcome, DatumOutcome::Failed { .. }))
    }

    /// Mean duration of executed datums in milliseconds
    #[must_use]
    pub fn mean_duration_ms(&self) -> u64 {
        let executed: Vec<u64> = self
            .datums
            .iter()
            .filter(|d| matches!(d.outcome, DatumOutcome::Success))
            .map(|d| d.duration_ms)
            .collect();
        if executed.is_empty() {
            return 0;
        }
        executed.iter().sum::<u64>() / executed.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::Hash;

    #[test]
    fn test_counts() {
        let mut counts = DatumCounts::new(4);
        counts.record_processed();
        counts.record_skip();
        counts.record_failure();
        counts.record_recovery();
        assert_eq!(counts.settled(), 3);
        assert!(!counts.is_complete());
        counts.record_processed();
        assert!(counts.is_complete());
        assert!((counts.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!((DatumCounts::new(0).success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_job_stats_summaries() {
        let stat = |i: usize, ms: u64, outcome: DatumOutcome| DatumStats {
            datum: DatumId::from_hash(Hash::compute(&[i as u8])),
            index: i,
            attempts: 1,
            worker: None,
            duration_ms: ms,
            outcome,
        };
        let stats = JobStats {
            counts: DatumCounts::new(3),
            datums: vec![
                stat(0, 10, DatumOutcome::Success),
                stat(1, 30, DatumOutcome::Success),
                stat(2, 99, DatumOutcome::Failed {
                    reason: "boom".to_string(),
                }),
            ],
            total_duration_ms: 140,
        };
        assert_eq!(stats.mean_duration_ms(), 20);
        assert_eq!(stats.failures().count(), 1);

        let json = serde_json::to_string(&stats).unwrap();
        let back: JobStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
