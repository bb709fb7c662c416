use std::sync::atomic::{AtomicU64, Ordering};

use super::record::{RecordKind, RECORD_KIND_CARDINALITY};

/// Lock-free per-RecordKind counters.
///
/// `snapshot()` atomically reads and resets all counters, so the agent can
/// report per-interval totals without contention with the read loop.
pub struct RecordStats {
    counts: [AtomicU64; RECORD_KIND_CARDINALITY],
    telemetry_lines: AtomicU64,
    program_lines: AtomicU64,
}

/// Point-in-time view of [`RecordStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStatsSnapshot {
    pub by_kind: Vec<(RecordKind, u64)>,
    pub telemetry_lines: u64,
    pub program_lines: u64,
}

impl RecordStatsSnapshot {
    /// Count for a single kind, zero if absent.
    pub fn count(&self, kind: RecordKind) -> u64 {
        self.by_kind
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, v)| *v)
    }
}

impl RecordStats {
    /// Create a new zeroed RecordStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            telemetry_lines: AtomicU64::new(0),
            program_lines: AtomicU64::new(0),
        }
    }

    /// Account one classified line.
    pub fn record(&self, kind: RecordKind, is_telemetry: bool) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if is_telemetry {
            self.telemetry_lines.fetch_add(1, Ordering::Relaxed);
        } else {
            self.program_lines.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, keeping only non-zero kinds.
    pub fn snapshot(&self) -> RecordStatsSnapshot {
        let mut by_kind = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = RecordKind::from_u8(i as u8) {
                    by_kind.push((kind, v));
                }
            }
        }

        RecordStatsSnapshot {
            by_kind,
            telemetry_lines: self.telemetry_lines.swap(0, Ordering::Relaxed),
            program_lines: self.program_lines.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for RecordStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = RecordStats::new();
        stats.record(RecordKind::CounterSample, true);
        stats.record(RecordKind::CounterSample, true);
        stats.record(RecordKind::PlainLine, false);

        let snap = stats.snapshot();
        assert_eq!(snap.by_kind.len(), 2);
        assert_eq!(snap.count(RecordKind::CounterSample), 2);
        assert_eq!(snap.count(RecordKind::PlainLine), 1);
        assert_eq!(snap.count(RecordKind::TaskEvent), 0);
        assert_eq!(snap.telemetry_lines, 2);
        assert_eq!(snap.program_lines, 1);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = RecordStats::new();
        stats.record(RecordKind::TaskEvent, true);

        assert_eq!(stats.snapshot().by_kind.len(), 1);

        let snap = stats.snapshot();
        assert!(snap.by_kind.is_empty());
        assert_eq!(snap.telemetry_lines, 0);
    }
}
