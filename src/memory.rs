//! Advisory memory governor: samples process resident memory after each
//! chunk write and nudges the pipeline to release spare buffer capacity
//! when a configured ceiling is breached. Never blocks and never aborts
//! the import on a breach alone.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Point-in-time resident-memory reading. Log/decision material only,
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_mb: u64,
}

/// What the pipeline should do after a chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAdvice {
    WithinBudget,
    /// Ceiling breached: run a reclamation pass (shrink reusable buffers)
    /// before the next chunk.
    Reclaim,
}

/// Number of consecutive breaches after which a smaller chunk size is
/// recommended for the next run.
const BREACH_STREAK_FOR_RECOMMENDATION: u32 = 3;

pub struct MemoryGovernor {
    ceiling_mb: u64,
    sys: System,
    pid: Option<Pid>,
    consecutive_breaches: u32,
    recommendation_logged: bool,
}

impl MemoryGovernor {
    pub fn new(ceiling_mb: u64) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("cannot resolve own pid, memory governor will be inert");
        }
        Self {
            ceiling_mb,
            sys: System::new(),
            pid,
            consecutive_breaches: 0,
            recommendation_logged: false,
        }
    }

    /// Read current resident memory. `None` when the platform cannot
    /// report it; the governor stays inert in that case.
    pub fn sample(&mut self) -> Option<MemorySample> {
        let pid = self.pid?;
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let proc = self.sys.process(pid)?;
        Some(MemorySample {
            rss_mb: proc.memory() / (1024 * 1024),
        })
    }

    /// Sample after a chunk write and decide whether a reclamation pass is
    /// due. `chunk_size` is only used for the shrink recommendation log.
    pub fn after_chunk(&mut self, chunk_size: usize) -> MemoryAdvice {
        let Some(sample) = self.sample() else {
            return MemoryAdvice::WithinBudget;
        };
        if sample.rss_mb <= self.ceiling_mb {
            self.consecutive_breaches = 0;
            debug!(rss_mb = sample.rss_mb, ceiling_mb = self.ceiling_mb, "memory within budget");
            return MemoryAdvice::WithinBudget;
        }

        self.consecutive_breaches += 1;
        warn!(
            rss_mb = sample.rss_mb,
            ceiling_mb = self.ceiling_mb,
            streak = self.consecutive_breaches,
            "memory ceiling breached, forcing reclamation pass"
        );
        if self.consecutive_breaches >= BREACH_STREAK_FOR_RECOMMENDATION
            && !self.recommendation_logged
        {
            warn!(
                current_chunk_size = chunk_size,
                recommended_chunk_size = (chunk_size / 2).max(1),
                "repeated memory breaches, consider a smaller chunk size for the next run"
            );
            self.recommendation_logged = true;
        }
        MemoryAdvice::Reclaim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_resident_memory() {
        let mut gov = MemoryGovernor::new(64);
        // Running test processes always have a nonzero RSS on supported
        // platforms; an inert governor returns None and is also fine.
        if let Some(s) = gov.sample() {
            assert!(s.rss_mb < 1024 * 1024);
        }
    }

    #[test]
    fn generous_ceiling_never_advises_reclaim() {
        let mut gov = MemoryGovernor::new(u64::MAX / (1024 * 1024));
        assert_eq!(gov.after_chunk(5000), MemoryAdvice::WithinBudget);
    }

    #[test]
    fn zero_ceiling_advises_reclaim_but_stays_advisory() {
        let mut gov = MemoryGovernor::new(0);
        if gov.sample().is_none() {
            return;
        }
        for _ in 0..4 {
            assert_eq!(gov.after_chunk(5000), MemoryAdvice::Reclaim);
        }
    }
}
