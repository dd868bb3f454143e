//! Per-year run accounting: counters accumulated through one year's
//! pipeline pass, the terminal status derived from them, and the overall
//! multi-year report with its three-way exit signal.

use std::time::Duration;

/// Terminal status of one year's import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearStatus {
    /// Every processed row was either inserted or skipped as a duplicate.
    Succeeded,
    /// Some rows were lost to write failures, but at least one row landed.
    PartiallySucceeded,
    /// Nothing landed: download/open failure, or every row was lost.
    Failed,
}

/// Counters owned by one year's pipeline pass. Absorbed row- and
/// chunk-level errors surface only here, never as propagated errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    /// Raw rows pulled from the decoder (header excluded).
    pub processed: u64,
    /// Rows newly inserted.
    pub inserted: u64,
    /// Rows skipped because their natural key already existed.
    pub skipped: u64,
    /// Rows lost to write failures after the row-level fallback.
    pub failed: u64,
    /// Rows rejected by validation (missing key column, bad encoding).
    pub invalid: u64,
    /// Chunks pushed through the writer.
    pub chunks: u64,
}

/// Finalized outcome of one year. Immutable once built.
#[derive(Debug, Clone)]
pub struct ImportRun {
    pub year: u16,
    pub counters: RunCounters,
    pub elapsed: Duration,
    pub status: YearStatus,
}

impl ImportRun {
    /// Derive the terminal status from the counters. `fatal` marks a
    /// year-level failure (download error, unreadable header, unexpected
    /// persistence failure) that pre-empts counter-based classification.
    ///
    /// Delivery counts inserts and duplicate skips alike: a skipped row
    /// reached the table on an earlier run, so a rerun that only hits
    /// existing keys is a success, and a year with losses is partial as
    /// long as any row was delivered, even when none were newly inserted.
    pub fn finalize(year: u16, counters: RunCounters, elapsed: Duration, fatal: bool) -> Self {
        let delivered = counters.inserted + counters.skipped;
        let status = if fatal {
            YearStatus::Failed
        } else if counters.failed > 0 {
            if delivered > 0 {
                YearStatus::PartiallySucceeded
            } else {
                YearStatus::Failed
            }
        } else if counters.processed > 0 && delivered == 0 {
            // Rows arrived but none reached the table (e.g. all invalid).
            YearStatus::Failed
        } else {
            YearStatus::Succeeded
        };
        Self {
            year,
            counters,
            elapsed,
            status,
        }
    }
}

/// Ordered per-year outcomes of one invocation.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub runs: Vec<ImportRun>,
}

impl ImportReport {
    pub fn new(runs: Vec<ImportRun>) -> Self {
        Self { runs }
    }

    /// Process exit contract: 0 when every year succeeded, 2 when degraded
    /// (some data landed but not everything succeeded), 1 on total failure.
    pub fn exit_code(&self) -> i32 {
        if self.runs.is_empty() {
            return 1;
        }
        if self
            .runs
            .iter()
            .all(|r| r.status == YearStatus::Succeeded)
        {
            0
        } else if self.runs.iter().all(|r| r.status == YearStatus::Failed) {
            1
        } else {
            2
        }
    }
}
