//! Drives the per-year pipeline: open source → decode → batch → validate →
//! write, sequentially within a year and across years. One bad chunk or one
//! bad year never aborts the rest; everything surfaces as counters in the
//! per-year [`ImportRun`].

use std::path::PathBuf;
use std::time::Instant;

use csv_async::ByteRecord;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::ChunkAccumulator;
use crate::config::ImporterConfig;
use crate::decode::RowDecoder;
use crate::http::Downloader;
use crate::io::{build_csv_reader, reader_from_path, CsvMeta};
use crate::memory::{MemoryAdvice, MemoryGovernor};
use crate::record::{parse_row, Columns};
use crate::run::{ImportReport, ImportRun, RunCounters};
use crate::writer::RecordSink;
use crate::Result;

/// Where yearly archives come from.
pub enum Source {
    /// Download from the configured URL template.
    Http,
    /// Read `{dir}/{year}.csv.gz` from a local directory of pre-downloaded
    /// archives.
    Dir(PathBuf),
}

impl Source {
    async fn open(
        &self,
        downloader: &Downloader,
        config: &ImporterConfig,
        year: u16,
    ) -> Result<(Box<dyn AsyncRead + Unpin + Send>, CsvMeta)> {
        match self {
            Source::Http => {
                let url = config.url_for_year(year);
                let (reader, meta) = downloader.open(&url).await?;
                Ok((Box::new(reader), meta))
            }
            Source::Dir(dir) => {
                let path = dir.join(format!("{year}.csv.gz"));
                info!(path = %path.display(), "opening local archive");
                let (file, meta) = reader_from_path(&path).await?;
                Ok((Box::new(file), meta))
            }
        }
    }
}

/// Single-owner import driver. Owns the sink, the memory governor and the
/// per-year counters; there is exactly one chunk in flight at any time.
pub struct Importer<S: RecordSink> {
    config: ImporterConfig,
    source: Source,
    sink: S,
    governor: MemoryGovernor,
    downloader: Downloader,
    cancel: CancellationToken,
}

impl<S: RecordSink> Importer<S> {
    /// Validates the configuration fail-fast; no per-year work happens on
    /// a bad config.
    pub fn new(config: ImporterConfig, source: Source, sink: S) -> Result<Self> {
        config.validate()?;
        let governor = MemoryGovernor::new(config.memory_ceiling_mb);
        let downloader = Downloader::new()?;
        Ok(Self {
            config,
            source,
            sink,
            governor,
            downloader,
            cancel: CancellationToken::new(),
        })
    }

    /// Token to cancel the import between chunks (e.g. from a SIGINT
    /// handler). The in-flight chunk write completes before the current
    /// year is finalized with the counts accumulated so far.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand back the sink (used by tests to inspect in-memory sinks).
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Import every configured year in order. A failed year is reported
    /// and the next one is still attempted.
    pub async fn run(&mut self) -> ImportReport {
        let mut runs = Vec::new();
        for year in self.config.years() {
            if self.cancel.is_cancelled() {
                info!(year, "cancellation requested, skipping remaining years");
                break;
            }
            runs.push(self.import_year(year).await);
        }
        ImportReport::new(runs)
    }

    /// One year's pass: Downloading → StreamingChunks → Finalizing.
    pub async fn import_year(&mut self, year: u16) -> ImportRun {
        let started = Instant::now();
        let mut counters = RunCounters::default();
        info!(year, "year import starting");

        let (raw, meta) = match self.source.open(&self.downloader, &self.config, year).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(year, error = %e, "source unavailable, year failed");
                return ImportRun::finalize(year, counters, started.elapsed(), true);
            }
        };

        let (reader, _meta) = build_csv_reader(raw, meta);
        let mut decoder = match RowDecoder::open(reader, self.config.delimiter).await {
            Ok(d) => d,
            Err(e) => {
                error!(year, error = %e, "unreadable header, year failed");
                return ImportRun::finalize(year, counters, started.elapsed(), true);
            }
        };
        let columns = decoder.columns().clone();
        let mut acc: ChunkAccumulator<ByteRecord> =
            ChunkAccumulator::new(self.config.chunk_size);
        let mut interrupted = false;

        while let Some(rec) = decoder.next_row().await {
            counters.processed += 1;
            if let Some(chunk) = acc.push(rec) {
                let advice = self.process_chunk(year, &columns, chunk, &mut counters).await;
                if advice == MemoryAdvice::Reclaim {
                    acc.shrink();
                }
                if self.cancel.is_cancelled() {
                    info!(year, "cancellation requested, finalizing year early");
                    interrupted = true;
                    break;
                }
            }
        }
        if !interrupted {
            if let Some(chunk) = acc.flush() {
                self.process_chunk(year, &columns, chunk, &mut counters).await;
            }
            if decoder.ended_truncated() {
                warn!(year, "stream ended early, counts reflect decoded rows only");
            }
        }

        let run = ImportRun::finalize(year, counters, started.elapsed(), false);
        info!(
            year,
            status = ?run.status,
            processed = counters.processed,
            inserted = counters.inserted,
            skipped = counters.skipped,
            failed = counters.failed,
            invalid = counters.invalid,
            elapsed_s = started.elapsed().as_secs(),
            "year import finished"
        );
        run
    }

    /// Validate and write one chunk, then consult the memory governor.
    /// Write failures land in the counters, never propagate.
    async fn process_chunk(
        &mut self,
        year: u16,
        columns: &Columns,
        raw: Vec<ByteRecord>,
        counters: &mut RunCounters,
    ) -> MemoryAdvice {
        let chunk_started = Instant::now();
        let raw_len = raw.len();

        let mut rows = Vec::with_capacity(raw_len);
        for rec in &raw {
            match parse_row(columns, rec) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    counters.invalid += 1;
                    debug!(year, ?reason, "row rejected");
                }
            }
        }
        drop(raw);

        if !rows.is_empty() {
            match self.sink.write_chunk(year, &rows).await {
                Ok(out) => {
                    counters.inserted += out.inserted;
                    counters.skipped += out.skipped;
                    counters.failed += out.failed;
                }
                Err(e) => {
                    error!(
                        year,
                        rows = rows.len(),
                        error = %e,
                        "chunk write failed beyond fallback, rows lost"
                    );
                    counters.failed += rows.len() as u64;
                }
            }
        }
        counters.chunks += 1;
        info!(
            year,
            chunk = counters.chunks,
            rows = raw_len,
            inserted = counters.inserted,
            skipped = counters.skipped,
            elapsed_ms = chunk_started.elapsed().as_millis() as u64,
            "chunk processed"
        );
        self.governor.after_chunk(self.config.chunk_size)
    }
}
