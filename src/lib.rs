//! Streaming, chunked, memory-bounded import of DVF property-transaction
//! datasets (gzip CSV over HTTP) into PostgreSQL.
//!
//! Pipeline: HTTP byte stream → [`decode::RowDecoder`] → [`chunk::ChunkAccumulator`]
//! → row validation ([`record`]) → [`writer::PgWriter`], driven one year at a
//! time by [`orchestrator::Importer`]. Peak memory is bounded by one chunk of
//! rows plus fixed-size I/O buffers regardless of source file size.
//!
//! Data shape:
//! - [`record::TransactionRecord`] — one validated transaction row
//! - [`run::ImportRun`] — per-year outcome (counters + terminal status)
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod chunk;
pub mod config;
pub mod decode;
pub mod http;
pub mod io;
pub mod memory;
pub mod orchestrator;
pub mod record;
pub mod run;
pub mod writer;

pub use crate::config::ImporterConfig;
pub use crate::io::{build_csv_reader, charset_from_content_type, reader_from_path, CsvMeta};
pub use crate::orchestrator::{Importer, Source};
pub use crate::record::TransactionRecord;
pub use crate::run::{ImportReport, ImportRun, YearStatus};
pub use crate::writer::{PgWriter, RecordSink, WriteOutcome};
pub use tokio_util::sync::CancellationToken;

use thiserror::Error;

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing required header: {0}")]
    MissingHeader(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
