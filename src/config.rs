//! Import configuration: environment defaults overridable from the CLI,
//! validated fail-fast before any per-year work starts.

use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use crate::{IngestError, Result};

/// Default yearly archive URL template (`{year}` is substituted).
pub const DEFAULT_BASE_URL: &str = "https://files.data.gouv.fr/geo-dvf/latest/csv/{year}";
/// Archive filename appended to the per-year URL.
const ARCHIVE_NAME: &str = "full.csv.gz";

pub const DEFAULT_CHUNK_SIZE: usize = 5_000;
pub const DEFAULT_MEMORY_CEILING_MB: u64 = 128;

#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// First year to import (inclusive).
    pub start_year: u16,
    /// Last year to import (inclusive).
    pub end_year: u16,
    /// Rows per chunk; trades memory for throughput.
    pub chunk_size: usize,
    /// Advisory resident-memory ceiling in MB.
    pub memory_ceiling_mb: u64,
    /// URL template containing `{year}`.
    pub base_url: String,
    /// PostgreSQL connection string.
    pub database_url: String,
    /// When set, read `{dir}/{year}.csv.gz` instead of downloading.
    pub source_dir: Option<PathBuf>,
    /// CSV field delimiter (`,` or `;`).
    pub delimiter: u8,
}

impl ImporterConfig {
    /// Defaults plus environment overrides. `DATABASE_URL` wins over the
    /// individual `POSTGRES_*` parts.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                var("POSTGRES_USER", "dvf_user"),
                var("POSTGRES_PASSWORD", "dvf_password"),
                var("POSTGRES_HOST", "localhost"),
                var("POSTGRES_PORT", "5432"),
                var("POSTGRES_DB", "dvf_data"),
            )
        });
        Self {
            start_year: 2020,
            end_year: 2024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_ceiling_mb: DEFAULT_MEMORY_CEILING_MB,
            base_url: var("DVF_BASE_URL", DEFAULT_BASE_URL),
            database_url,
            source_dir: env::var("DVF_SOURCE_DIR").ok().map(PathBuf::from),
            delimiter: b',',
        }
    }

    /// Configuration-level errors fail here, before any year is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.start_year > self.end_year {
            return Err(IngestError::Config(format!(
                "start year {} is after end year {}",
                self.start_year, self.end_year
            )));
        }
        if !(1900..=2100).contains(&self.start_year) || !(1900..=2100).contains(&self.end_year) {
            return Err(IngestError::Config(format!(
                "year range {}-{} is not plausible",
                self.start_year, self.end_year
            )));
        }
        if self.source_dir.is_none() && !self.base_url.contains("{year}") {
            return Err(IngestError::Config(format!(
                "base URL template must contain {{year}}: {}",
                self.base_url
            )));
        }
        if self.database_url.is_empty() {
            return Err(IngestError::Config("database URL is empty".into()));
        }
        if self.delimiter != b',' && self.delimiter != b';' {
            return Err(IngestError::Config(
                "delimiter must be ',' or ';'".into(),
            ));
        }
        Ok(())
    }

    pub fn years(&self) -> RangeInclusive<u16> {
        self.start_year..=self.end_year
    }

    /// Resolved archive URL for one year.
    pub fn url_for_year(&self, year: u16) -> String {
        let base = self.base_url.replace("{year}", &year.to_string());
        format!("{}/{}", base.trim_end_matches('/'), ARCHIVE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ImporterConfig {
        ImporterConfig {
            start_year: 2021,
            end_year: 2022,
            chunk_size: 100,
            memory_ceiling_mb: 128,
            base_url: DEFAULT_BASE_URL.to_string(),
            database_url: "postgres://u:p@localhost/dvf".to_string(),
            source_dir: None,
            delimiter: b',',
        }
    }

    #[test]
    fn url_substitutes_year_and_appends_archive() {
        let cfg = base_config();
        assert_eq!(
            cfg.url_for_year(2022),
            "https://files.data.gouv.fr/geo-dvf/latest/csv/2022/full.csv.gz"
        );
    }

    #[test]
    fn inverted_year_range_rejected() {
        let mut cfg = base_config();
        cfg.start_year = 2023;
        cfg.end_year = 2020;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn template_without_year_placeholder_rejected() {
        let mut cfg = base_config();
        cfg.base_url = "https://example.org/dvf".to_string();
        assert!(cfg.validate().is_err());
        // ...unless a local source directory is configured
        cfg.source_dir = Some(PathBuf::from("/tmp"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn odd_delimiter_rejected() {
        let mut cfg = base_config();
        cfg.delimiter = b'|';
        assert!(cfg.validate().is_err());
    }
}
