//! Bulk idempotent persistence of validated chunks.
//!
//! One chunk becomes one transaction of multi-row `INSERT ... ON CONFLICT
//! DO NOTHING` statements, paged to stay under the bind-parameter limit.
//! Duplicate natural keys are skips, not errors. When the bulk path fails
//! outright, the chunk is replayed row by row so only the offending rows
//! are lost. Expected column types on the target table are text for codes
//! and identifiers, `double precision` for measures, `date` for dates.
//!
//! The unique constraint over the key columns must be declared
//! `NULLS NOT DISTINCT` (PostgreSQL 15+): `numero_disposition` and
//! `lot1_numero` are NULL on most rows, and under default NULL semantics
//! the conflict clause would never match them, duplicating every such row
//! on rerun.

use chrono::{NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;

use crate::record::TransactionRecord;
use crate::Result;

/// Target table name (schema owned by the query layer).
pub const TABLE: &str = "dvf_data";

/// Insert column list; order matches the binds in [`push_insert`].
const COLUMNS: &str = "id_mutation, numero_disposition, date_mutation, nature_mutation, \
    valeur_fonciere, adresse_numero, adresse_suffixe, adresse_nom_voie, adresse_code_voie, \
    code_postal, code_commune, nom_commune, code_departement, id_parcelle, \
    lot1_numero, lot1_surface_carrez, lot2_numero, lot2_surface_carrez, \
    lot3_numero, lot3_surface_carrez, lot4_numero, lot4_surface_carrez, \
    lot5_numero, lot5_surface_carrez, nombre_lots, code_type_local, type_local, \
    surface_reelle_bati, nombre_pieces_principales, code_nature_culture, nature_culture, \
    code_nature_culture_speciale, nature_culture_speciale, surface_terrain, \
    longitude, latitude, prix_m2, import_year, import_date";

/// Binds per row in [`push_insert`]; must match [`COLUMNS`].
const BINDS_PER_ROW: usize = 39;

const CONFLICT_CLAUSE: &str =
    " ON CONFLICT (id_mutation, numero_disposition, id_parcelle, lot1_numero) DO NOTHING";

/// Rows per INSERT statement. Keeps bind counts well under the PostgreSQL
/// limit of 65535 (39 binds per row) and bounds statement size.
const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Hard page ceiling imposed by the 65535 bind-parameter limit.
const MAX_PAGE_SIZE: usize = 65_535 / BINDS_PER_ROW;

/// Row counts resulting from one chunk write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: u64,
    /// Rows whose natural key already existed.
    pub skipped: u64,
    /// Rows lost after the row-level fallback.
    pub failed: u64,
}

/// Destination for validated chunks. The Postgres implementation is
/// [`PgWriter`]; tests substitute in-memory sinks.
#[allow(async_fn_in_trait)]
pub trait RecordSink {
    /// Write one chunk tagged with its import year. Row-level problems are
    /// absorbed into the outcome counters; an `Err` means the chunk could
    /// not be attempted at all.
    async fn write_chunk(&mut self, year: u16, rows: &[TransactionRecord]) -> Result<WriteOutcome>;
}

/// Batch writer against the `dvf_data` table. Holds at most one chunk's
/// rows as pending SQL parameters at any time.
pub struct PgWriter {
    pool: PgPool,
    page_size: usize,
}

impl PgWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the rows-per-statement page size, clamped to the legal
    /// bind-count range.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// One transaction over the whole chunk, paged inserts inside.
    async fn bulk_insert(
        &self,
        year: u16,
        rows: &[TransactionRecord],
        import_date: NaiveDate,
    ) -> sqlx::Result<WriteOutcome> {
        let mut out = WriteOutcome::default();
        let mut tx = self.pool.begin().await?;
        for page in rows.chunks(self.page_size) {
            let mut qb = push_insert(page, year, import_date);
            let res = qb.build().execute(&mut *tx).await?;
            out.inserted += res.rows_affected();
            out.skipped += page.len() as u64 - res.rows_affected();
        }
        tx.commit().await?;
        Ok(out)
    }

    /// Row-level fallback: each row is its own statement so only the
    /// offending rows are lost. Failing rows are logged and counted.
    async fn insert_rows_individually(
        &self,
        year: u16,
        rows: &[TransactionRecord],
        import_date: NaiveDate,
    ) -> WriteOutcome {
        let mut out = WriteOutcome::default();
        for row in rows {
            let mut qb = push_insert(std::slice::from_ref(row), year, import_date);
            match qb.build().execute(&self.pool).await {
                Ok(res) if res.rows_affected() > 0 => out.inserted += 1,
                Ok(_) => out.skipped += 1,
                Err(e) => {
                    warn!(
                        id_mutation = %row.id_mutation,
                        id_parcelle = %row.id_parcelle,
                        error = %e,
                        "row insert failed, continuing with next row"
                    );
                    out.failed += 1;
                }
            }
        }
        out
    }
}

impl RecordSink for PgWriter {
    async fn write_chunk(&mut self, year: u16, rows: &[TransactionRecord]) -> Result<WriteOutcome> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let import_date = Utc::now().date_naive();
        match self.bulk_insert(year, rows, import_date).await {
            Ok(out) => Ok(out),
            Err(e) => {
                warn!(
                    year,
                    rows = rows.len(),
                    error = %e,
                    "bulk insert failed, falling back to row-level inserts"
                );
                Ok(self.insert_rows_individually(year, rows, import_date).await)
            }
        }
    }
}

/// Build one multi-row insert statement for `rows`. Bind order must match
/// [`COLUMNS`].
fn push_insert<'a>(
    rows: &'a [TransactionRecord],
    year: u16,
    import_date: NaiveDate,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {TABLE} ({COLUMNS}) "));
    qb.push_values(rows.iter(), |mut b, r| {
        b.push_bind(r.id_mutation.as_str())
            .push_bind(r.numero_disposition)
            .push_bind(r.date_mutation)
            .push_bind(r.nature_mutation.as_deref())
            .push_bind(r.valeur_fonciere)
            .push_bind(r.adresse_numero.as_deref())
            .push_bind(r.adresse_suffixe.as_deref())
            .push_bind(r.adresse_nom_voie.as_deref())
            .push_bind(r.adresse_code_voie.as_deref())
            .push_bind(r.code_postal.as_deref())
            .push_bind(r.code_commune.as_deref())
            .push_bind(r.nom_commune.as_deref())
            .push_bind(r.code_departement.as_deref())
            .push_bind(r.id_parcelle.as_str());
        for lot in &r.lots {
            b.push_bind(lot.numero.as_deref())
                .push_bind(lot.surface_carrez);
        }
        b.push_bind(r.nombre_lots)
            .push_bind(r.code_type_local.as_deref())
            .push_bind(r.type_local.as_deref())
            .push_bind(r.surface_reelle_bati)
            .push_bind(r.nombre_pieces_principales)
            .push_bind(r.code_nature_culture.as_deref())
            .push_bind(r.nature_culture.as_deref())
            .push_bind(r.code_nature_culture_speciale.as_deref())
            .push_bind(r.nature_culture_speciale.as_deref())
            .push_bind(r.surface_terrain)
            .push_bind(r.longitude)
            .push_bind(r.latitude)
            .push_bind(r.prix_m2)
            .push_bind(i32::from(year))
            .push_bind(import_date);
    });
    qb.push(CONFLICT_CLAUSE);
    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Execute;

    fn record(id: &str, parcelle: &str) -> TransactionRecord {
        TransactionRecord {
            id_mutation: id.to_string(),
            id_parcelle: parcelle.to_string(),
            numero_disposition: Some(1),
            valeur_fonciere: Some(200_000.0),
            ..Default::default()
        }
    }

    #[test]
    fn column_list_matches_bind_count() {
        assert_eq!(COLUMNS.split(',').count(), BINDS_PER_ROW);
    }

    #[test]
    fn single_row_statement_shape() {
        let rows = vec![record("2024-1", "P001")];
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut qb = push_insert(&rows, 2024, date);
        let sql = qb.build().sql().to_string();
        assert!(sql.starts_with("INSERT INTO dvf_data (id_mutation,"));
        assert!(sql.ends_with(
            "ON CONFLICT (id_mutation, numero_disposition, id_parcelle, lot1_numero) DO NOTHING"
        ));
        assert_eq!(sql.matches('$').count(), BINDS_PER_ROW);
    }

    #[test]
    fn multi_row_statement_binds_scale_linearly() {
        let rows = vec![record("2024-1", "P001"), record("2024-2", "P002")];
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut qb = push_insert(&rows, 2024, date);
        let sql = qb.build().sql().to_string();
        assert_eq!(sql.matches('$').count(), 2 * BINDS_PER_ROW);
    }

    #[test]
    fn page_size_keeps_binds_under_postgres_limit() {
        assert!(DEFAULT_PAGE_SIZE * BINDS_PER_ROW < 65_535);
    }

    #[tokio::test]
    async fn page_size_override_is_clamped() {
        // connect_lazy performs no I/O
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://u:p@localhost/dvf")
            .unwrap();
        let w = PgWriter::new(pool.clone()).with_page_size(0);
        assert_eq!(w.page_size, 1);
        let w = PgWriter::new(pool).with_page_size(usize::MAX);
        assert!(w.page_size * BINDS_PER_ROW < 65_535);
    }
}
