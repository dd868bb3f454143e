//! Typed row model for DVF transactions and the per-column parse table.
//!
//! CSV fields arrive as raw bytes; every column has exactly one typed parse
//! path here. Numeric and date fields degrade to `None` on empty or
//! unparseable input instead of erroring — a transaction with an unknown
//! date is kept, only the field is dropped. Rows missing the mutation or
//! parcel identifier are rejected outright because the deduplication key
//! needs both.

use chrono::NaiveDate;
use csv_async::{ByteRecord, StringRecord};
use std::collections::HashMap;

use crate::IngestError;

/// Columns that must exist in the header for the import to start at all.
pub const REQUIRED_HEADERS: [&str; 2] = ["id_mutation", "id_parcelle"];

/// Upper bound on monetary values; anything above is treated as a data
/// error and nulled (100 million euros, from the source cleaning rules).
const MAX_VALEUR_FONCIERE: f64 = 100_000_000.0;
/// Upper bound on surface areas in m².
const MAX_SURFACE: f64 = 10_000_000.0;

/// Source date format: day/month/year.
const DATE_FORMAT: &str = "%d/%m/%Y";

/// One lot sub-record of a transaction (lot number + surveyed Carrez area).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lot {
    pub numero: Option<String>,
    pub surface_carrez: Option<f64>,
}

/// One validated property-transaction row, ready for insertion.
///
/// Optional fields preserve absence as `None`; nothing is defaulted to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionRecord {
    pub id_mutation: String,
    pub numero_disposition: Option<i32>,
    pub date_mutation: Option<NaiveDate>,
    pub nature_mutation: Option<String>,
    pub valeur_fonciere: Option<f64>,
    pub adresse_numero: Option<String>,
    pub adresse_suffixe: Option<String>,
    pub adresse_nom_voie: Option<String>,
    pub adresse_code_voie: Option<String>,
    pub code_postal: Option<String>,
    pub code_commune: Option<String>,
    pub nom_commune: Option<String>,
    pub code_departement: Option<String>,
    pub id_parcelle: String,
    pub lots: [Lot; 5],
    pub nombre_lots: Option<i32>,
    pub code_type_local: Option<String>,
    pub type_local: Option<String>,
    pub surface_reelle_bati: Option<f64>,
    pub nombre_pieces_principales: Option<i32>,
    pub code_nature_culture: Option<String>,
    pub nature_culture: Option<String>,
    pub code_nature_culture_speciale: Option<String>,
    pub nature_culture_speciale: Option<String>,
    pub surface_terrain: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    /// Derived price per m² of built surface; `None` unless both value and
    /// built surface are present and the surface is strictly positive.
    pub prix_m2: Option<f64>,
}

impl TransactionRecord {
    /// The natural deduplication key: (mutation id, disposition number,
    /// parcel id, first lot number). Enforced by the store's unique
    /// constraint; exposed here for in-memory sinks and tests.
    pub fn natural_key(&self) -> (&str, Option<i32>, &str, Option<&str>) {
        (
            &self.id_mutation,
            self.numero_disposition,
            &self.id_parcelle,
            self.lots[0].numero.as_deref(),
        )
    }
}

/// Why a raw row was rejected instead of producing a [`TransactionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowError {
    /// A required key column is empty or absent.
    MissingKey(&'static str),
    /// A field holds bytes that are not valid UTF-8.
    BadEncoding,
}

/// Header-name to field-position mapping, resolved once per stream from the
/// header line. Lookups by name keep the parse table independent of column
/// order in the source file.
#[derive(Debug, Clone)]
pub struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    /// Build from the header record, verifying the key columns exist.
    pub fn from_headers(headers: &StringRecord) -> Result<Self, IngestError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_string(), i))
            .collect();
        for required in REQUIRED_HEADERS {
            if !index.contains_key(required) {
                return Err(IngestError::MissingHeader(required.to_string()));
            }
        }
        Ok(Self { index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Raw field by column name. `Ok(None)` when the column is absent from
    /// the header, the row is short, or the value is a null token.
    /// `Err(BadEncoding)` when the bytes are not UTF-8.
    fn get<'a>(&self, rec: &'a ByteRecord, name: &str) -> Result<Option<&'a str>, RowError> {
        let Some(&idx) = self.index.get(name) else {
            return Ok(None);
        };
        let Some(raw) = rec.get(idx) else {
            return Ok(None);
        };
        let s = std::str::from_utf8(raw)
            .map_err(|_| RowError::BadEncoding)?
            .trim();
        if is_null_token(s) {
            Ok(None)
        } else {
            Ok(Some(s))
        }
    }

    fn string(&self, rec: &ByteRecord, name: &str) -> Result<Option<String>, RowError> {
        Ok(self.get(rec, name)?.map(str::to_string))
    }

    /// Numeric parse with a validity range; out-of-range or unparseable
    /// input becomes `None`, never an error and never zero.
    fn f64_capped(
        &self,
        rec: &ByteRecord,
        name: &str,
        max: f64,
    ) -> Result<Option<f64>, RowError> {
        Ok(self
            .get(rec, name)?
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0 && *v <= max))
    }

    fn f64_raw(&self, rec: &ByteRecord, name: &str) -> Result<Option<f64>, RowError> {
        Ok(self
            .get(rec, name)?
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite()))
    }

    /// Integer parse accepting float-form integers ("2.0"), which appear in
    /// re-exported DVF files.
    fn i32(&self, rec: &ByteRecord, name: &str) -> Result<Option<i32>, RowError> {
        Ok(self.get(rec, name)?.and_then(|s| {
            s.parse::<i32>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i32)
            })
        }))
    }

    fn date(&self, rec: &ByteRecord, name: &str) -> Result<Option<NaiveDate>, RowError> {
        Ok(self
            .get(rec, name)?
            .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok()))
    }

    fn lot(&self, rec: &ByteRecord, n: usize) -> Result<Lot, RowError> {
        Ok(Lot {
            numero: self.string(rec, &format!("lot{n}_numero"))?,
            surface_carrez: self.f64_capped(rec, &format!("lot{n}_surface_carrez"), MAX_SURFACE)?,
        })
    }
}

/// Source null markers, inherited from the upstream exports.
fn is_null_token(s: &str) -> bool {
    matches!(s, "" | "NaN" | "nan" | "NULL")
}

/// Pad numeric postal codes to the canonical 5 digits ("7250" → "07250").
/// Non-numeric values pass through unchanged.
fn normalize_code_postal(code: Option<String>) -> Option<String> {
    code.map(|c| {
        if !c.is_empty() && c.len() < 5 && c.bytes().all(|b| b.is_ascii_digit()) {
            format!("{c:0>5}")
        } else {
            c
        }
    })
}

/// Derived price per m² of built surface. Strictly-positive denominator
/// only; a zero surface yields `None`, not a division error or a zero.
fn price_per_m2(valeur: Option<f64>, surface: Option<f64>) -> Option<f64> {
    match (valeur, surface) {
        (Some(v), Some(s)) if s > 0.0 => Some(v / s),
        _ => None,
    }
}

/// Parse one raw CSV row into a [`TransactionRecord`].
pub fn parse_row(cols: &Columns, rec: &ByteRecord) -> Result<TransactionRecord, RowError> {
    let id_mutation = cols
        .get(rec, "id_mutation")?
        .ok_or(RowError::MissingKey("id_mutation"))?
        .to_string();
    let id_parcelle = cols
        .get(rec, "id_parcelle")?
        .ok_or(RowError::MissingKey("id_parcelle"))?
        .to_string();

    let valeur_fonciere = cols.f64_capped(rec, "valeur_fonciere", MAX_VALEUR_FONCIERE)?;
    let surface_reelle_bati = cols.f64_capped(rec, "surface_reelle_bati", MAX_SURFACE)?;
    let prix_m2 = price_per_m2(valeur_fonciere, surface_reelle_bati);

    let lots = [
        cols.lot(rec, 1)?,
        cols.lot(rec, 2)?,
        cols.lot(rec, 3)?,
        cols.lot(rec, 4)?,
        cols.lot(rec, 5)?,
    ];

    Ok(TransactionRecord {
        id_mutation,
        numero_disposition: cols.i32(rec, "numero_disposition")?,
        date_mutation: cols.date(rec, "date_mutation")?,
        nature_mutation: cols.string(rec, "nature_mutation")?,
        valeur_fonciere,
        adresse_numero: cols.string(rec, "adresse_numero")?,
        adresse_suffixe: cols.string(rec, "adresse_suffixe")?,
        adresse_nom_voie: cols.string(rec, "adresse_nom_voie")?,
        adresse_code_voie: cols.string(rec, "adresse_code_voie")?,
        code_postal: normalize_code_postal(cols.string(rec, "code_postal")?),
        code_commune: cols.string(rec, "code_commune")?,
        nom_commune: cols.string(rec, "nom_commune")?,
        code_departement: cols.string(rec, "code_departement")?,
        id_parcelle,
        lots,
        nombre_lots: cols.i32(rec, "nombre_lots")?,
        code_type_local: cols.string(rec, "code_type_local")?,
        type_local: cols.string(rec, "type_local")?,
        surface_reelle_bati,
        nombre_pieces_principales: cols.i32(rec, "nombre_pieces_principales")?,
        code_nature_culture: cols.string(rec, "code_nature_culture")?,
        nature_culture: cols.string(rec, "nature_culture")?,
        code_nature_culture_speciale: cols.string(rec, "code_nature_culture_speciale")?,
        nature_culture_speciale: cols.string(rec, "nature_culture_speciale")?,
        surface_terrain: cols.f64_capped(rec, "surface_terrain", MAX_SURFACE)?,
        longitude: cols.f64_raw(rec, "longitude")?,
        latitude: cols.f64_raw(rec, "latitude")?,
        prix_m2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns_of(headers: &[&str]) -> Columns {
        let rec = StringRecord::from(headers.to_vec());
        Columns::from_headers(&rec).unwrap()
    }

    fn byte_record(fields: &[&str]) -> ByteRecord {
        let mut rec = ByteRecord::new();
        for f in fields {
            rec.push_field(f.as_bytes());
        }
        rec
    }

    #[test]
    fn header_missing_key_column_rejected() {
        let rec = StringRecord::from(vec!["id_mutation", "valeur_fonciere"]);
        let err = Columns::from_headers(&rec).unwrap_err();
        assert!(matches!(err, IngestError::MissingHeader(h) if h == "id_parcelle"));
    }

    #[test]
    fn full_row_parses_with_derived_price() {
        let cols = columns_of(&[
            "id_mutation",
            "numero_disposition",
            "date_mutation",
            "valeur_fonciere",
            "surface_reelle_bati",
            "id_parcelle",
            "lot1_numero",
            "code_postal",
        ]);
        let rec = byte_record(&[
            "2024-1", "1", "03/01/2024", "300000", "100", "75101000AB0001", "12", "7250",
        ]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.id_mutation, "2024-1");
        assert_eq!(row.numero_disposition, Some(1));
        assert_eq!(
            row.date_mutation,
            Some(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap())
        );
        assert_eq!(row.prix_m2, Some(3000.0));
        // postal code padded to 5 digits
        assert_eq!(row.code_postal.as_deref(), Some("07250"));
        assert_eq!(row.lots[0].numero.as_deref(), Some("12"));
        assert_eq!(
            row.natural_key(),
            ("2024-1", Some(1), "75101000AB0001", Some("12"))
        );
    }

    #[test]
    fn missing_mutation_id_is_rejected() {
        let cols = columns_of(&["id_mutation", "id_parcelle"]);
        let rec = byte_record(&["", "P001"]);
        assert_eq!(
            parse_row(&cols, &rec),
            Err(RowError::MissingKey("id_mutation"))
        );
    }

    #[test]
    fn missing_parcel_id_is_rejected() {
        let cols = columns_of(&["id_mutation", "id_parcelle"]);
        let rec = byte_record(&["2024-1", "NULL"]);
        assert_eq!(
            parse_row(&cols, &rec),
            Err(RowError::MissingKey("id_parcelle"))
        );
    }

    #[test]
    fn zero_surface_yields_null_price_not_zero() {
        let cols = columns_of(&[
            "id_mutation",
            "id_parcelle",
            "valeur_fonciere",
            "surface_reelle_bati",
        ]);
        let rec = byte_record(&["2024-1", "P001", "250000", "0"]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.valeur_fonciere, Some(250000.0));
        assert_eq!(row.surface_reelle_bati, Some(0.0));
        assert_eq!(row.prix_m2, None);
    }

    #[test]
    fn unparseable_date_drops_field_keeps_row() {
        let cols = columns_of(&["id_mutation", "id_parcelle", "date_mutation"]);
        let rec = byte_record(&["2024-1", "P001", "not-a-date"]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.date_mutation, None);
    }

    #[test]
    fn out_of_range_values_are_nulled() {
        let cols = columns_of(&[
            "id_mutation",
            "id_parcelle",
            "valeur_fonciere",
            "surface_terrain",
        ]);
        let rec = byte_record(&["2024-1", "P001", "999999999999", "-5"]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.valeur_fonciere, None);
        assert_eq!(row.surface_terrain, None);
    }

    #[test]
    fn float_form_integers_accepted() {
        let cols = columns_of(&["id_mutation", "id_parcelle", "nombre_pieces_principales"]);
        let rec = byte_record(&["2024-1", "P001", "3.0"]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.nombre_pieces_principales, Some(3));
    }

    #[test]
    fn short_row_treats_missing_trailing_fields_as_null() {
        let cols = columns_of(&["id_mutation", "id_parcelle", "valeur_fonciere"]);
        let rec = byte_record(&["2024-1", "P001"]);
        let row = parse_row(&cols, &rec).unwrap();
        assert_eq!(row.valeur_fonciere, None);
    }

    #[test]
    fn invalid_utf8_field_fails_encoding() {
        let cols = columns_of(&["id_mutation", "id_parcelle", "nom_commune"]);
        let mut rec = ByteRecord::new();
        rec.push_field(b"2024-1");
        rec.push_field(b"P001");
        rec.push_field(b"\xff\xfe");
        assert_eq!(parse_row(&cols, &rec), Err(RowError::BadEncoding));
    }
}
