use crate::Result;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::CharsetTranscoder;

/// What we know about a source byte stream before opening it: HTTP headers
/// for downloads, file extension for local archives. Drives decompression
/// and charset selection in [`build_csv_reader`].
#[derive(Debug, Clone)]
pub struct CsvMeta {
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// just the filename or last URL segment (used for extension fallback)
    pub name_hint: String,
    /// character encoding of the decompressed text (defaults to UTF-8;
    /// historical DVF extracts are Latin-1)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for CsvMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

impl CsvMeta {
    /// Best-effort meta from a filename or URL-path segment.
    pub fn from_name_hint(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut meta = CsvMeta {
            name_hint: name,
            ..Default::default()
        };
        if meta.name_hint.ends_with(".gz") {
            meta.content_type = "application/gzip".into();
            meta.content_encoding = "gzip".into();
        } else if meta.name_hint.ends_with(".zst") {
            meta.content_type = "application/zstd".into();
            meta.content_encoding = "zstd".into();
        } else {
            meta.content_type = "text/csv".into();
        }
        meta
    }
}

/// Charset declared in a `Content-Type` header, e.g.
/// `text/csv; charset=ISO-8859-1`. `None` when no parameter is present or
/// the label is unknown.
pub fn charset_from_content_type(content_type: &str) -> Option<&'static encoding_rs::Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        encoding_rs::Encoding::for_label(value.trim().trim_matches('"').as_bytes())
    })
}

/// From a generic AsyncRead, wrap with optional decompression and UTF-8 transcoding.
/// Returns an AsyncRead suitable for the row decoder plus the meta we used.
///
/// The returned reader is the only buffering layer between the network/disk
/// and the CSV parser; it never holds more than its fixed capacity.
pub fn build_csv_reader<R>(raw: R, meta: CsvMeta) -> (impl AsyncRead + Unpin + Send, CsvMeta)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // 1) decompression choice: encoding -> type -> extension
    let normalized_meta = meta.clone();
    let ce = meta.content_encoding.to_ascii_lowercase();
    let ct = meta.content_type.to_ascii_lowercase();

    let is_gzip = ce.split(',').any(|s| s.trim() == "gzip")
        || matches!(ct.as_str(), "application/gzip" | "application/x-gzip")
        || meta.name_hint.ends_with(".gz");

    let is_zstd = ce.split(',').any(|s| s.trim() == "zstd")
        || ct == "application/zstd"
        || meta.name_hint.ends_with(".zst");

    // Use a larger buffer for fewer syscalls (1 MiB)
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = if is_gzip {
        Box::new(GzipDecoder::new(buf))
    } else if is_zstd {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    };

    // 2) transcoding to UTF-8 only when charset != UTF-8 to avoid extra copies
    let stream_reader: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        // No transcoding needed; UTF-8 validity is checked per row downstream
        Box::new(decompressed)
    } else {
        let transcoder = CharsetTranscoder::new(meta.charset);
        let framed = FramedRead::new(decompressed, transcoder);
        Box::new(StreamReader::new(framed))
    };

    (stream_reader, normalized_meta)
}

/// Open a local file as a raw byte source with meta derived from its
/// extension. Pass the result through [`build_csv_reader`] before decoding.
/// Used for importing pre-downloaded yearly archives.
pub async fn reader_from_path(path: &Path) -> Result<(File, CsvMeta)> {
    let file = File::open(path).await?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    Ok((file, CsvMeta::from_name_hint(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn charset_parsed_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/csv; charset=ISO-8859-1"),
            Some(encoding_rs::WINDOWS_1252)
        );
        assert_eq!(
            charset_from_content_type("text/csv; Charset=\"utf-8\""),
            Some(encoding_rs::UTF_8)
        );
        assert_eq!(charset_from_content_type("application/gzip"), None);
        assert_eq!(charset_from_content_type("text/csv; charset=martian"), None);
    }

    #[tokio::test]
    async fn latin1_source_is_transcoded_to_utf8() {
        let meta = CsvMeta {
            charset: encoding_rs::WINDOWS_1252,
            ..CsvMeta::from_name_hint("2024.csv")
        };
        let (mut reader, _) = build_csv_reader(&b"nom_commune\nOrl\xe9ans\n"[..], meta);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "nom_commune\nOrl\u{e9}ans\n");
    }
}
