use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Incremental transcoder from a known single-byte/legacy charset to UTF-8,
/// used as a `FramedRead` decoder ahead of the CSV parser when a source is
/// not UTF-8 (historical DVF extracts are Latin-1).
///
/// Uses replacement on unmappable input: when the charset is declared up
/// front, replacement never silently changes valid data, and a whole-stream
/// abort for one bad byte would violate the row-local error contract.
pub struct CharsetTranscoder {
    inner: encoding_rs::Decoder,
    scratch: Vec<u8>,
}

impl CharsetTranscoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            inner: encoding.new_decoder(),
            scratch: Vec::new(),
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        if src.is_empty() {
            return None;
        }

        let worst_case = self
            .inner
            .max_utf8_buffer_length(src.len())
            .unwrap_or(src.len() * 3);
        self.scratch.clear();
        self.scratch.resize(worst_case, 0);

        let (_status, read, written, _replaced) =
            self.inner.decode_to_utf8(src, &mut self.scratch, last);
        src.advance(read);

        if written == 0 {
            None
        } else {
            Some(BytesMut::from(&self.scratch[..written]))
        }
    }
}

impl Decoder for CharsetTranscoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let out = self.transcode(src, true);
        src.clear();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_to_utf8() {
        let mut t = CharsetTranscoder::new(encoding_rs::WINDOWS_1252);
        // "Allée" in Latin-1: 0xE9 = é
        let mut src = BytesMut::from(&b"All\xe9e"[..]);
        let out = t.decode(&mut src).unwrap().expect("some output");
        assert_eq!(&out[..], "Allée".as_bytes());
        assert!(src.is_empty());
    }

    #[test]
    fn empty_input_yields_none() {
        let mut t = CharsetTranscoder::new(encoding_rs::WINDOWS_1252);
        let mut src = BytesMut::new();
        assert!(t.decode(&mut src).unwrap().is_none());
        assert!(t.decode_eof(&mut src).unwrap().is_none());
    }
}
