//! Content-Encoding removal.

use brotli::Decompressor;
use carta_core::CartaError;
use carta_core::CartaResult;
use flate2::read::DeflateDecoder;
use flate2::read::GzDecoder;
use flate2::read::ZlibDecoder;
use std::io::Cursor;
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Unsupported(String),
}

impl ContentEncoding {
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Self::Identity,
            "gzip" | "x-gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            "br" => Self::Brotli,
            other => Self::Unsupported(other.to_owned()),
        }
    }
}

/// Splits a `Content-Encoding` value in application order.
pub fn parse_content_encodings(value: &str) -> Vec<ContentEncoding> {
    value
        .split(',')
        .filter(|token| !token.trim().is_empty())
        .map(ContentEncoding::from_token)
        .collect()
}

/// Undoes `encodings`, last applied first.
pub fn decode_content_encoding(encodings: &[ContentEncoding], body: &[u8]) -> CartaResult<Vec<u8>> {
    let mut decoded = body.to_vec();
    for encoding in encodings.iter().rev() {
        decoded = match encoding {
            ContentEncoding::Identity => decoded,
            ContentEncoding::Gzip => decode_gzip(&decoded)?,
            ContentEncoding::Deflate => decode_deflate(&decoded)?,
            ContentEncoding::Brotli => decode_brotli(&decoded)?,
            ContentEncoding::Unsupported(name) => {
                return Err(CartaError::parse(
                    "storage.content_encoding_unsupported",
                    format!("unsupported content encoding `{name}`"),
                ));
            }
        };
    }

    Ok(decoded)
}

fn decode_gzip(body: &[u8]) -> CartaResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(Cursor::new(body));
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|error| {
        CartaError::parse(
            "storage.decode_failed",
            format!("gzip decode failed: {error}"),
        )
    })?;
    Ok(decoded)
}

fn decode_deflate(body: &[u8]) -> CartaResult<Vec<u8>> {
    // Servers disagree on whether "deflate" carries the zlib wrapper.
    let mut zlib_decoder = ZlibDecoder::new(Cursor::new(body));
    let mut zlib_decoded = Vec::new();
    if zlib_decoder.read_to_end(&mut zlib_decoded).is_ok() {
        return Ok(zlib_decoded);
    }

    let mut raw_decoder = DeflateDecoder::new(Cursor::new(body));
    let mut raw_decoded = Vec::new();
    raw_decoder.read_to_end(&mut raw_decoded).map_err(|error| {
        CartaError::parse(
            "storage.decode_failed",
            format!("deflate decode failed: {error}"),
        )
    })?;
    Ok(raw_decoded)
}

fn decode_brotli(body: &[u8]) -> CartaResult<Vec<u8>> {
    let mut decoder = Decompressor::new(Cursor::new(body), 4096);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|error| {
        CartaError::parse(
            "storage.decode_failed",
            format!("brotli decode failed: {error}"),
        )
    })?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::ContentEncoding;
    use super::decode_content_encoding;
    use super::parse_content_encodings;
    use brotli::CompressorWriter;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use flate2::write::GzEncoder;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    const BODY: &[u8] = b"<html><body>compressed payload</body></html>";

    fn decode(value: &str, body: &[u8]) -> Vec<u8> {
        match decode_content_encoding(&parse_content_encodings(value), body) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn decodes_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        assert!(encoder.write_all(BODY).is_ok());
        let encoded = encoder.finish().unwrap_or_else(|_| unreachable!());
        assert_eq!(decode("gzip", &encoded), BODY);
    }

    #[test]
    fn decodes_zlib_and_raw_deflate() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        assert!(zlib.write_all(BODY).is_ok());
        let zlib = zlib.finish().unwrap_or_else(|_| unreachable!());
        assert_eq!(decode("deflate", &zlib), BODY);

        let mut raw = DeflateEncoder::new(Vec::new(), Compression::default());
        assert!(raw.write_all(BODY).is_ok());
        let raw = raw.finish().unwrap_or_else(|_| unreachable!());
        assert_eq!(decode("deflate", &raw), BODY);
    }

    #[test]
    fn decodes_brotli() {
        let mut encoded = Vec::new();
        {
            let mut writer = CompressorWriter::new(&mut encoded, 4096, 5, 22);
            assert!(writer.write_all(BODY).is_ok());
        }
        assert_eq!(decode("br", &encoded), BODY);
    }

    #[test]
    fn stacked_encodings_are_undone_in_reverse() {
        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        assert!(gzip.write_all(BODY).is_ok());
        let gzip = gzip.finish().unwrap_or_else(|_| unreachable!());

        let mut both = Vec::new();
        {
            let mut writer = CompressorWriter::new(&mut both, 4096, 5, 22);
            assert!(writer.write_all(&gzip).is_ok());
        }
        assert_eq!(decode("gzip, br", &both), BODY);
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let encodings = parse_content_encodings("compress");
        assert_eq!(
            encodings,
            vec![ContentEncoding::Unsupported("compress".to_owned())]
        );
        let result = decode_content_encoding(&encodings, BODY);
        if let Err(error) = result {
            assert_eq!(error.code, "storage.content_encoding_unsupported");
        } else {
            panic!("expected unsupported encoding");
        }
    }
}
