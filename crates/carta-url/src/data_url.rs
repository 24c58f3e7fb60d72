//! `data:` payload decoding.

use base64ct::Base64;
use base64ct::Encoding;
use carta_core::CartaError;
use carta_core::CartaResult;
use percent_encoding::percent_decode_str;

const DEFAULT_MIME: &str = "text/plain;charset=US-ASCII";

/// Decoded `data:` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    /// MIME type with parameters, as written or the default.
    pub mime: String,
    pub body: Vec<u8>,
}

/// Decodes the part after `data:`.
pub fn decode_data_url(body: &str) -> CartaResult<DataUrl> {
    let Some((meta, payload)) = body.split_once(',') else {
        return Err(CartaError::parse(
            "url.data.missing_comma",
            "data URL has no `,` before its payload",
        ));
    };

    let meta = meta.trim();
    let (meta, base64) = match meta.len().checked_sub(7) {
        Some(split) if meta.is_char_boundary(split) && meta[split..].eq_ignore_ascii_case(";base64") => {
            (&meta[..split], true)
        }
        _ => (meta, false),
    };

    let mime = if meta.is_empty() {
        DEFAULT_MIME.to_owned()
    } else if meta.starts_with(';') {
        format!("text/plain{meta}")
    } else {
        percent_decode_str(meta).decode_utf8_lossy().into_owned()
    };

    let bytes: Vec<u8> = percent_decode_str(payload).collect();
    let body = if base64 {
        decode_base64(&bytes)?
    } else {
        bytes
    };

    Ok(DataUrl { mime, body })
}

fn decode_base64(encoded: &[u8]) -> CartaResult<Vec<u8>> {
    let mut text: String = encoded
        .iter()
        .filter(|byte| !byte.is_ascii_whitespace())
        .map(|byte| char::from(*byte))
        .collect();
    while text.len() % 4 != 0 {
        text.push('=');
    }

    Base64::decode_vec(&text).map_err(|error| {
        CartaError::parse("url.data.base64_invalid", format!("bad base64 payload: {error}"))
    })
}

#[cfg(test)]
mod tests {
    use super::decode_data_url;

    #[test]
    fn decodes_percent_payload_with_default_type() {
        match decode_data_url(",hello%20world") {
            Ok(data) => {
                assert_eq!(data.mime, "text/plain;charset=US-ASCII");
                assert_eq!(data.body, b"hello world");
            }
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn decodes_base64_payload() {
        match decode_data_url("text/html;base64,PGI+aGk8L2I+") {
            Ok(data) => {
                assert_eq!(data.mime, "text/html");
                assert_eq!(data.body, b"<b>hi</b>");
            }
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn tolerates_missing_padding_and_whitespace() {
        match decode_data_url(";base64,aGV s bG8") {
            Ok(data) => {
                assert_eq!(data.mime, "text/plain;charset=US-ASCII");
                assert_eq!(data.body, b"hello");
            }
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn rejects_missing_comma_and_bad_base64() {
        assert!(matches!(
            decode_data_url("text/plain"),
            Err(error) if error.code == "url.data.missing_comma"
        ));
        assert!(matches!(
            decode_data_url(";base64,!!!!"),
            Err(error) if error.code == "url.data.base64_invalid"
        ));
    }
}
