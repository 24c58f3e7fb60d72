//! Host digests sent to the reputation service.

use base64ct::Base64;
use base64ct::Encoding;
use md5::Digest;
use md5::Md5;

/// Base64 of the MD5 of `input`'s UTF-8 bytes.
///
/// With `escape_plus`, every `+` becomes `%2B` so the value can sit in a
/// query string. The service recomputes this exact form.
pub fn calculate_md5_hash(input: &str, escape_plus: bool) -> String {
    let digest = Md5::digest(input.as_bytes());
    let encoded = Base64::encode_string(&digest);
    if escape_plus {
        encoded.replace('+', "%2B")
    } else {
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::calculate_md5_hash;

    #[test]
    fn known_answers() {
        assert_eq!(
            calculate_md5_hash("example.com-Oscar0308", true),
            "9biEkge8/fJVkhS0baEnZw=="
        );
        assert_eq!(
            calculate_md5_hash("evil.example.com-Oscar0308", false),
            "dxREcQ0upqXNBwd24dRzNg=="
        );
        assert_eq!(calculate_md5_hash("", false), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn plus_is_escaped_only_on_request() {
        assert_eq!(
            calculate_md5_hash("host2.example-Oscar0308", false),
            "h9khJ7l+hcj8oaEEaFnaZQ=="
        );
        let escaped = calculate_md5_hash("host2.example-Oscar0308", true);
        assert_eq!(escaped, "h9khJ7l%2Bhcj8oaEEaFnaZQ==");
        assert!(!escaped.contains('+'));
    }
}
