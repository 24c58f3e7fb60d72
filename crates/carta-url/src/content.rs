//! Content types, MIME parsing and charset identifiers.

use carta_core::CartaError;
use carta_core::CartaResult;
use encoding_rs::Encoding;

/// Interpreted type of a resource body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    #[default]
    Undetermined,
    Unknown,
    Html,
    Xhtml,
    Text,
    Xml,
    Css,
    Javascript,
    Json,
    Png,
    Gif,
    Jpeg,
    Webp,
    Svg,
    Pdf,
    OctetStream,
    MultipartReplace,
}

const CONTENT_TYPES: [ContentType; 17] = [
    ContentType::Undetermined,
    ContentType::Unknown,
    ContentType::Html,
    ContentType::Xhtml,
    ContentType::Text,
    ContentType::Xml,
    ContentType::Css,
    ContentType::Javascript,
    ContentType::Json,
    ContentType::Png,
    ContentType::Gif,
    ContentType::Jpeg,
    ContentType::Webp,
    ContentType::Svg,
    ContentType::Pdf,
    ContentType::OctetStream,
    ContentType::MultipartReplace,
];

impl ContentType {
    pub fn from_mime(mime: &str) -> Self {
        match mime.trim().to_ascii_lowercase().as_str() {
            "text/html" => Self::Html,
            "application/xhtml+xml" => Self::Xhtml,
            "text/plain" => Self::Text,
            "text/xml" | "application/xml" => Self::Xml,
            "text/css" => Self::Css,
            "text/javascript" | "application/javascript" | "application/x-javascript" => {
                Self::Javascript
            }
            "application/json" => Self::Json,
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "image/jpeg" | "image/jpg" => Self::Jpeg,
            "image/webp" => Self::Webp,
            "image/svg+xml" => Self::Svg,
            "application/pdf" => Self::Pdf,
            "application/octet-stream" => Self::OctetStream,
            "multipart/x-mixed-replace" => Self::MultipartReplace,
            "" => Self::Undetermined,
            other if other.ends_with("+xml") => Self::Xml,
            other if other.starts_with("text/") => Self::Text,
            _ => Self::Unknown,
        }
    }

    /// Guess from the last path segment's extension.
    pub fn from_path(path: &str) -> Self {
        let segment = path.rsplit('/').next().unwrap_or(path);
        let Some((_, extension)) = segment.rsplit_once('.') else {
            return Self::Undetermined;
        };

        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Html,
            "xhtml" | "xht" => Self::Xhtml,
            "txt" => Self::Text,
            "xml" => Self::Xml,
            "css" => Self::Css,
            "js" | "mjs" => Self::Javascript,
            "json" => Self::Json,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "jpg" | "jpeg" => Self::Jpeg,
            "webp" => Self::Webp,
            "svg" => Self::Svg,
            "pdf" => Self::Pdf,
            _ => Self::Unknown,
        }
    }

    pub fn to_u32(self) -> u32 {
        CONTENT_TYPES
            .iter()
            .position(|kind| *kind == self)
            .map_or(0, |index| index as u32)
    }

    pub fn from_u32(value: u32) -> Self {
        CONTENT_TYPES
            .get(value as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    /// Types whose bytes are decoded through a charset by descriptors.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Self::Html
                | Self::Xhtml
                | Self::Text
                | Self::Xml
                | Self::Css
                | Self::Javascript
                | Self::Json
                | Self::Svg
        )
    }

    pub fn is_image(self) -> bool {
        matches!(
            self,
            Self::Png | Self::Gif | Self::Jpeg | Self::Webp | Self::Svg
        )
    }
}

/// Parsed `type/subtype; charset=...` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    pub essence: String,
    pub charset: Option<String>,
}

impl MimeType {
    /// Parses a MIME type. Values with non-ASCII bytes degrade to
    /// `application/octet-stream` rather than failing.
    pub fn parse(value: &str) -> CartaResult<Self> {
        if !value.is_ascii() {
            return Ok(Self {
                essence: "application/octet-stream".to_owned(),
                charset: None,
            });
        }

        let mut parts = value.split(';');
        let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let valid = essence
            .split_once('/')
            .is_some_and(|(kind, subtype)| {
                carta_net::http::is_token(kind) && carta_net::http::is_token(subtype)
            });
        if !valid {
            return Err(CartaError::parse(
                "url.mime.invalid",
                format!("`{value}` is not a MIME type"),
            ));
        }

        let mut charset = None;
        for parameter in parts {
            let Some((name, raw)) = parameter.split_once('=') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("charset") {
                let label = raw.trim().trim_matches('"').trim_matches('\'').trim();
                if !label.is_empty() {
                    charset = Some(label.to_ascii_lowercase());
                }
            }
        }

        Ok(Self { essence, charset })
    }

    pub fn is_text(&self) -> bool {
        self.essence.starts_with("text/")
    }
}

/// Encodings addressable by numeric id; id 0 means "none".
fn charsets() -> [&'static Encoding; 39] {
    [
        encoding_rs::UTF_8,
        encoding_rs::UTF_16LE,
        encoding_rs::UTF_16BE,
        encoding_rs::WINDOWS_1252,
        encoding_rs::ISO_8859_2,
        encoding_rs::ISO_8859_3,
        encoding_rs::ISO_8859_4,
        encoding_rs::ISO_8859_5,
        encoding_rs::ISO_8859_6,
        encoding_rs::ISO_8859_7,
        encoding_rs::ISO_8859_8,
        encoding_rs::ISO_8859_8_I,
        encoding_rs::ISO_8859_10,
        encoding_rs::ISO_8859_13,
        encoding_rs::ISO_8859_14,
        encoding_rs::ISO_8859_15,
        encoding_rs::ISO_8859_16,
        encoding_rs::WINDOWS_874,
        encoding_rs::WINDOWS_1250,
        encoding_rs::WINDOWS_1251,
        encoding_rs::WINDOWS_1253,
        encoding_rs::WINDOWS_1254,
        encoding_rs::WINDOWS_1255,
        encoding_rs::WINDOWS_1256,
        encoding_rs::WINDOWS_1257,
        encoding_rs::WINDOWS_1258,
        encoding_rs::KOI8_R,
        encoding_rs::KOI8_U,
        encoding_rs::IBM866,
        encoding_rs::MACINTOSH,
        encoding_rs::X_MAC_CYRILLIC,
        encoding_rs::SHIFT_JIS,
        encoding_rs::EUC_JP,
        encoding_rs::ISO_2022_JP,
        encoding_rs::EUC_KR,
        encoding_rs::GBK,
        encoding_rs::GB18030,
        encoding_rs::BIG5,
        encoding_rs::X_USER_DEFINED,
    ]
}

/// Numeric id for a charset label, 0 when the label is unknown.
pub fn charset_id(label: &str) -> u32 {
    Encoding::for_label(label.trim().as_bytes())
        .and_then(|encoding| charsets().iter().position(|known| *known == encoding))
        .map_or(0, |index| index as u32 + 1)
}

pub fn charset_for_id(id: u32) -> Option<&'static Encoding> {
    if id == 0 {
        return None;
    }
    charsets().get(id as usize - 1).copied()
}

pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::ContentType;
    use super::MimeType;
    use super::charset_for_id;
    use super::charset_id;

    #[test]
    fn maps_mime_and_extension() {
        assert_eq!(ContentType::from_mime("Text/HTML"), ContentType::Html);
        assert_eq!(ContentType::from_mime("application/atom+xml"), ContentType::Xml);
        assert_eq!(ContentType::from_path("/img/logo.PNG"), ContentType::Png);
        assert_eq!(ContentType::from_path("/dir.v2/file"), ContentType::Undetermined);
        assert_eq!(
            ContentType::from_u32(ContentType::Css.to_u32()),
            ContentType::Css
        );
    }

    #[test]
    fn parses_charset_parameter() {
        let mime = match MimeType::parse("text/html; charset=\"ISO-8859-1\"") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(mime.essence, "text/html");
        assert_eq!(mime.charset.as_deref(), Some("iso-8859-1"));
        assert!(mime.is_text());
    }

    #[test]
    fn non_ascii_degrades_to_octet_stream() {
        let mime = MimeType::parse("text/htmlé").unwrap_or_else(|_| unreachable!());
        assert_eq!(mime.essence, "application/octet-stream");
    }

    #[test]
    fn rejects_missing_subtype() {
        let result = MimeType::parse("texthtml");
        if let Err(error) = result {
            assert_eq!(error.code, "url.mime.invalid");
        } else {
            panic!("expected mime parse failure");
        }
    }

    #[test]
    fn charset_ids_follow_label_aliases() {
        let latin1 = charset_id("latin1");
        assert_eq!(latin1, charset_id("windows-1252"));
        assert_eq!(charset_for_id(latin1), Some(encoding_rs::WINDOWS_1252));
        assert_eq!(charset_id("no-such-charset"), 0);
        assert_eq!(charset_for_id(0), None);
    }
}
