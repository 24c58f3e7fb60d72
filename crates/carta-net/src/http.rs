//! HTTP request/response pieces shared by the transport and the resource layer.

use carta_core::CartaError;
use carta_core::CartaResult;

/// Outbound HTTP methods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    /// Any other RFC 7230 token.
    Special(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Special(name) => name,
        }
    }

    pub fn parse(value: &str) -> CartaResult<Self> {
        if !is_token(value) {
            return Err(CartaError::parse(
                "net.http.method_invalid",
                format!("`{value}` is not a valid HTTP method token"),
            ));
        }

        Ok(match value.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            _ => Self::Special(value.to_owned()),
        })
    }

    /// Numeric form stored in the uint attribute space.
    pub fn to_u32(&self) -> u32 {
        match self {
            Self::Get => 0,
            Self::Post => 1,
            Self::Head => 2,
            Self::Put => 3,
            Self::Delete => 4,
            Self::Options => 5,
            Self::Special(_) => 6,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Get),
            1 => Some(Self::Post),
            2 => Some(Self::Head),
            3 => Some(Self::Put),
            4 => Some(Self::Delete),
            5 => Some(Self::Options),
            _ => None,
        }
    }

    /// Responses to these methods are not shareable between documents.
    pub fn forces_unique(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

/// Single HTTP header with validated wire-safe name/value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: &str) -> CartaResult<Self> {
        if !is_token(name) {
            return Err(CartaError::parse(
                "net.http.header_name_invalid",
                format!("invalid HTTP header name `{name}`"),
            ));
        }

        if value.bytes().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
            return Err(CartaError::parse(
                "net.http.header_value_invalid",
                format!("invalid characters found in HTTP header `{name}`"),
            ));
        }

        Ok(Self {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }
}

/// Case-insensitive lookup of the first header named `name`.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

pub fn is_redirect_status(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// RFC 7230 `token`.
pub fn is_token(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(is_token_char)
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
