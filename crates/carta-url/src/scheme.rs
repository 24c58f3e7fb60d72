//! Scheme classification.

/// Scheme families the engine knows how to treat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UrlType {
    Http,
    Https,
    Ftp,
    File,
    Data,
    About,
    Javascript,
    Mailto,
    #[default]
    Unknown,
}

impl UrlType {
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "http" => Self::Http,
            "https" => Self::Https,
            "ftp" => Self::Ftp,
            "file" => Self::File,
            "data" => Self::Data,
            "about" => Self::About,
            "javascript" => Self::Javascript,
            "mailto" => Self::Mailto,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
            Self::File => "file",
            Self::Data => "data",
            Self::About => "about",
            Self::Javascript => "javascript",
            Self::Mailto => "mailto",
            Self::Unknown => "",
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Http => 1,
            Self::Https => 2,
            Self::Ftp => 3,
            Self::File => 4,
            Self::Data => 5,
            Self::About => 6,
            Self::Javascript => 7,
            Self::Mailto => 8,
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Http => Some(80),
            Self::Https => Some(443),
            Self::Ftp => Some(21),
            _ => None,
        }
    }

    /// Schemes written as `scheme://authority/path`.
    pub fn has_authority(self) -> bool {
        matches!(self, Self::Http | Self::Https | Self::Ftp | Self::File)
    }

    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https)
    }

    pub fn supports_resume(self) -> bool {
        matches!(self, Self::Http | Self::Https | Self::Ftp)
    }

    /// Schemes the manager can retrieve.
    pub fn is_loadable(self) -> bool {
        matches!(
            self,
            Self::Http | Self::Https | Self::Ftp | Self::File | Self::Data | Self::About
        )
    }
}

#[cfg(test)]
mod tests {
    use super::UrlType;

    #[test]
    fn maps_schemes() {
        assert_eq!(UrlType::from_scheme("https"), UrlType::Https);
        assert_eq!(UrlType::from_scheme("gopher"), UrlType::Unknown);
        assert_eq!(UrlType::Https.default_port(), Some(443));
        assert!(UrlType::File.has_authority());
        assert!(!UrlType::Data.has_authority());
        assert!(!UrlType::Javascript.is_loadable());
    }
}
