//! Body storage attached to a resource while and after it loads.

pub mod encoding;

use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::try_extend_bytes;
use serde::Deserialize;
use serde::Serialize;

pub use encoding::ContentEncoding;
pub use encoding::decode_content_encoding;
pub use encoding::parse_content_encodings;

const DEFAULT_MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Where a resource's bytes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Memory,
    Disk,
    /// A local file opened by the user; never revalidated.
    UserFile,
    Temporary,
    /// Streamed once and not kept.
    Stream,
}

impl CacheType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::UserFile => "user_file",
            Self::Temporary => "temporary",
            Self::Stream => "stream",
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Memory => 0,
            Self::Disk => 1,
            Self::UserFile => 2,
            Self::Temporary => 3,
            Self::Stream => 4,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Disk,
            2 => Self::UserFile,
            3 => Self::Temporary,
            4 => Self::Stream,
            _ => Self::Memory,
        }
    }
}

/// Storage limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_body_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> CartaResult<()> {
        if self.max_body_bytes == 0 {
            return Err(CartaError::policy(
                "storage.max_body_invalid",
                "max_body_bytes must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Loaded bytes of one resource.
///
/// Multipart responses replace the body with each new part. `generation`
/// counts those replacements so readers can tell a fresh part from more bytes
/// of the one they were reading.
#[derive(Debug, Clone)]
pub struct ResourceStorage {
    config: StorageConfig,
    cache_type: CacheType,
    body: Vec<u8>,
    generation: u64,
    total_loaded: u64,
    finished: bool,
    encodings: Vec<ContentEncoding>,
}

impl ResourceStorage {
    pub fn new(config: StorageConfig, cache_type: CacheType) -> Self {
        Self {
            config,
            cache_type,
            body: Vec::new(),
            generation: 0,
            total_loaded: 0,
            finished: false,
            encodings: Vec::new(),
        }
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn set_cache_type(&mut self, cache_type: CacheType) {
        self.cache_type = cache_type;
    }

    pub fn set_encodings(&mut self, encodings: Vec<ContentEncoding>) {
        self.encodings = encodings;
    }

    pub fn encodings(&self) -> &[ContentEncoding] {
        &self.encodings
    }

    pub fn is_encoded(&self) -> bool {
        self.encodings
            .iter()
            .any(|encoding| *encoding != ContentEncoding::Identity)
    }

    /// Appends to the current body part. Nothing is kept on failure.
    ///
    /// `max_body_bytes` bounds a single part, not the whole stream.
    pub fn append(&mut self, bytes: &[u8]) -> CartaResult<()> {
        let grown = (self.body.len() as u64).saturating_add(bytes.len() as u64);
        if grown > self.config.max_body_bytes {
            return Err(CartaError::out_of_memory(
                "storage.body_too_large",
                format!(
                    "body would exceed max_body_bytes ({grown} > {})",
                    self.config.max_body_bytes
                ),
            ));
        }

        try_extend_bytes(&mut self.body, bytes, "storage.out_of_memory")?;
        self.total_loaded = self.total_loaded.saturating_add(bytes.len() as u64);
        Ok(())
    }

    /// Starts a new body part; the previous part is released.
    pub fn start_new_part(&mut self) {
        self.body = Vec::new();
        self.generation = self.generation.wrapping_add(1);
        self.finished = false;
    }

    /// Changes whenever the visible bytes are replaced rather than extended.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Raw bytes of the current body part.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Bytes received across every part since the storage was created.
    pub fn total_loaded(&self) -> u64 {
        self.total_loaded
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drops every byte, keeping the configuration and cache type.
    pub fn clear(&mut self) {
        self.body = Vec::new();
        self.generation = self.generation.wrapping_add(1);
        self.total_loaded = 0;
        self.finished = false;
        self.encodings.clear();
    }

    /// Current body part with content encodings removed.
    pub fn decoded(&self) -> CartaResult<Vec<u8>> {
        decode_content_encoding(&self.encodings, self.bytes())
    }
}
