//! Pull-based readers over a resource body.

use crate::attr::StrAttr;
use crate::content::ContentType;
use crate::content::encoding_for_label;
use crate::handle::Handle;
use crate::rep::InUse;
use crate::rep::LoadStatus;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::try_extend_bytes;
use carta_event::SinkId;
use core::fmt;
use encoding_rs::CoderResult;
use encoding_rs::Decoder;
use encoding_rs::Encoding;
use tracing::debug;

/// How a descriptor presents the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorOptions {
    /// Hand out bytes as stored, without charset conversion.
    pub raw: bool,
    /// Keep content encodings (gzip and friends) instead of undoing them.
    pub keep_content_encoding: bool,
    /// Charset to use regardless of what the response declared.
    pub override_charset: Option<String>,
    /// Charset of the embedding document, used when nothing else is known.
    pub parent_charset: Option<String>,
}

/// Reader over one resource body.
///
/// Call [`DataDescriptor::retrieve_data`] to pull newly available bytes into
/// the buffer, read [`DataDescriptor::buffer`], then
/// [`DataDescriptor::consume_data`] what was handled. In text mode the buffer
/// holds UTF-8.
pub struct DataDescriptor {
    handle: Handle,
    _in_use: InUse,
    sink: Option<SinkId>,
    raw: bool,
    decode_content: bool,
    chunk_limit: usize,
    source_position: usize,
    /// Storage generation the position refers to.
    generation: Option<u64>,
    decoded_body: Option<Vec<u8>>,
    decoder: Option<Decoder>,
    requested: &'static Encoding,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl fmt::Debug for DataDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDescriptor")
            .field("handle", &self.handle)
            .field("raw", &self.raw)
            .field("position", &self.source_position)
            .field("buffered", &self.buffer.len())
            .field("charset", &self.detected_charset())
            .finish_non_exhaustive()
    }
}

impl DataDescriptor {
    pub(crate) fn new(
        handle: Handle,
        sink: Option<SinkId>,
        options: &DescriptorOptions,
        default_charset: &'static Encoding,
        chunk_limit: usize,
    ) -> Self {
        let content_type = handle.content_type();
        let raw = options.raw
            || !(content_type.is_text()
                || matches!(content_type, ContentType::Undetermined | ContentType::Unknown));

        let declared = handle.string(StrAttr::CharsetName);
        let requested = options
            .override_charset
            .as_deref()
            .and_then(encoding_for_label)
            .or_else(|| encoding_for_label(&declared))
            .or_else(|| options.parent_charset.as_deref().and_then(encoding_for_label))
            .unwrap_or(default_charset);

        Self {
            _in_use: InUse::new(&handle),
            handle,
            sink,
            raw,
            decode_content: !options.keep_content_encoding,
            chunk_limit: chunk_limit.max(1),
            source_position: 0,
            generation: None,
            decoded_body: None,
            decoder: (!raw).then(|| requested.new_decoder()),
            requested,
            buffer: Vec::new(),
            exhausted: false,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn sink(&self) -> Option<SinkId> {
        self.sink
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Pulls up to one chunk of new body bytes into the buffer.
    ///
    /// Returns the number of buffered bytes and whether more are expected.
    pub fn retrieve_data(&mut self) -> CartaResult<(usize, bool)> {
        let Some(rep) = self.handle.rep().cloned() else {
            return Ok((self.buffer.len(), false));
        };
        let state = rep.state.borrow();
        let Some(storage) = state.storage.as_ref() else {
            return Ok((self.buffer.len(), false));
        };

        let generation = storage.body.generation();
        if self.generation.is_some_and(|seen| seen != generation) {
            debug!(source = rep.id().0, "body part replaced, restarting descriptor");
            self.source_position = 0;
            self.decoded_body = None;
            self.exhausted = false;
            self.decoder = (!self.raw).then(|| self.requested.new_decoder());
        }
        self.generation = Some(generation);

        let finished = storage.body.is_finished() || state.status != LoadStatus::Loading;
        let encoded = self.decode_content && storage.body.is_encoded();
        if encoded && !finished {
            // Compressed streams are decoded once complete.
            return Ok((self.buffer.len(), true));
        }
        let mut decoded_body = self.decoded_body.take();
        if encoded && decoded_body.is_none() {
            decoded_body = Some(storage.body.decoded()?);
        }

        let source: &[u8] = match &decoded_body {
            Some(decoded) => decoded,
            None => storage.body.bytes(),
        };

        let available = source.get(self.source_position..).unwrap_or_default();
        let take = available.len().min(self.chunk_limit);
        let chunk = &available[..take];
        let last = finished && take == available.len();

        if self.raw {
            try_extend_bytes(&mut self.buffer, chunk, "url.descriptor.out_of_memory")?;
        } else if !self.exhausted {
            self.decode_chunk(chunk, last)?;
        }
        self.source_position += take;
        if last {
            self.exhausted = true;
        }

        let more = !(finished && self.source_position == source.len());
        self.decoded_body = decoded_body;
        Ok((self.buffer.len(), more))
    }

    fn decode_chunk(&mut self, chunk: &[u8], last: bool) -> CartaResult<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };

        let mut text = String::new();
        let mut remaining = chunk;
        loop {
            reserve_decoded(decoder, &mut text, remaining.len())?;
            let (result, read, _) = decoder.decode_to_string(remaining, &mut text, last);
            remaining = &remaining[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => {}
            }
        }
        try_extend_bytes(&mut self.buffer, text.as_bytes(), "url.descriptor.out_of_memory")
    }

    /// Buffered bytes not yet consumed.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Buffered text, for descriptors in text mode.
    pub fn text(&self) -> Option<&str> {
        if self.raw {
            return None;
        }
        std::str::from_utf8(&self.buffer).ok()
    }

    /// Drops up to `count` bytes from the front of the buffer. In text mode
    /// the cut moves back to a character boundary. Returns the bytes dropped.
    pub fn consume_data(&mut self, count: usize) -> usize {
        let mut count = count.min(self.buffer.len());
        if !self.raw {
            while count > 0 && count < self.buffer.len() && (self.buffer[count] & 0xC0) == 0x80 {
                count -= 1;
            }
        }
        self.buffer.drain(..count);
        count
    }

    /// Charset actually used; a byte order mark overrides the request.
    pub fn detected_charset(&self) -> &'static str {
        match &self.decoder {
            Some(decoder) => decoder.encoding().name(),
            None => self.requested.name(),
        }
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted || !self.buffer.is_empty()
    }
}

fn reserve_decoded(decoder: &Decoder, text: &mut String, input: usize) -> CartaResult<()> {
    let Some(capacity) = decoder.max_utf8_buffer_length(input) else {
        return Err(CartaError::out_of_memory(
            "url.descriptor.out_of_memory",
            "decoded chunk size overflows",
        ));
    };
    text.try_reserve(capacity.max(4)).map_err(|error| {
        CartaError::out_of_memory("url.descriptor.out_of_memory", error.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::DescriptorOptions;
    use crate::handle::Handle;
    use crate::handle::Redirect;
    use crate::manager::LoadOptions;
    use crate::manager::ManagerConfig;
    use crate::manager::UrlManager;
    use carta_core::ManualClock;
    use carta_event::MessageQueue;
    use carta_event::QueueConfig;
    use carta_net::MemoryResponse;
    use carta_net::MemoryTransport;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::rc::Rc;

    fn loaded(url: &str, response: MemoryResponse, config: ManagerConfig) -> (UrlManager, Handle) {
        let queue = match MessageQueue::new(QueueConfig::default()) {
            Ok(queue) => queue,
            Err(error) => panic!("{error}"),
        };
        let transport = MemoryTransport::new();
        transport.respond(url, response);
        let mut manager = match UrlManager::new(
            config,
            queue.clone(),
            Box::new(transport),
            Rc::new(ManualClock::at_secs(1_000)),
        ) {
            Ok(manager) => manager,
            Err(error) => panic!("{error}"),
        };
        let handle = manager.get_url(url);
        let sink = queue.open_sink();
        if let Err(error) = manager.load(&handle, sink, &LoadOptions::default()) {
            panic!("{error}");
        }
        manager.process_events();
        (manager, handle)
    }

    fn read_all(manager: &UrlManager, handle: &Handle, options: &DescriptorOptions) -> Vec<u8> {
        let Some(mut descriptor) =
            manager.get_descriptor(handle, None, Redirect::Follow, options)
        else {
            panic!("no descriptor");
        };
        let mut out = Vec::new();
        loop {
            let more = match descriptor.retrieve_data() {
                Ok((_, more)) => more,
                Err(error) => panic!("{error}"),
            };
            let count = descriptor.buffer().len();
            out.extend_from_slice(descriptor.buffer());
            descriptor.consume_data(count);
            if !more {
                break;
            }
        }
        out
    }

    #[test]
    fn transcodes_declared_charset_to_utf8() {
        let (manager, handle) = loaded(
            "http://a.test/latin",
            MemoryResponse::ok("text/plain; charset=iso-8859-1", b"caf\xe9"),
            ManagerConfig::default(),
        );
        let text = read_all(&manager, &handle, &DescriptorOptions::default());
        assert_eq!(String::from_utf8_lossy(&text), "café");
    }

    #[test]
    fn long_chunks_are_transcoded_whole() {
        let body = vec![0xe9; 5000];
        let (manager, handle) = loaded(
            "http://a.test/long",
            MemoryResponse::ok("text/plain; charset=iso-8859-1", &body),
            ManagerConfig::default(),
        );
        let text = read_all(&manager, &handle, &DescriptorOptions::default());
        assert_eq!(text.len(), 10_000);
        assert_eq!(String::from_utf8_lossy(&text), "é".repeat(5000));
    }

    #[test]
    fn override_charset_beats_declared_one() {
        let (manager, handle) = loaded(
            "http://a.test/koi",
            MemoryResponse::ok("text/plain; charset=iso-8859-1", b"\xc1"),
            ManagerConfig::default(),
        );
        let options = DescriptorOptions {
            override_charset: Some("koi8-r".to_owned()),
            ..DescriptorOptions::default()
        };
        let Some(descriptor) = manager.get_descriptor(&handle, None, Redirect::Follow, &options)
        else {
            panic!("no descriptor");
        };
        assert_eq!(descriptor.detected_charset(), "KOI8-R");
        assert_eq!(String::from_utf8_lossy(&read_all(&manager, &handle, &options)), "а");
    }

    #[test]
    fn byte_order_mark_wins_over_request() {
        let (manager, handle) = loaded(
            "http://a.test/bom",
            MemoryResponse::ok("text/plain; charset=windows-1252", b"\xef\xbb\xbfhi"),
            ManagerConfig::default(),
        );
        let Some(mut descriptor) =
            manager.get_descriptor(&handle, None, Redirect::Follow, &DescriptorOptions::default())
        else {
            panic!("no descriptor");
        };
        assert!(descriptor.retrieve_data().is_ok());
        assert_eq!(descriptor.text(), Some("hi"));
        assert_eq!(descriptor.detected_charset(), "UTF-8");
    }

    #[test]
    fn gzip_bodies_are_decoded_unless_kept() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if let Err(error) = encoder.write_all(b"compressed text") {
            panic!("{error}");
        }
        let body = match encoder.finish() {
            Ok(body) => body,
            Err(error) => panic!("{error}"),
        };
        let (manager, handle) = loaded(
            "http://a.test/gz",
            MemoryResponse::ok("text/plain", &body).with_header("Content-Encoding", "gzip"),
            ManagerConfig::default(),
        );

        let text = read_all(&manager, &handle, &DescriptorOptions::default());
        assert_eq!(text, b"compressed text");

        let kept = DescriptorOptions {
            raw: true,
            keep_content_encoding: true,
            ..DescriptorOptions::default()
        };
        assert_eq!(read_all(&manager, &handle, &kept), body);
    }

    #[test]
    fn brotli_bodies_are_decoded() {
        let mut body = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut body, 4096, 5, 22);
            if let Err(error) = writer.write_all(b"brotli text") {
                panic!("{error}");
            }
        }
        let (manager, handle) = loaded(
            "http://a.test/br",
            MemoryResponse::ok("text/plain", &body).with_header("Content-Encoding", "br"),
            ManagerConfig::default(),
        );
        assert_eq!(
            read_all(&manager, &handle, &DescriptorOptions::default()),
            b"brotli text"
        );
    }

    #[test]
    fn chunk_limit_splits_retrieval() {
        let config = ManagerConfig {
            descriptor_chunk_bytes: 4,
            ..ManagerConfig::default()
        };
        let (manager, handle) = loaded(
            "http://a.test/img.png",
            MemoryResponse::ok("image/png", b"0123456789"),
            config,
        );
        let Some(mut descriptor) =
            manager.get_descriptor(&handle, None, Redirect::Follow, &DescriptorOptions::default())
        else {
            panic!("no descriptor");
        };
        assert!(descriptor.is_raw());
        assert!(matches!(descriptor.retrieve_data(), Ok((4, true))));
        assert_eq!(descriptor.consume_data(2), 2);
        assert!(matches!(descriptor.retrieve_data(), Ok((6, true))));
        assert_eq!(descriptor.buffer(), b"234567");
        assert_eq!(descriptor.consume_data(100), 6);
        assert!(matches!(descriptor.retrieve_data(), Ok((2, false))));
        assert_eq!(descriptor.buffer(), b"89");
    }

    #[test]
    fn consume_keeps_characters_whole() {
        let (manager, handle) = loaded(
            "http://a.test/utf8",
            MemoryResponse::ok("text/plain; charset=utf-8", "né".as_bytes()),
            ManagerConfig::default(),
        );
        let Some(mut descriptor) =
            manager.get_descriptor(&handle, None, Redirect::Follow, &DescriptorOptions::default())
        else {
            panic!("no descriptor");
        };
        assert!(descriptor.retrieve_data().is_ok());
        assert_eq!(descriptor.consume_data(2), 1);
        assert_eq!(descriptor.text(), Some("é"));
    }
}
