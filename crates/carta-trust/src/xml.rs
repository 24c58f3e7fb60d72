//! Incremental XML tokenizer.
//!
//! Input arrives in arbitrary pieces through [`XmlParser::feed`]; tokens are
//! handed to a [`TokenHandler`] as soon as they are complete. Element and
//! attribute names are reported by local name, without namespace prefix.
//! Comments, processing instructions and the doctype are skipped.

use carta_core::CartaError;
use carta_core::CartaResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlToken {
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
    /// Character data with entities decoded. CDATA sections arrive as text.
    Text(String),
}

impl XmlToken {
    /// Value of attribute `name` on a start tag.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match self {
            Self::StartTag { attributes, .. } => attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

/// Receives tokens from an [`XmlParser`]. An error stops the parser.
pub trait TokenHandler {
    fn handle_token(&mut self, token: &XmlToken) -> CartaResult<()>;
}

#[derive(Debug, Default)]
pub struct XmlParser {
    buffer: String,
    open: Vec<String>,
    seen_root: bool,
    stopped: bool,
    ended: bool,
}

fn malformed(message: impl Into<String>) -> CartaError {
    CartaError::parse("trust.xml.malformed", message)
}

fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':')
}

enum Step {
    /// Consumed this many bytes, maybe producing a token.
    Consumed(usize, Option<XmlToken>),
    NeedMore,
}

impl XmlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an error has stopped the parser for good.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Open elements, outermost first.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Parses as much of `chunk`, plus anything held back earlier, as forms
    /// complete tokens. The rest waits for the next call.
    pub fn feed(&mut self, chunk: &str, handler: &mut dyn TokenHandler) -> CartaResult<()> {
        self.ensure_running()?;
        self.buffer.push_str(chunk);
        self.run(handler, false)
    }

    /// Flushes held-back input and checks the document is complete.
    pub fn finish(&mut self, handler: &mut dyn TokenHandler) -> CartaResult<()> {
        self.ensure_running()?;
        self.run(handler, true)?;
        self.ended = true;

        let result = if !self.buffer.trim().is_empty() {
            Err(malformed("document ends inside markup"))
        } else if let Some(name) = self.open.last() {
            Err(malformed(format!("element <{name}> is never closed")))
        } else if !self.seen_root {
            Err(malformed("document has no root element"))
        } else {
            Ok(())
        };
        if result.is_err() {
            self.stopped = true;
        }
        result
    }

    fn ensure_running(&self) -> CartaResult<()> {
        if self.stopped {
            return Err(CartaError::invalid_state(
                "trust.xml.stopped",
                "parser stopped after an earlier error",
            ));
        }
        if self.ended {
            return Err(CartaError::invalid_state(
                "trust.xml.ended",
                "document already finished",
            ));
        }
        Ok(())
    }

    fn run(&mut self, handler: &mut dyn TokenHandler, last: bool) -> CartaResult<()> {
        let buffer = std::mem::take(&mut self.buffer);
        let mut position = 0;
        let result = loop {
            let rest = &buffer[position..];
            if rest.is_empty() {
                break Ok(());
            }
            let step = if rest.starts_with('<') {
                self.markup(rest)
            } else {
                self.text(rest, last)
            };
            match step {
                Ok(Step::Consumed(length, token)) => {
                    position += length;
                    if let Some(token) = token {
                        if let Err(error) = handler.handle_token(&token) {
                            break Err(error);
                        }
                    }
                }
                Ok(Step::NeedMore) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        self.buffer = buffer[position..].to_owned();
        if result.is_err() {
            self.stopped = true;
        }
        result
    }

    fn text(&mut self, rest: &str, last: bool) -> CartaResult<Step> {
        let length = match rest.find('<') {
            Some(end) => end,
            None if last => rest.len(),
            None => return Ok(Step::NeedMore),
        };
        let raw = &rest[..length];

        if self.open.is_empty() {
            if !raw.trim().is_empty() {
                return Err(malformed(format!(
                    "text outside the root element: `{}`",
                    raw.trim()
                )));
            }
            return Ok(Step::Consumed(length, None));
        }

        Ok(Step::Consumed(length, Some(XmlToken::Text(decode_entities(raw)?))))
    }

    fn markup(&mut self, rest: &str) -> CartaResult<Step> {
        const COMMENT: &str = "<!--";
        const CDATA: &str = "<![CDATA[";

        if rest.len() < CDATA.len() && (CDATA.starts_with(rest) || COMMENT.starts_with(rest)) {
            return Ok(Step::NeedMore);
        }

        if rest.starts_with(COMMENT) {
            return Ok(match rest[COMMENT.len()..].find("-->") {
                Some(end) => Step::Consumed(COMMENT.len() + end + 3, None),
                None => Step::NeedMore,
            });
        }

        if let Some(body) = rest.strip_prefix(CDATA) {
            let Some(end) = body.find("]]>") else {
                return Ok(Step::NeedMore);
            };
            if self.open.is_empty() {
                return Err(malformed("CDATA section outside the root element"));
            }
            let text = XmlToken::Text(body[..end].to_owned());
            return Ok(Step::Consumed(CDATA.len() + end + 3, Some(text)));
        }

        if rest.starts_with("<?") {
            return Ok(match rest.find("?>") {
                Some(end) => Step::Consumed(end + 2, None),
                None => Step::NeedMore,
            });
        }

        if rest.starts_with("<!") {
            return Ok(match declaration_end(rest) {
                Some(end) => Step::Consumed(end + 1, None),
                None => Step::NeedMore,
            });
        }

        if let Some(body) = rest.strip_prefix("</") {
            let Some(end) = body.find('>') else {
                return Ok(Step::NeedMore);
            };
            let name = body[..end].trim();
            let token = self.close(name)?;
            return Ok(Step::Consumed(end + 3, Some(token)));
        }

        let Some(end) = tag_end(rest) else {
            return Ok(Step::NeedMore);
        };
        let token = self.open_tag(&rest[1..end])?;
        Ok(Step::Consumed(end + 1, Some(token)))
    }

    fn open_tag(&mut self, inner: &str) -> CartaResult<XmlToken> {
        let (inner, self_closing) = match inner.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (inner, false),
        };

        let name_end = inner
            .find(|ch: char| ch.is_whitespace())
            .unwrap_or(inner.len());
        let name = &inner[..name_end];
        if name.is_empty() || !name.chars().all(is_name_char) {
            return Err(malformed(format!("bad element name `{name}`")));
        }

        if self.open.is_empty() && self.seen_root {
            return Err(malformed(format!("second root element <{name}>")));
        }
        self.seen_root = true;

        let attributes = parse_attributes(&inner[name_end..])?;
        if !self_closing {
            self.open.push(name.to_owned());
        }

        Ok(XmlToken::StartTag {
            name: local_name(name).to_owned(),
            attributes,
            self_closing,
        })
    }

    fn close(&mut self, name: &str) -> CartaResult<XmlToken> {
        match self.open.pop() {
            Some(open) if open == name => Ok(XmlToken::EndTag {
                name: local_name(name).to_owned(),
            }),
            Some(open) => Err(malformed(format!("</{name}> closes <{open}>"))),
            None => Err(malformed(format!("</{name}> without an open element"))),
        }
    }
}

/// Index of the `>` ending a start tag, skipping quoted attribute values.
fn tag_end(rest: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (index, ch) in rest.char_indices().skip(1) {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch == '>' => return Some(index),
            None => {}
        }
    }
    None
}

/// Index of the `>` ending a `<!...>` declaration, skipping an internal
/// subset in brackets.
fn declaration_end(rest: &str) -> Option<usize> {
    let mut depth = 0_usize;
    for (index, ch) in rest.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return Some(index),
            _ => {}
        }
    }
    None
}

fn parse_attributes(mut rest: &str) -> CartaResult<Vec<(String, String)>> {
    let mut attributes = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(attributes);
        }

        let name_end = rest
            .find(|ch: char| !is_name_char(ch))
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        if name.is_empty() {
            return Err(malformed(format!("bad attribute near `{rest}`")));
        }

        let after = rest[name_end..].trim_start();
        let Some(after) = after.strip_prefix('=') else {
            return Err(malformed(format!("attribute `{name}` has no value")));
        };
        let after = after.trim_start();
        let Some(quote) = after.chars().next().filter(|ch| *ch == '"' || *ch == '\'') else {
            return Err(malformed(format!("attribute `{name}` value is not quoted")));
        };
        let Some(value_end) = after[1..].find(quote) else {
            return Err(malformed(format!("attribute `{name}` value is not closed")));
        };

        let value = decode_entities(&after[1..1 + value_end])?;
        attributes.push((local_name(name).to_owned(), value));
        rest = &after[value_end + 2..];
    }
}

/// Replaces the predefined and numeric character references.
pub fn decode_entities(raw: &str) -> CartaResult<String> {
    if !raw.contains('&') {
        return Ok(raw.to_owned());
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find(';') else {
            return Err(entity_error(after));
        };
        let entity = &after[..end];
        let ch = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => numeric_reference(entity).ok_or_else(|| entity_error(entity))?,
        };
        out.push(ch);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn numeric_reference(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let value = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    char::from_u32(value)
}

fn entity_error(entity: &str) -> CartaError {
    let shown: String = entity.chars().take(16).collect();
    CartaError::parse(
        "trust.xml.entity_invalid",
        format!("unknown or unterminated entity `&{shown}`"),
    )
}

#[cfg(test)]
mod tests {
    use super::TokenHandler;
    use super::XmlParser;
    use super::XmlToken;
    use super::decode_entities;
    use carta_core::CartaResult;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Collect {
        tokens: Vec<XmlToken>,
    }

    impl TokenHandler for Collect {
        fn handle_token(&mut self, token: &XmlToken) -> CartaResult<()> {
            self.tokens.push(token.clone());
            Ok(())
        }
    }

    fn start(name: &str, attributes: &[(&str, &str)], self_closing: bool) -> XmlToken {
        XmlToken::StartTag {
            name: name.to_owned(),
            attributes: attributes
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
            self_closing,
        }
    }

    fn end(name: &str) -> XmlToken {
        XmlToken::EndTag {
            name: name.to_owned(),
        }
    }

    fn parse_pieces(pieces: &[&str]) -> Vec<XmlToken> {
        let mut parser = XmlParser::new();
        let mut collect = Collect::default();
        for piece in pieces {
            if let Err(error) = parser.feed(piece, &mut collect) {
                panic!("{error}");
            }
        }
        if let Err(error) = parser.finish(&mut collect) {
            panic!("{error}");
        }
        collect.tokens
    }

    #[test]
    fn tokenizes_a_document() {
        let tokens = parse_pieces(&[
            "<?xml version=\"1.0\"?>\n<!DOCTYPE t [<!ENTITY x \"y\">]>",
            "<t:root xmlns:t=\"urn:x\"><!-- note --><a k='1' t:b=\"x &amp; y\">hi &lt;there&gt;</a>",
            "<br/><![CDATA[<raw>]]></t:root>\n",
        ]);
        assert_eq!(
            tokens,
            vec![
                start("root", &[("t", "urn:x")], false),
                start("a", &[("k", "1"), ("b", "x & y")], false),
                XmlToken::Text("hi <there>".to_owned()),
                end("a"),
                start("br", &[], true),
                XmlToken::Text("<raw>".to_owned()),
                end("root"),
            ]
        );
    }

    #[test]
    fn tokens_split_across_feeds_are_joined() {
        let document = "<root><item id=\"7\">text &#65;&#x42;</item><!-- c --></root>";
        let whole = parse_pieces(&[document]);
        let bytes: Vec<String> = document.chars().map(String::from).collect();
        let pieces: Vec<&str> = bytes.iter().map(String::as_str).collect();
        let split = parse_pieces(&pieces);

        let text: String = split
            .iter()
            .filter_map(|token| match token {
                XmlToken::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "text AB");
        let tags = |tokens: &[XmlToken]| {
            tokens
                .iter()
                .filter(|token| !matches!(token, XmlToken::Text(_)))
                .cloned()
                .collect::<Vec<_>>()
        };
        assert_eq!(tags(&split), tags(&whole));
    }

    #[test]
    fn attribute_lookup() {
        let token = start("r", &[("src", "7")], false);
        assert_eq!(token.attribute("src"), Some("7"));
        assert_eq!(token.attribute("id"), None);
        assert_eq!(end("r").attribute("src"), None);
    }

    #[test]
    fn mismatched_tags_stop_the_parser() {
        let mut parser = XmlParser::new();
        let mut collect = Collect::default();
        assert!(matches!(
            parser.feed("<a><b></a>", &mut collect),
            Err(error) if error.code == "trust.xml.malformed"
        ));
        assert!(parser.is_stopped());
        assert!(matches!(
            parser.feed("</b>", &mut collect),
            Err(error) if error.code == "trust.xml.stopped"
        ));
    }

    #[test]
    fn incomplete_documents_fail_on_finish() {
        for document in ["", "<a>", "<a></a><b/>", "text", "<a x=1/>", "<a></a><!-- open"] {
            let mut parser = XmlParser::new();
            let mut collect = Collect::default();
            let fed = parser.feed(document, &mut collect);
            let finished = fed.and_then(|()| parser.finish(&mut collect));
            assert!(finished.is_err(), "accepted `{document}`");
        }
    }

    #[test]
    fn handler_errors_stop_the_parser() {
        struct Refuse;
        impl TokenHandler for Refuse {
            fn handle_token(&mut self, _token: &XmlToken) -> CartaResult<()> {
                Err(carta_core::CartaError::parse("test.refused", "no"))
            }
        }

        let mut parser = XmlParser::new();
        assert!(matches!(
            parser.feed("<a/>", &mut Refuse),
            Err(error) if error.code == "test.refused"
        ));
        assert!(parser.is_stopped());
    }

    #[test]
    fn entities() {
        assert!(matches!(decode_entities("a &amp; b"), Ok(text) if text == "a & b"));
        assert!(matches!(decode_entities("&#x263A;&#9731;"), Ok(text) if text == "☺☃"));
        assert!(matches!(
            decode_entities("&nbsp;"),
            Err(error) if error.code == "trust.xml.entity_invalid"
        ));
        assert!(matches!(
            decode_entities("&amp"),
            Err(error) if error.code == "trust.xml.entity_invalid"
        ));
    }
}
