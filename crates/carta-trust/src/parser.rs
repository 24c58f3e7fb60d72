//! Reads the sitecheck XML answer into a blacklist.

use crate::xml::TokenHandler;
use crate::xml::XmlParser;
use crate::xml::XmlToken;
use carta_core::CartaResult;
use carta_security::Advisory;
use carta_security::FraudList;
use carta_security::FraudType;
use tracing::debug;
use tracing::warn;

/// Everything one answer said about a host.
#[derive(Debug, Clone, Default)]
pub struct TrustInfo {
    pub host: Option<String>,
    /// Seconds the verdict may be reused without asking again.
    pub client_expiry: Option<u64>,
    pub list: FraudList,
    /// `<r>` patterns that could not be compiled and were left out.
    pub rejected_patterns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementType {
    Host,
    ClientExpire,
    RegExp,
    Url,
    Source,
    Other,
}

impl ElementType {
    fn from_name(name: &str) -> Self {
        match name {
            "host" => Self::Host,
            "ce" => Self::ClientExpire,
            "r" => Self::RegExp,
            "u" => Self::Url,
            "source" => Self::Source,
            _ => Self::Other,
        }
    }
}

fn numeric_attribute(token: &XmlToken, name: &str) -> u32 {
    token
        .attribute(name)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[derive(Debug)]
struct TrustInfoHandler {
    element: ElementType,
    source_id: u32,
    advisory: Option<Advisory>,
    text: String,
    max_pattern_bytes: usize,
    info: TrustInfo,
}

impl TrustInfoHandler {
    fn start_element(&mut self, token: &XmlToken, name: &str) {
        self.element = ElementType::from_name(name);
        self.text.clear();
        self.source_id = numeric_attribute(token, "src");
        if self.element == ElementType::Source {
            self.advisory = Some(Advisory {
                id: numeric_attribute(token, "id"),
                fraud_type: FraudType::from_u32(numeric_attribute(token, "type")),
                homepage: token.attribute("homepage").unwrap_or_default().to_owned(),
                advisory_url: token.attribute("advisory").unwrap_or_default().to_owned(),
                text: String::new(),
            });
        }
    }

    fn end_element(&mut self) {
        let text = self.text.trim();
        match self.element {
            ElementType::Host => {
                if !text.is_empty() {
                    self.info.host = Some(text.to_owned());
                }
            }
            ElementType::ClientExpire => match text.parse::<u64>() {
                Ok(seconds) => self.info.client_expiry = Some(seconds),
                Err(_) => warn!(value = text, "ignoring unreadable client expiry"),
            },
            ElementType::RegExp => {
                if !text.is_empty() {
                    if let Err(error) = self.info.list.add_regex_with_limit(
                        text,
                        self.source_id,
                        self.max_pattern_bytes,
                    ) {
                        warn!(%error, "skipping blacklist pattern");
                        self.info.rejected_patterns += 1;
                    }
                }
            }
            ElementType::Url => {
                if !text.is_empty() {
                    self.info.list.add_url(text, self.source_id);
                }
            }
            ElementType::Source => {
                if let Some(mut advisory) = self.advisory.take() {
                    advisory.text = text.to_owned();
                    self.info.list.add_advisory(advisory);
                }
            }
            ElementType::Other => {}
        }
        self.element = ElementType::Other;
        self.text.clear();
    }
}

impl TokenHandler for TrustInfoHandler {
    fn handle_token(&mut self, token: &XmlToken) -> CartaResult<()> {
        match token {
            XmlToken::StartTag {
                name, self_closing, ..
            } => {
                self.start_element(token, name);
                if *self_closing {
                    self.end_element();
                }
            }
            XmlToken::Text(text) => {
                if self.element != ElementType::Other {
                    self.text.push_str(text);
                }
            }
            XmlToken::EndTag { name } => {
                if ElementType::from_name(name) == self.element {
                    self.end_element();
                }
            }
        }
        Ok(())
    }
}

/// Incremental reader of one sitecheck answer.
#[derive(Debug)]
pub struct TrustInfoParser {
    xml: XmlParser,
    handler: TrustInfoHandler,
}

impl TrustInfoParser {
    /// `max_pattern_bytes` bounds each `<r>` pattern.
    pub fn new(max_pattern_bytes: usize) -> Self {
        Self {
            xml: XmlParser::new(),
            handler: TrustInfoHandler {
                element: ElementType::Other,
                source_id: 0,
                advisory: None,
                text: String::new(),
                max_pattern_bytes,
                info: TrustInfo::default(),
            },
        }
    }

    /// Parses the next piece of the answer.
    pub fn feed(&mut self, text: &str) -> CartaResult<()> {
        self.xml.feed(text, &mut self.handler)
    }

    pub fn is_stopped(&self) -> bool {
        self.xml.is_stopped()
    }

    /// Completes the document and returns what it listed.
    pub fn finish(mut self) -> CartaResult<TrustInfo> {
        self.xml.finish(&mut self.handler)?;
        let info = self.handler.info;
        debug!(
            host = info.host.as_deref().unwrap_or(""),
            urls = info.list.url_count(),
            patterns = info.list.regex_count(),
            "sitecheck answer parsed"
        );
        Ok(info)
    }
}

/// Parses a complete answer.
pub fn parse_trust_info(document: &str, max_pattern_bytes: usize) -> CartaResult<TrustInfo> {
    let mut parser = TrustInfoParser::new(max_pattern_bytes);
    parser.feed(document)?;
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::parse_trust_info;
    use carta_security::FraudType;
    use carta_security::MatchKind;
    use carta_security::TrustRating;
    use pretty_assertions::assert_eq;

    const ADVISORY_ANSWER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<trustinfo version="2.0">
  <host>evil.example.com</host>
  <ce>3600</ce>
  <r src="7">evil\.example\.com/.*</r>
  <u src="9">evil.example.com/exact</u>
  <source id="7" type="2" homepage="http://a" advisory="http://b">Bad site</source>
  <source id="9" type="1" homepage="http://c" advisory="http://d">Malware &amp; more</source>
</trustinfo>"#;

    #[test]
    fn reads_host_expiry_and_list() {
        let info = match parse_trust_info(ADVISORY_ANSWER, 4096) {
            Ok(info) => info,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(info.host.as_deref(), Some("evil.example.com"));
        assert_eq!(info.client_expiry, Some(3600));
        assert_eq!(info.list.regex_count(), 1);
        assert_eq!(info.list.url_count(), 1);
        assert_eq!(info.rejected_patterns, 0);

        let Some(found) = info.list.match_url("evil.example.com/x") else {
            panic!("pattern did not match");
        };
        assert_eq!(found.source_id, 7);
        assert_eq!(found.kind, MatchKind::Regex);

        let Some(advisory) = info.list.advisory(found.source_id) else {
            panic!("advisory 7 missing");
        };
        assert_eq!(advisory.fraud_type, FraudType::Phishing);
        assert_eq!(advisory.fraud_type.rating(), TrustRating::Phishing);
        assert_eq!(advisory.homepage, "http://a");
        assert_eq!(advisory.advisory_url, "http://b");
        assert_eq!(advisory.text, "Bad site");
    }

    #[test]
    fn literal_entry_wins_over_pattern() {
        let info = match parse_trust_info(ADVISORY_ANSWER, 4096) {
            Ok(info) => info,
            Err(error) => panic!("{error}"),
        };
        let Some(found) = info.list.match_url("evil.example.com/exact") else {
            panic!("literal did not match");
        };
        assert_eq!(found.kind, MatchKind::Literal);
        assert_eq!(found.source_id, 9);
        assert_eq!(
            info.list.advisory(9).map(|advisory| advisory.text.as_str()),
            Some("Malware & more")
        );
    }

    #[test]
    fn clean_answer_has_empty_list() {
        let info = match parse_trust_info("<trustinfo><host>good.test</host></trustinfo>", 4096) {
            Ok(info) => info,
            Err(error) => panic!("{error}"),
        };
        assert!(info.list.is_empty());
        assert_eq!(info.client_expiry, None);
    }

    #[test]
    fn bad_patterns_are_skipped() {
        let document = "<t><r src=\"1\">([x</r><r>aaaaaaaa</r><r src=\"2\">ok/.*</r><ce>soon</ce></t>";
        let info = match parse_trust_info(document, 6) {
            Ok(info) => info,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(info.rejected_patterns, 2);
        assert_eq!(info.list.patterns().collect::<Vec<_>>(), vec!["ok/.*"]);
        assert_eq!(info.client_expiry, None);
    }

    #[test]
    fn namespaced_and_self_closing_elements() {
        let document = "<s:t xmlns:s=\"urn:s\"><s:u s:src=\"3\">a.test/x</s:u><u src=\"4\"/></s:t>";
        let info = match parse_trust_info(document, 4096) {
            Ok(info) => info,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(info.list.is_url_listed("a.test/x"), Some(3));
        assert_eq!(info.list.url_count(), 1);
    }

    #[test]
    fn malformed_answer_fails() {
        assert!(matches!(
            parse_trust_info("<trustinfo><host>x</trustinfo>", 4096),
            Err(error) if error.code == "trust.xml.malformed"
        ));
    }
}
